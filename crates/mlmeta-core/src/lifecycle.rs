use crate::ContractError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const REDACTED_RUN_ID: &str = "REDACTED-RUN-ID";
pub const REDACTED_RUN_LINK: &str = "REDACTED-RUN-LINK";
pub const REDACTED_SOURCE: &str = "REDACTED-SOURCE-PATH";

/// Alias reserved for "highest version" lookups.
pub const RESERVED_LATEST_ALIAS: &str = "latest";

/// Tag key that marks a registered model as a prompt. Prompts and models share one name space.
pub const PROMPT_TAG_KEY: &str = "mlflow.prompt.is_prompt";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Active,
    Deleted,
}

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Active => "active",
            LifecycleStage::Deleted => "deleted",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LifecycleStage::Active),
            "deleted" => Some(LifecycleStage::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a model version.
///
/// `DeletedInternal` is the soft-delete marker. It is terminal, only reachable through
/// version deletion, and never accepted from callers: [`ModelVersionStage::from_str`]
/// only resolves the four user-facing stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelVersionStage {
    None,
    Staging,
    Production,
    Archived,
    #[serde(rename = "Deleted_Internal")]
    DeletedInternal,
}

impl ModelVersionStage {
    pub const USER_STAGES: [ModelVersionStage; 4] = [
        ModelVersionStage::None,
        ModelVersionStage::Staging,
        ModelVersionStage::Production,
        ModelVersionStage::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVersionStage::None => "None",
            ModelVersionStage::Staging => "Staging",
            ModelVersionStage::Production => "Production",
            ModelVersionStage::Archived => "Archived",
            ModelVersionStage::DeletedInternal => "Deleted_Internal",
        }
    }

    /// Staging and Production are the stages other versions can be archived out of.
    pub fn is_active(&self) -> bool {
        matches!(self, ModelVersionStage::Staging | ModelVersionStage::Production)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, ModelVersionStage::DeletedInternal)
    }

    /// Exact decode of the stored column value.
    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "None" => Some(ModelVersionStage::None),
            "Staging" => Some(ModelVersionStage::Staging),
            "Production" => Some(ModelVersionStage::Production),
            "Archived" => Some(ModelVersionStage::Archived),
            "Deleted_Internal" => Some(ModelVersionStage::DeletedInternal),
            _ => None,
        }
    }

    pub fn valid_stages() -> String {
        Self::USER_STAGES
            .iter()
            .map(|stage| stage.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ModelVersionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVersionStage {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        Self::USER_STAGES
            .into_iter()
            .find(|stage| stage.as_str().to_lowercase() == normalized)
            .ok_or_else(|| ContractError::InvalidStage {
                input: input.to_string(),
                valid: Self::valid_stages(),
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelVersionStatus {
    PendingRegistration,
    FailedRegistration,
    Ready,
}

impl ModelVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVersionStatus::PendingRegistration => "PENDING_REGISTRATION",
            ModelVersionStatus::FailedRegistration => "FAILED_REGISTRATION",
            ModelVersionStatus::Ready => "READY",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "PENDING_REGISTRATION" => Some(ModelVersionStatus::PendingRegistration),
            "FAILED_REGISTRATION" => Some(ModelVersionStatus::FailedRegistration),
            "READY" => Some(ModelVersionStatus::Ready),
            _ => None,
        }
    }
}

fn alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("valid regex"))
}

fn version_alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[vV][0-9]+$").expect("valid regex"))
}

/// Checks alias syntax and the two reserved forms, in that order.
pub fn validate_alias(alias: &str) -> Result<(), ContractError> {
    if !alias_pattern().is_match(alias) {
        return Err(ContractError::InvalidAliasSyntax {
            alias: alias.to_string(),
        });
    }

    if alias.eq_ignore_ascii_case(RESERVED_LATEST_ALIAS) {
        return Err(ContractError::ReservedLatestAlias);
    }

    if version_alias_pattern().is_match(alias) {
        return Err(ContractError::ReservedVersionAlias {
            alias: alias.to_string(),
        });
    }

    Ok(())
}

pub fn validate_model_name(name: &str) -> Result<(), ContractError> {
    if name.trim().is_empty() {
        return Err(ContractError::MissingField { field: "name" });
    }
    Ok(())
}

/// Parses the string form of a version number used on the request side.
pub fn parse_version(input: &str) -> Result<i64, ContractError> {
    input
        .trim()
        .parse::<i64>()
        .map_err(|_| ContractError::InvalidVersion {
            input: input.to_string(),
        })
}
