pub mod entities;
pub mod lifecycle;
pub mod metrics;

pub use entities::*;
pub use lifecycle::{
    parse_version, validate_alias, validate_model_name, LifecycleStage, ModelVersionStage,
    ModelVersionStatus,
};
pub use metrics::{sanitize_value, select_latest, supersedes, MetricOrdering};

use chrono::Utc;
use thiserror::Error;

/// Validation failures raised by the pure domain rules, before any storage is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("Invalid Model Version stage: {input}. Value must be one of {valid}.")]
    InvalidStage { input: String, valid: String },
    #[error(
        "Invalid alias name: {alias}. Names may only contain alphanumerics, underscores (_), and dashes (-)."
    )]
    InvalidAliasSyntax { alias: String },
    #[error("'latest' alias name (case insensitive) is reserved.")]
    ReservedLatestAlias,
    #[error("Version alias name '{alias}' is reserved.")]
    ReservedVersionAlias { alias: String },
    #[error("Model version must be an integer, got '{input}'")]
    InvalidVersion { input: String },
    #[error("Missing value for required parameter '{field}'.")]
    MissingField { field: &'static str },
    #[error(
        "Model version transition cannot archive existing model versions because '{stage}' is not an Active stage. Valid stages are {valid}"
    )]
    ArchiveRequiresActiveStage { stage: String, valid: String },
}

/// Current wall-clock time as epoch milliseconds, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
