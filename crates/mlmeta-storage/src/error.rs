use mlmeta_core::ContractError;
use rusqlite::ffi;
use std::fmt;
use thiserror::Error;

/// Stable error codes handed to the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameterValue,
    ResourceDoesNotExist,
    ResourceAlreadyExists,
    InvalidState,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameterValue => "INVALID_PARAMETER_VALUE",
            ErrorCode::ResourceDoesNotExist => "RESOURCE_DOES_NOT_EXIST",
            ErrorCode::ResourceAlreadyExists => "RESOURCE_ALREADY_EXISTS",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    InvalidParameterValue(String),
    #[error("{0}")]
    ResourceDoesNotExist(String),
    #[error("{0}")]
    ResourceAlreadyExists(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::InvalidParameterValue(_) => ErrorCode::InvalidParameterValue,
            StoreError::ResourceDoesNotExist(_) => ErrorCode::ResourceDoesNotExist,
            StoreError::ResourceAlreadyExists(_) => ErrorCode::ResourceAlreadyExists,
            StoreError::InvalidState(_) => ErrorCode::InvalidState,
            StoreError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    pub(crate) fn internal(message: impl Into<String>, source: rusqlite::Error) -> Self {
        StoreError::Internal {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn internal_message(message: impl Into<String>) -> Self {
        StoreError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a failed statement, keeping domain errors that were already classified.
    pub(crate) fn wrap(message: &str) -> impl FnOnce(StoreError) -> StoreError + '_ {
        move |err| match err {
            StoreError::Internal {
                message: inner,
                source,
            } => StoreError::Internal {
                message: format!("{message}: {inner}"),
                source,
            },
            other => other,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::internal("sqlite error", err)
    }
}

impl From<ContractError> for StoreError {
    fn from(err: ContractError) -> Self {
        StoreError::InvalidParameterValue(err.to_string())
    }
}

/// True when the statement failed on a primary-key or unique constraint.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
                )
        }
        _ => false,
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

pub(crate) fn model_already_exists(
    name: &str,
    existing_is_prompt: bool,
    new_is_prompt: bool,
) -> String {
    let kind = |is_prompt: bool| if is_prompt { "prompt" } else { "registered model" };
    if existing_is_prompt != new_is_prompt {
        format!(
            "Tried to create a {} with name '{name}', but the name is already taken by a {}. \
             Prompts and registered models share one name space; choose a different name.",
            kind(new_is_prompt),
            kind(existing_is_prompt),
        )
    } else if new_is_prompt {
        format!("Prompt (name={name}) already exists.")
    } else {
        format!("Registered Model (name={name}) already exists.")
    }
}

pub(crate) fn registered_model_not_found(name: &str) -> StoreError {
    StoreError::ResourceDoesNotExist(format!("Registered Model with name={name} not found"))
}

pub(crate) fn model_version_not_found(name: &str, version: i64) -> StoreError {
    StoreError::ResourceDoesNotExist(format!(
        "Model Version (name={name}, version={version}) not found"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint_failure(extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(extended_code), None)
    }

    #[test]
    fn unique_and_primary_key_failures_are_duplicates() {
        assert!(is_unique_violation(&constraint_failure(
            ffi::SQLITE_CONSTRAINT_UNIQUE
        )));
        assert!(is_unique_violation(&constraint_failure(
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )));
        assert!(!is_unique_violation(&constraint_failure(
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        )));
        assert!(!is_unique_violation(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn contract_errors_become_invalid_parameter_value() {
        let err: StoreError = ContractError::ReservedLatestAlias.into();
        assert_eq!(err.code(), ErrorCode::InvalidParameterValue);
        assert_eq!(err.code().as_str(), "INVALID_PARAMETER_VALUE");
    }

    #[test]
    fn wrap_prefixes_internal_errors_only() {
        let internal = StoreError::wrap("error renaming model")(StoreError::internal_message(
            "disk I/O error",
        ));
        assert_eq!(internal.to_string(), "error renaming model: disk I/O error");

        let missing = StoreError::wrap("error renaming model")(registered_model_not_found("a"));
        assert_eq!(missing.code(), ErrorCode::ResourceDoesNotExist);
    }

    #[test]
    fn conflict_message_names_both_kinds() {
        let message = model_already_exists("summarizer", false, true);
        assert!(message.contains("Tried to create a prompt with name 'summarizer'"));
        assert!(message.contains("already taken by a registered model"));
        assert_eq!(
            model_already_exists("clf", false, false),
            "Registered Model (name=clf) already exists."
        );
    }
}
