//! Error taxonomy shared by the store, collector, and orchestrator.
//!
//! Database failures are split into four classes the retry wrapper branches
//! on; everything domain-level goes through [`IngestionError`] with a
//! machine-readable [`ErrorCode`].

use thiserror::Error;

/// Typed database failures surfaced by the transactional retry wrapper.
#[derive(Error, Debug)]
pub enum DbError {
    /// Deadlock persisted through every retry attempt.
    #[error("transaction '{operation}' deadlocked after {attempts} attempts")]
    Deadlock {
        operation: &'static str,
        attempts: u32,
    },

    /// Foreign-key or uniqueness violation. Never retried.
    #[error("constraint violated: {constraint}")]
    ConstraintViolation { constraint: String },

    /// Connection-class failure persisted through every retry attempt.
    #[error("transaction '{operation}' failed transiently after {attempts} attempts: {message}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    /// Any other database failure, tagged with the operation that hit it.
    #[error("transaction '{operation}' failed: {message}")]
    Transaction {
        operation: &'static str,
        message: String,
    },
}

/// Machine-readable codes for domain-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfig,
    JsonParse,
    HttpStatus,
    UnknownProvider,
    UpstreamProtocol,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::JsonParse => "json_parse",
            ErrorCode::HttpStatus => "http_status",
            ErrorCode::UnknownProvider => "unknown_provider",
            ErrorCode::UpstreamProtocol => "upstream_protocol",
        };
        write!(f, "{}", s)
    }
}

/// Domain-level ingestion failure carrying a machine-readable code.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct IngestionError {
    pub code: ErrorCode,
    pub message: String,
}

impl IngestionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for IngestionError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::JsonParse, e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_message_names_operation() {
        let err = DbError::Deadlock {
            operation: "create_mark",
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("create_mark"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_constraint_violation_carries_name() {
        let err = DbError::ConstraintViolation {
            constraint: "ingestions_one_open_per_provider".to_string(),
        };
        assert!(err.to_string().contains("ingestions_one_open_per_provider"));
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::InvalidConfig.to_string(), "invalid_config");
        assert_eq!(ErrorCode::HttpStatus.to_string(), "http_status");
    }

    #[test]
    fn test_ingestion_error_from_serde() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = IngestionError::from(parse_err);
        assert_eq!(err.code, ErrorCode::JsonParse);
    }
}
