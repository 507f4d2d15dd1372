//! Database backend identity.
//!
//! The backend is only consulted for two capabilities: how many bound
//! parameters a single statement may carry, and whether the cursor column
//! can hold a structured value natively.

use choreo_core::{ErrorCode, IngestionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Postgres,
    MySql,
    Sqlite,
    Unknown,
}

impl DatabaseEngine {
    /// Detect the engine from a connection URL scheme.
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split("://").next().unwrap_or("").to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => DatabaseEngine::Postgres,
            "mysql" | "mariadb" => DatabaseEngine::MySql,
            "sqlite" => DatabaseEngine::Sqlite,
            _ => DatabaseEngine::Unknown,
        }
    }

    /// Conservative ceiling on bound parameters per statement.
    ///
    /// Unknown backends get the most restrictive limit.
    pub fn max_bind_params(&self) -> usize {
        match self {
            DatabaseEngine::Postgres => 60_000,
            DatabaseEngine::MySql => 30_000,
            DatabaseEngine::Sqlite => 900,
            DatabaseEngine::Unknown => 900,
        }
    }

    /// Largest number of rows per statement when each row binds `binds_per_row`
    /// parameters.
    pub fn batch_size(&self, binds_per_row: usize) -> usize {
        (self.max_bind_params() / binds_per_row.max(1)).max(1)
    }

    /// Whether the backend stores the cursor as a native structured value.
    pub fn supports_structured_column(&self) -> bool {
        matches!(self, DatabaseEngine::Postgres | DatabaseEngine::MySql)
    }
}

// ── Cursor codec ──────────────────────────────────────────────

/// Encode a cursor for storage on this backend.
///
/// Backends without structured columns get the cursor serialized to a JSON
/// string; structured backends store it as-is.
pub fn encode_cursor(engine: DatabaseEngine, cursor: &serde_json::Value) -> serde_json::Value {
    if engine.supports_structured_column() {
        cursor.clone()
    } else {
        serde_json::Value::String(cursor.to_string())
    }
}

/// Decode a stored cursor back into its structured form.
pub fn decode_cursor(
    engine: DatabaseEngine,
    stored: serde_json::Value,
) -> Result<serde_json::Value, IngestionError> {
    if engine.supports_structured_column() {
        return Ok(stored);
    }
    match stored {
        serde_json::Value::String(raw) => serde_json::from_str(&raw).map_err(|e| {
            IngestionError::new(
                ErrorCode::JsonParse,
                format!("stored cursor is not valid JSON: {}", e),
            )
        }),
        // Tolerate structured values written before a backend switch.
        other => Ok(other),
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_from_url() {
        assert_eq!(
            DatabaseEngine::from_url("postgres://localhost/x"),
            DatabaseEngine::Postgres
        );
        assert_eq!(
            DatabaseEngine::from_url("postgresql://localhost/x"),
            DatabaseEngine::Postgres
        );
        assert_eq!(
            DatabaseEngine::from_url("mysql://localhost/x"),
            DatabaseEngine::MySql
        );
        assert_eq!(
            DatabaseEngine::from_url("sqlite://data.db"),
            DatabaseEngine::Sqlite
        );
        assert_eq!(
            DatabaseEngine::from_url("mssql://localhost/x"),
            DatabaseEngine::Unknown
        );
    }

    #[test]
    fn test_unknown_engine_gets_most_restrictive_limit() {
        assert_eq!(
            DatabaseEngine::Unknown.max_bind_params(),
            DatabaseEngine::Sqlite.max_bind_params()
        );
    }

    #[test]
    fn test_batch_size_accounts_for_binds_per_row() {
        assert_eq!(DatabaseEngine::Sqlite.batch_size(3), 300);
        assert_eq!(DatabaseEngine::Sqlite.batch_size(1), 900);
        // Never zero, even with absurd row widths.
        assert_eq!(DatabaseEngine::Sqlite.batch_size(10_000), 1);
    }

    #[test]
    fn test_structured_cursor_passthrough() {
        let cursor = json!({"phase": "projects", "current_org_index": 2});
        let stored = encode_cursor(DatabaseEngine::Postgres, &cursor);
        assert_eq!(stored, cursor);
        let decoded = decode_cursor(DatabaseEngine::Postgres, stored).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_serialized_cursor_roundtrip() {
        let cursor = json!({"phase": "orgs", "org_queue": ["acme", "globex"]});
        let stored = encode_cursor(DatabaseEngine::Sqlite, &cursor);
        assert!(stored.is_string());
        let decoded = decode_cursor(DatabaseEngine::Sqlite, stored).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_decode_rejects_garbage_string() {
        let stored = serde_json::Value::String("{not json".to_string());
        let err = decode_cursor(DatabaseEngine::Sqlite, stored).unwrap_err();
        assert_eq!(err.code, ErrorCode::JsonParse);
    }
}
