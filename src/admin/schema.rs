//! Storage schema definitions
//!
//! A schema is a named table plus its idempotent DDL. The name doubles as the
//! table name, so it is restricted to `[A-Za-z0-9_]`.

use super::ProvisioningError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CURRENT_STATE: &str = "current_state";
pub const WINDOW_AGGREGATES: &str = "window_aggregates";
pub const SESSIONS: &str = "sessions";

/// Schemas StreamIngester refuses to start without.
pub const REQUIRED_SCHEMAS: [&str; 3] = [CURRENT_STATE, WINDOW_AGGREGATES, SESSIONS];

const CURRENT_STATE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS current_state (
    session_id          TEXT NOT NULL,
    car_number          TEXT NOT NULL,
    metric_name         TEXT NOT NULL,
    value               TEXT NOT NULL,
    timestamp_monotonic INTEGER NOT NULL,
    event_time_utc      TEXT NOT NULL,
    updated_at          INTEGER NOT NULL,
    PRIMARY KEY (session_id, car_number, metric_name)
);
"#;

const WINDOW_AGGREGATES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS window_aggregates (
    session_id      TEXT NOT NULL,
    window_start_ms INTEGER NOT NULL,
    window_end_ms   INTEGER NOT NULL,
    car_number      TEXT NOT NULL,
    metric_name     TEXT NOT NULL,
    sample_count    INTEGER NOT NULL,
    value_sum       REAL NOT NULL,
    value_min       REAL NOT NULL,
    value_max       REAL NOT NULL,
    finalized       INTEGER NOT NULL DEFAULT 0,
    folded_ts       TEXT NOT NULL DEFAULT '[]',
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (session_id, window_start_ms, window_end_ms, car_number, metric_name)
);
CREATE INDEX IF NOT EXISTS idx_window_aggregates_car
    ON window_aggregates (session_id, car_number);
"#;

const SESSIONS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id           TEXT PRIMARY KEY,
    status               TEXT NOT NULL,
    finalize_deadline_ms INTEGER,
    closed_at_ms         INTEGER,
    archived             INTEGER NOT NULL DEFAULT 0,
    updated_at           INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub ddl: String,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>, ddl: impl Into<String>) -> Result<Self, ProvisioningError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            ddl: ddl.into(),
        })
    }
}

pub fn validate_name(name: &str) -> Result<(), ProvisioningError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(ProvisioningError::InvalidDefinition(format!(
            "schema name '{}' must be an identifier",
            name
        )))
    }
}

/// The `current_state`, `window_aggregates` and `sessions` definitions.
pub fn builtin_definitions() -> Vec<SchemaDefinition> {
    vec![
        SchemaDefinition {
            name: CURRENT_STATE.to_string(),
            ddl: CURRENT_STATE_DDL.trim().to_string(),
        },
        SchemaDefinition {
            name: WINDOW_AGGREGATES.to_string(),
            ddl: WINDOW_AGGREGATES_DDL.trim().to_string(),
        },
        SchemaDefinition {
            name: SESSIONS.to_string(),
            ddl: SESSIONS_DDL.trim().to_string(),
        },
    ]
}

/// Load definitions from `.sql` files in `dir`, sorted by file name.
///
/// `01_current_state.sql` defines schema `current_state`: a leading numeric
/// ordering prefix is stripped from the file stem. Files must use
/// `IF NOT EXISTS` clauses.
pub fn load_definitions(dir: &str) -> Result<Vec<SchemaDefinition>, ProvisioningError> {
    let schema_path = Path::new(dir);
    if !schema_path.is_dir() {
        return Err(ProvisioningError::InvalidDefinition(format!(
            "schema directory not found: {}",
            dir
        )));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    sql_files.sort();

    let mut definitions = Vec::with_capacity(sql_files.len());
    for path in sql_files {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let name = stem
            .split_once('_')
            .filter(|(prefix, _)| prefix.chars().all(|c| c.is_ascii_digit()))
            .map(|(_, rest)| rest)
            .unwrap_or(stem);

        let ddl = fs::read_to_string(&path)?;
        definitions.push(SchemaDefinition::new(name, ddl)?);
    }

    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtins_cover_required_schemas() {
        let names: Vec<_> = builtin_definitions().into_iter().map(|d| d.name).collect();
        for required in REQUIRED_SCHEMAS {
            assert!(names.iter().any(|n| n == required));
        }
    }

    #[test]
    fn test_rejects_non_identifier_names() {
        assert!(SchemaDefinition::new("current_state", "").is_ok());
        assert!(SchemaDefinition::new("drop table; --", "").is_err());
        assert!(SchemaDefinition::new("1abc", "").is_err());
        assert!(SchemaDefinition::new("", "").is_err());
    }

    #[test]
    fn test_load_definitions_strips_order_prefix() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("02_window_aggregates.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("01_current_state.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("readme.md"), "ignored").unwrap();

        let defs = load_definitions(dir.path().to_str().unwrap()).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["current_state", "window_aggregates"]);
    }

    #[test]
    fn test_load_definitions_missing_dir() {
        assert!(load_definitions("/definitely/not/here").is_err());
    }
}
