//! Schema lifecycle contract for the state/aggregate store
//!
//! `ensure_schema` and `delete_schema` are idempotent. StreamIngester only
//! checks `has_schema` for the required set and refuses to start otherwise;
//! creating schemas is an operator step (`pitwall_admin ensure`).

pub mod provisioner;
pub mod schema;

pub use provisioner::{
    ensure_all, provisioner_from_config, verify_schemas, HttpProvisioner, SchemaProvisioner,
    SqliteProvisioner,
};
pub use schema::{builtin_definitions, SchemaDefinition, REQUIRED_SCHEMAS};

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("required schema '{0}' is not provisioned")]
    MissingSchema(String),

    #[error("invalid schema definition: {0}")]
    InvalidDefinition(String),

    #[error("admin API returned {status} for {operation}")]
    UnexpectedStatus { operation: String, status: u16 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("admin API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
