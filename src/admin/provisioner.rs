//! SchemaProvisioner trait and its SQLite / HTTP adapters

use super::schema::{validate_name, SchemaDefinition};
use super::ProvisioningError;
use async_trait::async_trait;
use reqwest::StatusCode;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Idempotent schema lifecycle.
///
/// - `ensure_schema` twice is ok
/// - `delete_schema` of a missing schema is ok
#[async_trait]
pub trait SchemaProvisioner: Send + Sync {
    async fn ensure_schema(&self, definition: &SchemaDefinition) -> Result<(), ProvisioningError>;

    async fn delete_schema(&self, name: &str) -> Result<(), ProvisioningError>;

    async fn has_schema(&self, name: &str) -> Result<bool, ProvisioningError>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Ensure every definition, in order.
pub async fn ensure_all(
    provisioner: &dyn SchemaProvisioner,
    definitions: &[SchemaDefinition],
) -> Result<(), ProvisioningError> {
    log::info!("🔧 Ensuring {} schemas via {}", definitions.len(), provisioner.describe());
    for definition in definitions {
        provisioner.ensure_schema(definition).await?;
        log::info!("   ├─ ✅ {}", definition.name);
    }
    log::info!("   └─ All schemas present");
    Ok(())
}

/// Fail with [`ProvisioningError::MissingSchema`] on the first absent schema.
pub async fn verify_schemas(
    provisioner: &dyn SchemaProvisioner,
    names: &[&str],
) -> Result<(), ProvisioningError> {
    for name in names {
        if !provisioner.has_schema(name).await? {
            log::error!("❌ Required schema '{}' missing ({})", name, provisioner.describe());
            return Err(ProvisioningError::MissingSchema(name.to_string()));
        }
    }
    Ok(())
}

/// HTTP provisioner when an admin URL is configured, SQLite otherwise.
pub fn provisioner_from_config(
    admin_url: Option<&str>,
    db_path: &str,
) -> Result<Arc<dyn SchemaProvisioner>, ProvisioningError> {
    match admin_url {
        Some(url) => Ok(Arc::new(HttpProvisioner::new(url))),
        None => Ok(Arc::new(SqliteProvisioner::open(db_path)?)),
    }
}

/// Executes DDL against the local store and records what it applied in
/// `schema_registry`.
pub struct SqliteProvisioner {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteProvisioner {
    pub fn open(db_path: &str) -> Result<Self, ProvisioningError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_registry (
                name        TEXT PRIMARY KEY,
                ddl         TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_string(),
        })
    }
}

#[async_trait]
impl SchemaProvisioner for SqliteProvisioner {
    async fn ensure_schema(&self, definition: &SchemaDefinition) -> Result<(), ProvisioningError> {
        validate_name(&definition.name)?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = conn.transaction()?;
        tx.execute_batch(&definition.ddl)?;
        tx.execute(
            "INSERT INTO schema_registry (name, ddl, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
            rusqlite::params![
                definition.name,
                definition.ddl,
                chrono::Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn delete_schema(&self, name: &str) -> Result<(), ProvisioningError> {
        validate_name(name)?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = conn.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", name))?;
        tx.execute("DELETE FROM schema_registry WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(())
    }

    async fn has_schema(&self, name: &str) -> Result<bool, ProvisioningError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let registered = conn
            .query_row(
                "SELECT 1 FROM schema_registry WHERE name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let table_exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        Ok(registered && table_exists)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Remote admin API:
/// - `POST /schemas` (409 = already exists)
/// - `DELETE /schemas/{name}` (404 = already gone)
/// - `GET /schemas/{name}` (200 present, 404 absent)
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn unexpected(operation: &str, status: StatusCode) -> ProvisioningError {
        ProvisioningError::UnexpectedStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl SchemaProvisioner for HttpProvisioner {
    async fn ensure_schema(&self, definition: &SchemaDefinition) -> Result<(), ProvisioningError> {
        let response = self
            .client
            .post(format!("{}/schemas", self.base_url))
            .json(definition)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::CONFLICT => Ok(()),
            s => Err(Self::unexpected(&format!("ensure {}", definition.name), s)),
        }
    }

    async fn delete_schema(&self, name: &str) -> Result<(), ProvisioningError> {
        validate_name(name)?;
        let response = self
            .client
            .delete(format!("{}/schemas/{}", self.base_url, name))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(Self::unexpected(&format!("delete {}", name), s)),
        }
    }

    async fn has_schema(&self, name: &str) -> Result<bool, ProvisioningError> {
        validate_name(name)?;
        let response = self
            .client
            .get(format!("{}/schemas/{}", self.base_url, name))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::unexpected(&format!("check {}", name), s)),
        }
    }

    fn describe(&self) -> String {
        format!("admin-api:{}", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::schema::{builtin_definitions, REQUIRED_SCHEMAS};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/pitwall.db");
        let provisioner = SqliteProvisioner::open(path.to_str().unwrap()).unwrap();

        assert!(verify_schemas(&provisioner, &REQUIRED_SCHEMAS).await.is_err());

        let defs = builtin_definitions();
        ensure_all(&provisioner, &defs).await.unwrap();
        ensure_all(&provisioner, &defs).await.unwrap();

        verify_schemas(&provisioner, &REQUIRED_SCHEMAS).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let provisioner =
            SqliteProvisioner::open(dir.path().join("p.db").to_str().unwrap()).unwrap();

        provisioner.delete_schema("window_aggregates").await.unwrap();

        ensure_all(&provisioner, &builtin_definitions()).await.unwrap();
        provisioner.delete_schema("window_aggregates").await.unwrap();
        provisioner.delete_schema("window_aggregates").await.unwrap();

        assert!(!provisioner.has_schema("window_aggregates").await.unwrap());
        assert!(provisioner.has_schema("current_state").await.unwrap());

        match verify_schemas(&provisioner, &REQUIRED_SCHEMAS).await {
            Err(ProvisioningError::MissingSchema(name)) => assert_eq!(name, "window_aggregates"),
            other => panic!("expected MissingSchema, got {:?}", other.err()),
        }
    }

    type Registry = Arc<Mutex<HashSet<String>>>;

    async fn create(State(reg): State<Registry>, Json(def): Json<SchemaDefinition>) -> AxumStatus {
        if reg.lock().unwrap().insert(def.name) {
            AxumStatus::CREATED
        } else {
            AxumStatus::CONFLICT
        }
    }

    async fn fetch(State(reg): State<Registry>, UrlPath(name): UrlPath<String>) -> AxumStatus {
        if reg.lock().unwrap().contains(&name) {
            AxumStatus::OK
        } else {
            AxumStatus::NOT_FOUND
        }
    }

    async fn remove(State(reg): State<Registry>, UrlPath(name): UrlPath<String>) -> AxumStatus {
        if reg.lock().unwrap().remove(&name) {
            AxumStatus::NO_CONTENT
        } else {
            AxumStatus::NOT_FOUND
        }
    }

    async fn spawn_admin_api() -> String {
        let registry: Registry = Arc::new(Mutex::new(HashSet::new()));
        let app = Router::new()
            .route("/schemas", post(create))
            .route("/schemas/:name", get(fetch).delete(remove))
            .with_state(registry);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_conflict_and_not_found_count_as_success() {
        let base = spawn_admin_api().await;
        let provisioner = HttpProvisioner::new(&format!("{}/", base));

        let defs = builtin_definitions();
        ensure_all(&provisioner, &defs).await.unwrap();
        // Second ensure hits 409
        ensure_all(&provisioner, &defs).await.unwrap();
        verify_schemas(&provisioner, &REQUIRED_SCHEMAS).await.unwrap();

        provisioner.delete_schema("current_state").await.unwrap();
        // Second delete hits 404
        provisioner.delete_schema("current_state").await.unwrap();
        assert!(!provisioner.has_schema("current_state").await.unwrap());
    }
}
