//! Database connection management.

use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle. Cheap to clone; all clones share one connection.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "rocksdb://path", "ws://host:port", ...
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "mgmt".to_string(),
            database: "jobs".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for a remote server shared by several processes.
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `JOBS_DB_ENDPOINT` (default `mem://`)
    /// - `JOBS_DB_NAMESPACE`
    /// - `JOBS_DB_DATABASE`
    /// - `JOBS_DB_USER` / `JOBS_DB_PASS` (both required for authentication)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`DbConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).and_then(non_empty);
        let defaults = Self::default();

        Self {
            endpoint: read("JOBS_DB_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: read("JOBS_DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: read("JOBS_DB_DATABASE").unwrap_or(defaults.database),
            credentials: read("JOBS_DB_USER").zip(read("JOBS_DB_PASS")),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Surreal(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// A concurrent writer touched the same records first.
    ///
    /// Optimistic updates treat this like a lost compare-and-set.
    pub fn is_conflict(&self) -> bool {
        use surrealdb::error::{Api, Db};

        let retryable = Db::TxRetryable.to_string();
        match self {
            DbError::Surreal(surrealdb::Error::Db(Db::TxRetryable)) => true,
            // A failed commit reports its cause inside each statement's error.
            DbError::Surreal(surrealdb::Error::Db(err)) => err.to_string().contains(&retryable),
            // Remote engines only carry the rendered server error.
            DbError::Surreal(surrealdb::Error::Api(Api::Query(message))) => {
                message.contains(&retryable)
            }
            _ => false,
        }
    }
}

/// Connect to the database described by `config`.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = any::connect(config.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
