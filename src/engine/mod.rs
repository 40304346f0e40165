//! Database Engine Adapters and Core Types
//!
//! This module defines the uniform resource-lifecycle contract every engine implements.
//! Each engine (`MySQL`, `PostgreSQL`, `MongoDB`) ships two adapters behind the same trait:
//!
//! - a native adapter speaking the wire protocol through the engine's Rust driver
//! - a client adapter that shells out to the engine's own CLI inside a container
//!   (`docker compose exec`), see [`exec`]
//!
//! Callers receive a `Box<dyn EngineAdapter>` from [`open_adapter`] and never learn which
//! transport is in effect.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions.
//!
//! # Identifiers
//! Every method that takes a name takes a [`ResourceName`], which only
//! [`crate::safety::validate_identifier`] can produce. Adapters interpolate those names into
//! DDL text (placeholders are not available for identifiers); values such as passwords go
//! through placeholders where the protocol allows it and are quote-escaped where it does not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DbkitError, Result};
use crate::safety::ResourceName;

pub mod exec;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mongo")]
pub mod mongo;

/// Upper bound for opening a native connection (statement execution is unbounded)
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// `MySQL` / `MariaDB` protocol
    MySql,
    /// `PostgreSQL` protocol
    Postgres,
    /// `MongoDB` protocol
    Mongo,
}

impl EngineKind {
    /// Engine name as used on the command line and in error messages
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "pgsql",
            Self::Mongo => "mongo",
        }
    }

    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
            Self::Mongo => 27017,
        }
    }

    #[must_use]
    pub const fn default_user(&self) -> &'static str {
        match self {
            Self::MySql | Self::Mongo => "root",
            Self::Postgres => "postgres",
        }
    }

    /// Database the administrative connection lands in (empty: none selected)
    #[must_use]
    pub const fn default_database(&self) -> &'static str {
        match self {
            Self::MySql => "",
            Self::Postgres => "postgres",
            Self::Mongo => "admin",
        }
    }

    /// Compose service name used by the container transport
    #[must_use]
    pub const fn default_service(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Mongo => "mongo",
        }
    }

    /// Whether this engine speaks SQL (statements end with `;` in the REPL)
    #[must_use]
    pub const fn is_relational(&self) -> bool {
        !matches!(self, Self::Mongo)
    }

    /// Default role/privilege for a grant that did not name one
    #[must_use]
    pub const fn default_role(&self) -> &'static str {
        match self {
            Self::MySql | Self::Postgres => "ALL",
            Self::Mongo => "readWrite",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an adapter reaches its engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Driver connection straight to host:port
    Native,
    /// The engine's own CLI run inside a compose service
    Container { service: String },
}

/// Connection profile for one command invocation
///
/// Built once by [`crate::config::resolve_profile`] and never mutated afterwards.
/// An empty password is legal (trust/anonymous auth).
#[derive(Clone, Serialize)]
pub struct ConnectionProfile {
    /// Database engine type
    pub engine: EngineKind,

    /// Hostname
    pub host: String,

    /// Port number
    pub port: u16,

    /// Username
    pub user: String,

    /// Password
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(skip_serializing)]
    pub password: String,

    /// Database the connection opens in (may be empty for `MySQL`)
    pub default_database: String,

    /// Timezone stamped on newly created `PostgreSQL` databases
    pub timezone: String,

    /// Selected transport
    #[serde(skip_serializing)]
    pub transport: Transport,
}

impl ConnectionProfile {
    /// Same profile, logging in as a different principal
    #[must_use]
    pub fn for_login(&self, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self { user: user.into(), password: password.into(), ..self.clone() }
    }
}

impl std::fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("default_database", &self.default_database)
            .field("timezone", &self.timezone)
            .field("transport", &self.transport)
            .finish()
    }
}

/// A single privilege-assignment request
///
/// Relational engines read `role` as a privilege level (`ALL`, `SELECT`, ...);
/// the document store reads it as a built-in role name (`readWrite`, `dbOwner`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub principal: ResourceName,
    pub role: ResourceName,
    pub target_database: ResourceName,
}

/// Tabular result: ordered column names plus ordered rows of nullable scalars
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Column names in result set
    pub columns: Vec<String>,

    /// Result rows, one value per column (`Null` for SQL NULL)
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Outcome of a raw REPL statement or command
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// Statement produced a result set
    Rows(RowSet),
    /// Statement changed rows (INSERT/UPDATE/DELETE, DDL reports 0)
    Affected(u64),
    /// Command-only clients that cannot report a count, and informational replies
    Message(String),
    /// Document-store replies (one JSON document per line when rendered)
    Documents(Vec<serde_json::Value>),
}

/// Uniform resource-lifecycle contract
///
/// `create_*` methods are only called after the matching `*_exists` returned false; they do
/// not re-check. Two concurrent invocations can both pass the check, so every
/// implementation prefers native "if not exists" semantics or catches the engine's
/// duplicate-object error. Databases swallow the duplicate; users report it, because the
/// losing invocation's password was never applied.
#[async_trait]
pub trait EngineAdapter: Send {
    /// Engine this adapter talks to
    fn kind(&self) -> EngineKind;

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool>;

    async fn create_database(
        &mut self,
        name: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<()>;

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()>;

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool>;

    /// Create a login with `password`
    ///
    /// Returns `false` when the user already existed (created concurrently after the
    /// existence check); `password` was not applied in that case.
    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool>;

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()>;

    /// Apply a grant; partial failure of a multi-statement grant is reported, not rolled back
    async fn grant(&mut self, grant: &RoleGrant) -> Result<()>;

    async fn list_databases(&mut self) -> Result<Vec<String>>;

    async fn list_users(&mut self) -> Result<Vec<String>>;

    /// Tables (relational) or collections (document store) of `database`
    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>>;

    /// Run one REPL statement/command
    ///
    /// `database` is the REPL's tracked current database (document store only; relational
    /// sessions pass `None`). Statement-level failures come back as `QueryFailed`.
    async fn execute_raw(
        &mut self,
        database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult>;

    /// Release the connection (idempotent)
    async fn close(&mut self) -> Result<()>;
}

/// Open the adapter selected by `profile.engine` and `profile.transport`
///
/// # Errors
/// `ConnectionFailed` when a native connection cannot be established within
/// [`CONNECT_TIMEOUT`], `ConfigError` when the engine was compiled out.
pub async fn open_adapter(profile: &ConnectionProfile) -> Result<Box<dyn EngineAdapter>> {
    tracing::debug!(
        engine = %profile.engine,
        host = %profile.host,
        port = profile.port,
        user = %profile.user,
        transport = ?profile.transport,
        "opening adapter"
    );

    match profile.engine {
        #[cfg(feature = "mysql")]
        EngineKind::MySql => match &profile.transport {
            Transport::Native => Ok(Box::new(mysql::MySqlAdapter::connect(profile).await?)),
            Transport::Container { service } => {
                Ok(Box::new(mysql::client::MySqlClientAdapter::new(profile, service)))
            }
        },

        #[cfg(feature = "postgres")]
        EngineKind::Postgres => match &profile.transport {
            Transport::Native => Ok(Box::new(postgres::PostgresAdapter::connect(profile).await?)),
            Transport::Container { service } => {
                Ok(Box::new(postgres::client::PostgresClientAdapter::new(profile, service)))
            }
        },

        #[cfg(feature = "mongo")]
        EngineKind::Mongo => match &profile.transport {
            Transport::Native => Ok(Box::new(mongo::MongoAdapter::connect(profile).await?)),
            Transport::Container { service } => {
                Ok(Box::new(mongo::client::MongoClientAdapter::new(profile, service)))
            }
        },

        #[allow(unreachable_patterns)]
        other => Err(DbkitError::config_error(format!(
            "dbkit was built without the '{other}' engine"
        ))),
    }
}

/// Combine an operation's result with the adapter's close result
///
/// The operation's own error wins; a failed close only surfaces after a successful operation.
///
/// # Errors
/// The operation's error, else the close error.
pub fn settle_close<T>(outcome: Result<T>, closed: Result<()>) -> Result<T> {
    let value = outcome?;
    closed?;
    Ok(value)
}

/// Run a connection future under [`CONNECT_TIMEOUT`]
pub(crate) async fn with_connect_timeout<T, F>(engine: EngineKind, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(CONNECT_TIMEOUT, fut).await.map_err(|_| {
        DbkitError::connection_failed(format!(
            "Timed out after {}s connecting to {engine}",
            CONNECT_TIMEOUT.as_secs()
        ))
    })?
}
