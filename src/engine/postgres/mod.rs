//! `PostgreSQL` Engine Adapter (native driver)
//!
//! This module implements [`EngineAdapter`] for `PostgreSQL` servers.
//!
//! # Features
//! - Client-server connections via TCP
//! - Database ownership, UTF-8 encoding and a site timezone on `create-db`
//! - Four-step grants (database, schema usage, tables, sequences)
//! - Typed result conversion for common column types, text fallback for the rest
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - Grants on tables/sequences and `tables <db>` need a session *inside* the target database,
//!   so they open a short-lived secondary connection with the same credentials
//! - Duplicate database/role errors (SQLSTATE `42P04`/`42710`) count as success
//! - JSON/JSONB preserved as nested JSON
//! - BYTEA data is Base64-encoded for JSON safety

use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row, SimpleQueryMessage};

use async_trait::async_trait;

use crate::engine::{
    with_connect_timeout, ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant,
    RowSet, CONNECT_TIMEOUT,
};
use crate::error::{DbkitError, Result};
use crate::safety::ResourceName;

pub mod client;

const ENGINE: &str = "pgsql";

/// `PostgreSQL` adapter over a single native connection
pub struct PostgresAdapter {
    client: Option<Client>,
    pg_config: Config,
    timezone: String,
}

impl PostgresAdapter {
    /// Connect to the profile's default database
    ///
    /// # Errors
    /// `ConnectionFailed` when the server is unreachable or rejects the credentials.
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        // Validate config is for PostgreSQL
        if profile.engine != EngineKind::Postgres {
            return Err(DbkitError::invalid_input(format!(
                "Expected PostgreSQL engine, got {}",
                profile.engine
            )));
        }

        let pg_config = build_pg_config(profile);
        let client = open_client(&pg_config).await?;

        Ok(Self { client: Some(client), pg_config, timezone: profile.timezone.clone() })
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DbkitError::engine_error(ENGINE, "Connection already closed"))
    }

    /// Same credentials, different database
    async fn connect_to(&self, database: &ResourceName) -> Result<Client> {
        let mut config = self.pg_config.clone();
        config.dbname(database.as_str());
        open_client(&config).await
    }

    async fn exists(&self, sql: &str, name: &ResourceName, what: &str) -> Result<bool> {
        let row = self
            .client()?
            .query_opt(sql, &[&name.as_str()])
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to check {what}: {e}")))?;
        Ok(row.is_some())
    }

    async fn single_column(&self, client: &Client, sql: &str, what: &str) -> Result<Vec<String>> {
        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to list {what}: {e}")))?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0).map_err(|e| {
                    DbkitError::engine_error(ENGINE, format!("Failed to read {what}: {e}"))
                })
            })
            .collect()
    }
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        self.exists("SELECT 1 FROM pg_database WHERE datname = $1", name, "database").await
    }

    async fn create_database(
        &mut self,
        name: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<()> {
        let client = self.client()?;
        tracing::debug!(engine = ENGINE, database = %name, "creating database");

        match client.batch_execute(&create_database_sql(name, owner)).await {
            Ok(()) => {}
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => {
                tracing::debug!(engine = ENGINE, database = %name, "database appeared concurrently");
            }
            Err(e) => {
                return Err(DbkitError::engine_error(
                    ENGINE,
                    format!("Failed to create database: {e}"),
                ))
            }
        }

        client.batch_execute(&set_timezone_sql(name, &self.timezone)).await.map_err(|e| {
            DbkitError::engine_error(ENGINE, format!("Failed to set database timezone: {e}"))
        })
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.client()?
            .batch_execute(&format!("DROP DATABASE \"{name}\""))
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to drop database: {e}")))
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        self.exists("SELECT 1 FROM pg_roles WHERE rolname = $1", name, "user").await
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        match self.client()?.batch_execute(&create_user_sql(name, password)).await {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                tracing::debug!(engine = ENGINE, user = %name, "user appeared concurrently");
                Ok(false)
            }
            // Never echo the statement: it carries the password
            Err(e) => Err(DbkitError::engine_error(
                ENGINE,
                format!("Failed to create user '{name}': {}", describe(&e)),
            )),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.client()?
            .batch_execute(&format!("DROP USER \"{name}\""))
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to drop user: {e}")))
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        let statements = grant_statements(grant);
        let (database_level, schema_level) = statements.split_at(1);

        for sql in database_level {
            self.client()?.batch_execute(sql).await.map_err(|e| {
                DbkitError::engine_error(ENGINE, format!("Failed to grant privileges: {e}"))
            })?;
        }

        let target = self.connect_to(&grant.target_database).await?;
        for sql in schema_level {
            target.batch_execute(sql).await.map_err(|e| {
                DbkitError::engine_error(ENGINE, format!("Failed to grant privileges: {e}"))
            })?;
        }

        Ok(())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        let client = self.client()?;
        self.single_column(
            client,
            "SELECT datname::text FROM pg_database WHERE datistemplate = false ORDER BY datname",
            "databases",
        )
        .await
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        let client = self.client()?;
        self.single_column(
            client,
            "SELECT rolname::text FROM pg_roles WHERE rolname NOT LIKE 'pg\\_%' ORDER BY rolname",
            "users",
        )
        .await
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        let target = self.connect_to(database).await?;
        self.single_column(
            &target,
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            "tables",
        )
        .await
    }

    async fn execute_raw(
        &mut self,
        _database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        execute_statement(self.client()?, input).await
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client ends the spawned connection task
        self.client.take();
        Ok(())
    }
}

/// Build `PostgreSQL` connection config from a profile
fn build_pg_config(profile: &ConnectionProfile) -> Config {
    let mut pg_config = Config::new();
    pg_config
        .host(&profile.host)
        .port(profile.port)
        .user(&profile.user)
        .dbname(&profile.default_database)
        .connect_timeout(CONNECT_TIMEOUT);
    if !profile.password.is_empty() {
        pg_config.password(&profile.password);
    }
    pg_config
}

async fn open_client(pg_config: &Config) -> Result<Client> {
    let (client, connection) = with_connect_timeout(EngineKind::Postgres, async {
        pg_config.connect(NoTls).await.map_err(|e| {
            DbkitError::connection_failed(format!("Failed to connect to PostgreSQL: {e}"))
        })
    })
    .await?;

    // Note: Connection errors are not logged to prevent credential leakage
    tokio::spawn(async move {
        let _ = connection.await;
    });

    Ok(client)
}

/// Escape a value for a single-quoted literal (`standard_conforming_strings` is on)
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn create_database_sql(name: &ResourceName, owner: Option<&ResourceName>) -> String {
    let owner_clause = owner.map(|o| format!(" OWNER \"{o}\"")).unwrap_or_default();
    format!("CREATE DATABASE \"{name}\" WITH{owner_clause} ENCODING 'UTF8' TEMPLATE template0")
}

fn set_timezone_sql(name: &ResourceName, timezone: &str) -> String {
    format!("ALTER DATABASE \"{name}\" SET timezone TO '{}'", escape_literal(timezone))
}

fn create_user_sql(name: &ResourceName, password: &str) -> String {
    format!("CREATE USER \"{name}\" WITH PASSWORD '{}'", escape_literal(password))
}

/// Statements for one grant: the first runs in the admin session, the rest inside the
/// target database
///
/// `ALL` grants everything at every level. Any other privilege (`SELECT`, `INSERT`, ...) is
/// applied to tables only; the database level then gets `CONNECT` so the grant is usable.
fn grant_statements(grant: &RoleGrant) -> Vec<String> {
    let RoleGrant { principal, role, target_database } = grant;
    let all = role.as_str().eq_ignore_ascii_case("all");

    let mut statements = Vec::with_capacity(4);
    if all {
        statements.push(format!(
            "GRANT ALL PRIVILEGES ON DATABASE \"{target_database}\" TO \"{principal}\""
        ));
    } else {
        statements.push(format!("GRANT CONNECT ON DATABASE \"{target_database}\" TO \"{principal}\""));
    }
    statements.push(format!("GRANT USAGE ON SCHEMA public TO \"{principal}\""));

    let table_privilege =
        if all { "ALL PRIVILEGES".to_string() } else { role.as_str().to_ascii_uppercase() };
    statements.push(format!(
        "GRANT {table_privilege} ON ALL TABLES IN SCHEMA public TO \"{principal}\""
    ));
    if all {
        statements.push(format!(
            "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public TO \"{principal}\""
        ));
    }
    statements
}

/// Execute one raw statement and classify the result
async fn execute_statement(client: &Client, statement: &str) -> Result<RawResult> {
    let stmt = client.prepare(statement).await.map_err(|e| DbkitError::query_failed(describe(&e)))?;

    // Non-SELECT query (INSERT, UPDATE, DELETE, DDL)
    if stmt.columns().is_empty() {
        let rows_affected =
            client.execute(&stmt, &[]).await.map_err(|e| DbkitError::query_failed(describe(&e)))?;
        return Ok(RawResult::Affected(rows_affected));
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

    if stmt.columns().iter().all(|c| is_typed(c.type_())) {
        let rows =
            client.query(&stmt, &[]).await.map_err(|e| DbkitError::query_failed(describe(&e)))?;
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            data.push(row_to_json(columns.len(), row)?);
        }
        return Ok(RawResult::Rows(RowSet { columns, rows: data }));
    }

    // NUMERIC, arrays, network types, ...: let the server render text
    let messages = client
        .simple_query(statement)
        .await
        .map_err(|e| DbkitError::query_failed(describe(&e)))?;
    let rows = messages
        .iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|idx| {
                        row.get(idx).map_or(serde_json::Value::Null, |v| {
                            serde_json::Value::String(v.to_string())
                        })
                    })
                    .collect(),
            ),
            _ => None,
        })
        .collect();

    Ok(RawResult::Rows(RowSet { columns, rows }))
}

/// Server message without the driver's "db error: " prefix
fn describe(err: &tokio_postgres::Error) -> String {
    err.as_db_error().map_or_else(|| err.to_string(), |db| db.message().to_string())
}

/// Column types converted through [`postgres_value_to_json`]
fn is_typed(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::VARCHAR
            | Type::TEXT
            | Type::BPCHAR
            | Type::NAME
            | Type::JSON
            | Type::JSONB
            | Type::BYTEA
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::DATE
            | Type::TIME
            | Type::UUID
    )
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(width: usize, row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..width).map(|idx| postgres_value_to_json(row, idx)).collect()
}

fn typed<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, what: &str) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| DbkitError::query_failed(format!("Failed to get {what} value: {e}")))
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_();

    let value = match *col_type {
        Type::BOOL => typed::<bool>(row, idx, "boolean")?.map(Value::Bool),

        // Integers
        Type::INT2 => typed::<i16>(row, idx, "i16")?.map(|v| Value::Number(v.into())),
        Type::INT4 => typed::<i32>(row, idx, "i32")?.map(|v| Value::Number(v.into())),
        Type::INT8 => typed::<i64>(row, idx, "i64")?.map(|v| Value::Number(v.into())),
        Type::OID => typed::<u32>(row, idx, "oid")?.map(|v| Value::Number(v.into())),

        // Floats (NaN/Infinity become null)
        Type::FLOAT4 => typed::<f32>(row, idx, "f32")?
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number),
        Type::FLOAT8 => typed::<f64>(row, idx, "f64")?
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),

        // JSON types
        Type::JSON | Type::JSONB => typed::<Value>(row, idx, "JSON")?,

        // BYTEA (binary data) - encode as Base64
        Type::BYTEA => typed::<Vec<u8>>(row, idx, "bytea")?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),

        // Timestamps - convert to ISO 8601 strings
        Type::TIMESTAMP => typed::<chrono::NaiveDateTime>(row, idx, "timestamp")?
            .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => typed::<chrono::DateTime<chrono::Utc>>(row, idx, "timestamptz")?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => typed::<chrono::NaiveDate>(row, idx, "date")?
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => typed::<chrono::NaiveTime>(row, idx, "time")?
            .map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),

        Type::UUID => typed::<uuid::Uuid>(row, idx, "UUID")?.map(|v| Value::String(v.to_string())),

        // Text types (VARCHAR, TEXT, CHAR, NAME)
        _ => typed::<String>(row, idx, "string")?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Transport;
    use crate::safety::{validate_identifier, IdentKind};
    use pretty_assertions::assert_eq;

    fn name(s: &str) -> ResourceName {
        validate_identifier(s, IdentKind::Database).unwrap()
    }

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            engine: EngineKind::Postgres,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            default_database: "postgres".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            transport: Transport::Native,
        }
    }

    #[test]
    fn test_build_pg_config() {
        let config = build_pg_config(&profile());
        assert_eq!(config.get_user(), Some("postgres"));
        assert_eq!(config.get_dbname(), Some("postgres"));
        assert_eq!(config.get_ports(), &[5432]);
        assert_eq!(config.get_password(), Some(b"postgres".as_slice()));
    }

    #[test]
    fn test_empty_password_is_not_sent() {
        let mut p = profile();
        p.password = String::new();
        assert_eq!(build_pg_config(&p).get_password(), None);
    }

    #[test]
    fn test_create_database_sql() {
        assert_eq!(
            create_database_sql(&name("shop"), None),
            "CREATE DATABASE \"shop\" WITH ENCODING 'UTF8' TEMPLATE template0"
        );
        assert_eq!(
            create_database_sql(&name("shop"), Some(&name("alice"))),
            "CREATE DATABASE \"shop\" WITH OWNER \"alice\" ENCODING 'UTF8' TEMPLATE template0"
        );
        assert_eq!(
            set_timezone_sql(&name("shop"), "Asia/Shanghai"),
            "ALTER DATABASE \"shop\" SET timezone TO 'Asia/Shanghai'"
        );
    }

    #[test]
    fn test_literals_are_escaped() {
        assert_eq!(
            create_user_sql(&name("bob"), "it's"),
            "CREATE USER \"bob\" WITH PASSWORD 'it''s'"
        );
        assert_eq!(
            set_timezone_sql(&name("shop"), "x'; DROP TABLE t; --"),
            "ALTER DATABASE \"shop\" SET timezone TO 'x''; DROP TABLE t; --'"
        );
    }

    #[test]
    fn test_grant_all_sequence() {
        let grant = RoleGrant { principal: name("bob"), role: name("ALL"), target_database: name("shop") };
        assert_eq!(
            grant_statements(&grant),
            vec![
                "GRANT ALL PRIVILEGES ON DATABASE \"shop\" TO \"bob\"",
                "GRANT USAGE ON SCHEMA public TO \"bob\"",
                "GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA public TO \"bob\"",
                "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public TO \"bob\"",
            ]
        );
    }

    #[test]
    fn test_grant_single_privilege() {
        let grant =
            RoleGrant { principal: name("bob"), role: name("select"), target_database: name("shop") };
        assert_eq!(
            grant_statements(&grant),
            vec![
                "GRANT CONNECT ON DATABASE \"shop\" TO \"bob\"",
                "GRANT USAGE ON SCHEMA public TO \"bob\"",
                "GRANT SELECT ON ALL TABLES IN SCHEMA public TO \"bob\"",
            ]
        );
    }

    #[test]
    fn test_typed_columns() {
        assert!(is_typed(&Type::INT4));
        assert!(is_typed(&Type::JSONB));
        assert!(!is_typed(&Type::NUMERIC));
        assert!(!is_typed(&Type::INT4_ARRAY));
    }

    #[tokio::test]
    async fn test_connect_wrong_engine() {
        let mut p = profile();
        p.engine = EngineKind::MySql;
        let result = PostgresAdapter::connect(&p).await;
        assert!(result.is_err());
        assert!(result.err().unwrap().message().contains("Expected PostgreSQL engine"));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_execute_select_query() {
        let mut adapter = PostgresAdapter::connect(&profile()).await.unwrap();
        let result = adapter
            .execute_raw(None, "SELECT 1 AS one, NULL::text AS nothing, 2.5::numeric AS n")
            .await
            .unwrap();
        match result {
            RawResult::Rows(set) => {
                assert_eq!(set.columns, vec!["one", "nothing", "n"]);
                assert_eq!(
                    set.rows,
                    vec![vec![
                        serde_json::json!("1"),
                        serde_json::Value::Null,
                        serde_json::json!("2.5")
                    ]]
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        let result = adapter.execute_raw(None, "SELECT 1 AS one").await.unwrap();
        assert_eq!(
            result,
            RawResult::Rows(RowSet {
                columns: vec!["one".to_string()],
                rows: vec![vec![serde_json::json!(1)]]
            })
        );
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_malformed_statement_is_query_failure() {
        let mut adapter = PostgresAdapter::connect(&profile()).await.unwrap();
        let err = adapter.execute_raw(None, "SELEC 1").await.unwrap_err();
        assert!(matches!(err, DbkitError::QueryFailed(_)));
        assert!(err.message().contains("syntax error"));
    }
}
