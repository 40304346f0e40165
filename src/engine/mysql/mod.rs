//! MySQL Engine Adapter (native driver)
//!
//! This module implements [`EngineAdapter`] for MySQL servers (including MariaDB).
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Existence checks and listings are parameterized (`?` placeholders)
//! - DDL identifiers are validated [`ResourceName`]s quoted with backticks
//! - Users are created and dropped at host `'%'`
//! - MySQL has no database owner; ownership is expressed as `ALL PRIVILEGES` on the schema
//! - MySQL has no per-database timezone; new schemas get `utf8mb4` instead
//! - BLOB data is Base64-encoded when rendered
//! - Raw statements are classified by whether the server returned a column set

use async_trait::async_trait;
use mysql_async::{prelude::*, Conn, OptsBuilder, Row, Value};

use crate::engine::{
    with_connect_timeout, ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant,
    RowSet,
};
use crate::error::{DbkitError, Result};
use crate::safety::ResourceName;

pub mod client;

const ENGINE: &str = "mysql";

/// MySQL adapter over a single native connection
pub struct MySqlAdapter {
    conn: Option<Conn>,
}

impl MySqlAdapter {
    /// Open a connection described by `profile`
    ///
    /// # Errors
    /// `ConnectionFailed` when the server is unreachable or rejects the credentials.
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        if profile.engine != EngineKind::MySql {
            return Err(DbkitError::invalid_input(format!(
                "Expected MySQL engine, got {}",
                profile.engine
            )));
        }

        let opts = build_mysql_opts(profile);
        let conn = with_connect_timeout(EngineKind::MySql, async {
            Conn::new(opts).await.map_err(|e| {
                DbkitError::connection_failed(format!(
                    "Failed to connect to MySQL at {}:{}: {e}",
                    profile.host, profile.port
                ))
            })
        })
        .await?;

        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbkitError::engine_error(ENGINE, "Connection already closed"))
    }

    async fn run_ddl(&mut self, sql: String, what: &str) -> Result<()> {
        tracing::debug!(engine = ENGINE, "{what}");
        self.conn()?
            .query_drop(sql)
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to {what}: {e}")))
    }

    async fn count(&mut self, sql: &str, name: &ResourceName, what: &str) -> Result<i64> {
        let count: Option<i64> = self
            .conn()?
            .exec_first(sql, (name.as_str(),))
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to check {what}: {e}")))?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let count = self
            .count(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?",
                name,
                "database",
            )
            .await?;
        Ok(count > 0)
    }

    async fn create_database(
        &mut self,
        name: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<()> {
        tracing::debug!(engine = ENGINE, database = %name, "no per-database timezone, skipping");
        self.run_ddl(create_database_sql(name), "create database").await?;

        if let Some(owner) = owner {
            self.run_ddl(grant_sql("ALL PRIVILEGES", name, owner), "grant ownership").await?;
            self.run_ddl(FLUSH_PRIVILEGES.to_string(), "flush privileges").await?;
        }

        Ok(())
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.run_ddl(format!("DROP DATABASE `{name}`"), "drop database").await
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let count =
            self.count("SELECT COUNT(*) FROM mysql.user WHERE user = ?", name, "user").await?;
        Ok(count > 0)
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        // CREATE USER takes no placeholders for the password clause
        match self.conn()?.query_drop(create_user_sql(name, password)).await {
            Ok(()) => Ok(true),
            Err(mysql_async::Error::Server(ref e)) if e.code == ER_CANNOT_USER => {
                tracing::debug!(engine = ENGINE, user = %name, "user appeared concurrently");
                Ok(false)
            }
            Err(e) => Err(DbkitError::engine_error(
                ENGINE,
                format!("Failed to create user '{name}': {e}"),
            )),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.run_ddl(format!("DROP USER `{name}`@'%'"), "drop user").await
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        let privilege = privilege_clause(&grant.role);
        self.run_ddl(
            grant_sql(&privilege, &grant.target_database, &grant.principal),
            "grant privileges",
        )
        .await?;
        self.run_ddl(FLUSH_PRIVILEGES.to_string(), "flush privileges").await
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.conn()?
            .query("SELECT schema_name FROM information_schema.schemata ORDER BY schema_name")
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to list databases: {e}")))
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        self.conn()?
            .query("SELECT CONCAT(user, '@', host) FROM mysql.user ORDER BY user, host")
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to list users: {e}")))
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        self.conn()?
            .exec(
                "SELECT table_name FROM information_schema.tables
                 WHERE table_schema = ?
                 ORDER BY table_name",
                (database.as_str(),),
            )
            .await
            .map_err(|e| {
                DbkitError::engine_error(
                    ENGINE,
                    format!("Failed to list tables in '{database}': {e}"),
                )
            })
    }

    async fn execute_raw(
        &mut self,
        _database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        execute_statement(self.conn()?, input).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await.map_err(|e| {
                DbkitError::engine_error(ENGINE, format!("Failed to disconnect: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Build MySQL connection options from a profile
fn build_mysql_opts(profile: &ConnectionProfile) -> OptsBuilder {
    let password = (!profile.password.is_empty()).then(|| profile.password.clone());
    let database =
        (!profile.default_database.is_empty()).then(|| profile.default_database.clone());

    OptsBuilder::default()
        .ip_or_hostname(profile.host.clone())
        .tcp_port(profile.port)
        .user(Some(profile.user.clone()))
        .pass(password)
        .db_name(database)
}

const FLUSH_PRIVILEGES: &str = "FLUSH PRIVILEGES";

/// `ER_CANNOT_USER`: CREATE USER for an account that already exists
const ER_CANNOT_USER: u16 = 1396;

fn create_database_sql(name: &ResourceName) -> String {
    format!("CREATE DATABASE IF NOT EXISTS `{name}` DEFAULT CHARACTER SET utf8mb4")
}

fn create_user_sql(name: &ResourceName, password: &str) -> String {
    format!("CREATE USER `{name}`@'%' IDENTIFIED BY '{}'", escape_literal(password))
}

fn grant_sql(privilege: &str, database: &ResourceName, user: &ResourceName) -> String {
    format!("GRANT {privilege} ON `{database}`.* TO `{user}`@'%'")
}

/// Escape a value for a single-quoted MySQL string literal
fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// `ALL` means `ALL PRIVILEGES`; anything else is a single privilege keyword
fn privilege_clause(role: &ResourceName) -> String {
    if role.as_str().eq_ignore_ascii_case("all") {
        "ALL PRIVILEGES".to_string()
    } else {
        role.as_str().to_ascii_uppercase()
    }
}

/// Execute one raw statement and classify the result
async fn execute_statement(conn: &mut Conn, statement: &str) -> Result<RawResult> {
    let mut result = conn
        .query_iter(statement)
        .await
        .map_err(|e| DbkitError::query_failed(e.to_string()))?;

    let columns: Vec<String> =
        result.columns_ref().iter().map(|c| c.name_str().to_string()).collect();

    if columns.is_empty() {
        let affected = result.affected_rows();
        result.drop_result().await.map_err(|e| DbkitError::query_failed(e.to_string()))?;
        return Ok(RawResult::Affected(affected));
    }

    let rows: Vec<Row> = result.collect().await.map_err(|e| DbkitError::query_failed(e.to_string()))?;
    result.drop_result().await.map_err(|e| DbkitError::query_failed(e.to_string()))?;

    let mut data = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(row.as_ref(idx).map_or(serde_json::Value::Null, mysql_value_to_json));
        }
        data.push(values);
    }

    Ok(RawResult::Rows(RowSet { columns, rows: data }))
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => {
            // Try to convert to UTF-8 string first
            if let Ok(s) = std::str::from_utf8(bytes) {
                serde_json::Value::String(s.to_string())
            } else {
                // Binary data - encode as Base64
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }

        Value::Int(i) => serde_json::Value::Number((*i).into()),

        Value::UInt(u) => serde_json::json!(*u),

        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // NaN/Infinity

        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),

        Value::Date(year, month, day, hour, minute, second, micro) => {
            let s = if (*hour, *minute, *second, *micro) == (0, 0, 0, 0) {
                format!("{year:04}-{month:02}-{day:02}")
            } else if *micro == 0 {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            } else {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micro:06}"
                )
            };
            serde_json::Value::String(s)
        }

        Value::Time(is_negative, days, hours, minutes, seconds, micro) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            let s = if *micro == 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micro:06}")
            };
            serde_json::Value::String(s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Transport;
    use crate::safety::{validate_identifier, IdentKind};

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            engine: EngineKind::MySql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "password".to_string(),
            default_database: String::new(),
            timezone: "Asia/Shanghai".to_string(),
            transport: Transport::Native,
        }
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("plain"), "plain");
        assert_eq!(escape_literal("it's"), "it''s");
        assert_eq!(escape_literal(r"back\slash"), r"back\\slash");
        assert_eq!(escape_literal(r"\'"), r"\\''");
    }

    #[test]
    fn test_ddl_text() {
        let db = validate_identifier("shop", IdentKind::Database).unwrap();
        let user = validate_identifier("bob", IdentKind::User).unwrap();
        assert_eq!(
            create_database_sql(&db),
            "CREATE DATABASE IF NOT EXISTS `shop` DEFAULT CHARACTER SET utf8mb4"
        );
        assert_eq!(
            create_user_sql(&user, "p'w"),
            "CREATE USER `bob`@'%' IDENTIFIED BY 'p''w'"
        );
        assert_eq!(
            grant_sql("ALL PRIVILEGES", &db, &user),
            "GRANT ALL PRIVILEGES ON `shop`.* TO `bob`@'%'"
        );
    }

    #[test]
    fn test_privilege_clause() {
        let all = validate_identifier("all", IdentKind::Privilege).unwrap();
        assert_eq!(privilege_clause(&all), "ALL PRIVILEGES");
        let select = validate_identifier("select", IdentKind::Privilege).unwrap();
        assert_eq!(privilege_clause(&select), "SELECT");
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(mysql_value_to_json(&Value::NULL), serde_json::Value::Null);
        assert_eq!(mysql_value_to_json(&Value::Int(-3)), serde_json::json!(-3));
        assert_eq!(mysql_value_to_json(&Value::UInt(1)), serde_json::json!(1));
        assert_eq!(mysql_value_to_json(&Value::Bytes(b"abc".to_vec())), serde_json::json!("abc"));
        assert_eq!(
            mysql_value_to_json(&Value::Bytes(vec![0xff, 0xfe])),
            serde_json::json!("//4=")
        );
        assert_eq!(mysql_value_to_json(&Value::Double(f64::NAN)), serde_json::Value::Null);
        assert_eq!(
            mysql_value_to_json(&Value::Date(2024, 2, 29, 0, 0, 0, 0)),
            serde_json::json!("2024-02-29")
        );
        assert_eq!(
            mysql_value_to_json(&Value::Date(2024, 2, 29, 13, 5, 9, 0)),
            serde_json::json!("2024-02-29 13:05:09")
        );
        assert_eq!(
            mysql_value_to_json(&Value::Time(true, 1, 2, 3, 4, 0)),
            serde_json::json!("-26:03:04")
        );
    }

    #[tokio::test]
    async fn test_connect_wrong_engine() {
        let mut config = profile();
        config.engine = EngineKind::Postgres;

        let result = MySqlAdapter::connect(&config).await;
        assert!(result.is_err());
        assert!(result.err().unwrap().message().contains("Expected MySQL engine"));
    }

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_lifecycle_round_trip() {
        let mut adapter = MySqlAdapter::connect(&profile()).await.unwrap();
        let db = validate_identifier("dbkit_it_db", IdentKind::Database).unwrap();

        if adapter.database_exists(&db).await.unwrap() {
            adapter.drop_database(&db).await.unwrap();
        }
        adapter.create_database(&db, None).await.unwrap();
        assert!(adapter.database_exists(&db).await.unwrap());
        assert!(adapter.list_databases().await.unwrap().contains(&"dbkit_it_db".to_string()));
        adapter.drop_database(&db).await.unwrap();
        assert!(!adapter.database_exists(&db).await.unwrap());

        let result = adapter.execute_raw(None, "SELECT 1").await.unwrap();
        match result {
            RawResult::Rows(set) => assert_eq!(set.rows, vec![vec![serde_json::json!(1)]]),
            other => panic!("unexpected {other:?}"),
        }
        adapter.close().await.unwrap();
    }
}
