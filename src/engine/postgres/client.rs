//! `PostgreSQL` Engine Adapter (container client)
//!
//! Drives `psql` inside a compose service. The password travels in `PGPASSWORD`.
//!
//! # Output Format
//! Unaligned mode (`-A`) with a tab field separator, no footer and `NULL` for SQL NULL.
//! Administrative calls add `-q` (no command tags) and `-t` (no header). REPL statements run
//! without `-q` so psql reports the command tag (`INSERT 0 3`, `CREATE TABLE`, ...), which is
//! how affected-row counts are recovered on this transport.
//!
//! # Sessions
//! Session `SET`s are replayed ahead of every later REPL statement. REPL calls set
//! `SHOW_ALL_RESULTS=off` so psql prints only the last statement's result and the replay
//! never shows up in the output.

use async_trait::async_trait;

use super::{create_database_sql, create_user_sql, grant_statements, set_timezone_sql};
use crate::engine::exec::{
    output_lines, session_effect, transaction_refused, ClientSession, ContainerExec, SessionEffect,
};
use crate::engine::{ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant, RowSet};
use crate::error::{DbkitError, Result};
use crate::safety::ResourceName;

/// Leading words psql prints as a command status
const COMMAND_TAGS: &[&str] = &[
    "ALTER", "ANALYZE", "BEGIN", "CALL", "COMMENT", "COMMIT", "COPY", "CREATE", "DELETE",
    "DISCARD", "DO", "DROP", "FETCH", "GRANT", "INSERT", "LISTEN", "MERGE", "MOVE", "NOTIFY",
    "REFRESH", "RESET", "REVOKE", "ROLLBACK", "SELECT", "SET", "TRUNCATE", "UPDATE", "VACUUM",
];

/// Tags whose trailing number is a row count
const COUNTING_TAGS: &[&str] = &["COPY", "DELETE", "FETCH", "INSERT", "MERGE", "MOVE", "SELECT", "UPDATE"];

/// `PostgreSQL` adapter that shells out to `psql` inside a container
pub struct PostgresClientAdapter {
    exec: ContainerExec,
    user: String,
    database: String,
    timezone: String,
    session: ClientSession,
}

impl PostgresClientAdapter {
    #[must_use]
    pub fn new(profile: &ConnectionProfile, service: &str) -> Self {
        Self {
            exec: ContainerExec::new(EngineKind::Postgres, service)
                .with_env("PGPASSWORD", profile.password.clone()),
            user: profile.user.clone(),
            database: profile.default_database.clone(),
            timezone: profile.timezone.clone(),
            session: ClientSession::default(),
        }
    }

    fn client_args(&self, database: &str, sql: &str, admin: bool) -> Vec<String> {
        let mut args: Vec<String> = ["psql", "-X"].iter().map(ToString::to_string).collect();
        if admin {
            args.push("-q".to_string());
            args.push("-t".to_string());
        } else {
            args.push("-v".to_string());
            args.push("SHOW_ALL_RESULTS=off".to_string());
        }
        for arg in ["-A", "-F", "\t", "-P", "footer=off", "-P", "null=NULL", "-v", "ON_ERROR_STOP=1"] {
            args.push(arg.to_string());
        }
        args.extend(["-U".to_string(), self.user.clone(), "-d".to_string(), database.to_string()]);
        args.extend(["-c".to_string(), sql.to_string()]);
        args
    }

    async fn admin_in(&self, database: &str, sql: &str) -> Result<Vec<String>> {
        let stdout = self.exec.run_admin(&self.client_args(database, sql, true)).await?;
        Ok(output_lines(&stdout))
    }

    async fn admin(&self, sql: &str) -> Result<Vec<String>> {
        self.admin_in(&self.database, sql).await
    }
}

#[async_trait]
impl EngineAdapter for PostgresClientAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let rows = self.admin(&format!("SELECT 1 FROM pg_database WHERE datname = '{name}'")).await?;
        Ok(!rows.is_empty())
    }

    async fn create_database(
        &mut self,
        name: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<()> {
        // CREATE DATABASE cannot share a transaction with the ALTER
        match self.admin(&create_database_sql(name, owner)).await {
            Ok(_) => {}
            Err(e) if is_duplicate(&e) => {}
            Err(e) => return Err(e),
        }
        self.admin(&set_timezone_sql(name, &self.timezone)).await.map(|_| ())
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.admin(&format!("DROP DATABASE \"{name}\"")).await.map(|_| ())
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let rows = self.admin(&format!("SELECT 1 FROM pg_roles WHERE rolname = '{name}'")).await?;
        Ok(!rows.is_empty())
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        match self.admin(&create_user_sql(name, password)).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.admin(&format!("DROP USER \"{name}\"")).await.map(|_| ())
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        let statements = grant_statements(grant);
        let (database_level, schema_level) = statements.split_at(1);

        for sql in database_level {
            self.admin(sql).await?;
        }
        self.admin_in(grant.target_database.as_str(), &schema_level.join("; ")).await?;
        Ok(())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.admin("SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname")
            .await
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        self.admin("SELECT rolname FROM pg_roles WHERE rolname NOT LIKE 'pg\\_%' ORDER BY rolname")
            .await
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        self.admin_in(
            database.as_str(),
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .await
    }

    async fn execute_raw(
        &mut self,
        _database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        let effect = session_effect(input);
        if effect == SessionEffect::OpenTransaction {
            return Err(transaction_refused(EngineKind::Postgres));
        }

        let script = self.session.script(input);
        let stdout = self.exec.run(&self.client_args(&self.database, &script, false), None).await?;
        if effect == SessionEffect::Setting {
            self.session.remember(input);
        }
        Ok(parse_psql_output(&stdout))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn is_duplicate(err: &DbkitError) -> bool {
    matches!(err, DbkitError::EngineError { detail, .. } if detail.contains("already exists"))
}

/// Classify unaligned psql output
fn parse_psql_output(stdout: &str) -> RawResult {
    let lines = output_lines(stdout);

    match lines.as_slice() {
        [] => RawResult::Message("OK".to_string()),
        [only] => command_status(only).unwrap_or_else(|| rows_from(&lines)),
        _ => rows_from(&lines),
    }
}

fn rows_from(lines: &[String]) -> RawResult {
    let Some((header, body)) = lines.split_first() else {
        return RawResult::Message("OK".to_string());
    };
    let columns = header.split('\t').map(str::to_string).collect();
    let rows = body
        .iter()
        .map(|line| {
            line.split('\t')
                .map(|field| {
                    if field == "NULL" {
                        serde_json::Value::Null
                    } else {
                        serde_json::Value::String(field.to_string())
                    }
                })
                .collect()
        })
        .collect();
    RawResult::Rows(RowSet { columns, rows })
}

/// Recognise `INSERT 0 3`, `UPDATE 2`, `CREATE TABLE`, ...
fn command_status(line: &str) -> Option<RawResult> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let first = *words.first()?;
    if !COMMAND_TAGS.contains(&first) {
        return None;
    }
    let tag_like = words
        .iter()
        .all(|w| w.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    if !tag_like {
        return None;
    }

    if COUNTING_TAGS.contains(&first) {
        if let Some(count) = words.last().and_then(|w| w.parse::<u64>().ok()) {
            return Some(RawResult::Affected(count));
        }
    }
    Some(RawResult::Message(line.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Transport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn adapter() -> PostgresClientAdapter {
        let profile = ConnectionProfile {
            engine: EngineKind::Postgres,
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "secret".to_string(),
            default_database: "postgres".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            transport: Transport::Container { service: "pg".to_string() },
        };
        PostgresClientAdapter::new(&profile, "pg")
    }

    #[test]
    fn test_admin_args() {
        let args = adapter().client_args("shop", "SELECT 1", true);
        assert_eq!(
            args,
            vec![
                "psql", "-X", "-q", "-t", "-A", "-F", "\t", "-P", "footer=off", "-P", "null=NULL",
                "-v", "ON_ERROR_STOP=1", "-U", "postgres", "-d", "shop", "-c", "SELECT 1"
            ]
        );
    }

    #[test]
    fn test_password_only_in_environment() {
        let a = adapter();
        let argv = a.exec.argv(&a.client_args("postgres", "SELECT 1", false));
        assert!(argv.contains(&"PGPASSWORD=secret".to_string()));
        assert_eq!(argv.iter().filter(|s| s.contains("secret")).count(), 1);
        assert!(!argv.contains(&"-q".to_string()));
    }

    #[test]
    fn test_parse_rows() {
        let out = "id\tname\n1\talice\n2\tNULL\n";
        assert_eq!(
            parse_psql_output(out),
            RawResult::Rows(RowSet {
                columns: vec!["id".to_string(), "name".to_string()],
                rows: vec![vec![json!("1"), json!("alice")], vec![json!("2"), json!(null)]],
            })
        );
    }

    #[test]
    fn test_parse_command_tags() {
        assert_eq!(parse_psql_output("INSERT 0 3\n"), RawResult::Affected(3));
        assert_eq!(parse_psql_output("UPDATE 2\n"), RawResult::Affected(2));
        assert_eq!(parse_psql_output("DELETE 0\n"), RawResult::Affected(0));
        assert_eq!(
            parse_psql_output("CREATE TABLE\n"),
            RawResult::Message("CREATE TABLE".to_string())
        );
    }

    #[test]
    fn test_single_header_line_is_rows() {
        assert_eq!(
            parse_psql_output("name\n"),
            RawResult::Rows(RowSet { columns: vec!["name".to_string()], rows: vec![] })
        );
        // lowercase is a column name, not a tag
        assert!(matches!(parse_psql_output("insert\n"), RawResult::Rows(_)));
    }

    #[test]
    fn test_empty_output_is_ok() {
        assert_eq!(parse_psql_output(""), RawResult::Message("OK".to_string()));
    }

    #[test]
    fn test_duplicate_detection() {
        assert!(is_duplicate(&DbkitError::engine_error(
            "pgsql",
            "ERROR:  database \"shop\" already exists"
        )));
        assert!(!is_duplicate(&DbkitError::engine_error("pgsql", "permission denied")));
        assert!(!is_duplicate(&DbkitError::query_failed("already exists")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_settings_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let stub = crate::engine::exec::write_stub_docker(
            dir.path(),
            r#"for arg in "$@"; do last="$arg"; done
printf '%s\n' "$last" >> "$(dirname "$0")/calls.log"
printf 'SET\n'"#,
        );
        let mut a = adapter();
        a.exec = a.exec.with_program(stub);

        assert_eq!(
            a.execute_raw(None, "SET search_path TO shop").await.unwrap(),
            RawResult::Message("SET".to_string())
        );
        a.execute_raw(None, "SELECT 1").await.unwrap();
        a.execute_raw(None, "SET LOCAL work_mem = '1MB'").await.unwrap();
        a.execute_raw(None, "SELECT 2").await.unwrap();

        let err = a.execute_raw(None, "START TRANSACTION").await.unwrap_err();
        assert!(matches!(err, DbkitError::QueryFailed(_)));

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec![
                "SET search_path TO shop",
                "SET search_path TO shop; SELECT 1",
                "SET search_path TO shop; SET LOCAL work_mem = '1MB'",
                "SET search_path TO shop; SELECT 2",
            ]
        );
    }

    #[test]
    fn test_repl_args_show_only_last_result() {
        let a = adapter();
        let args = a.client_args("postgres", "SET x TO 1; SELECT 1", false);
        let at = args.iter().position(|s| s == "SHOW_ALL_RESULTS=off").unwrap();
        assert_eq!(args[at - 1], "-v");
    }
}
