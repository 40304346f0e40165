//! MySQL Engine Adapter (container client)
//!
//! Drives the `mysql` command-line client inside a compose service. The password travels
//! in `MYSQL_PWD` so it never appears in the client's argument list.
//!
//! # Output Format
//! `--batch` prints a tab-separated header line followed by one line per row. Tabs,
//! newlines, backslashes and NUL inside values are escaped (`\t`, `\n`, `\\`, `\0`);
//! SQL NULL prints as the bare word `NULL`. Statements without a result set print
//! nothing, so the affected-row count is not available on this transport.
//!
//! # Sessions
//! `USE <db>` moves later REPL statements to `-D <db>` once the client accepted it, and
//! session `SET`s are replayed ahead of every later statement, see
//! [`crate::engine::exec::ClientSession`].

use async_trait::async_trait;

use super::{create_database_sql, create_user_sql, grant_sql, privilege_clause, FLUSH_PRIVILEGES};
use crate::engine::exec::{
    output_lines, session_effect, transaction_refused, ClientSession, ContainerExec, SessionEffect,
};
use crate::engine::{ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant, RowSet};
use crate::error::{DbkitError, Result};
use crate::safety::{validate_identifier, IdentKind, ResourceName};

/// MySQL adapter that shells out to `mysql` inside a container
pub struct MySqlClientAdapter {
    exec: ContainerExec,
    user: String,
    database: String,
    /// Database REPL statements run in (changed by `USE`)
    session_database: String,
    session: ClientSession,
}

impl MySqlClientAdapter {
    #[must_use]
    pub fn new(profile: &ConnectionProfile, service: &str) -> Self {
        Self {
            exec: ContainerExec::new(EngineKind::MySql, service)
                .with_env("MYSQL_PWD", profile.password.clone()),
            user: profile.user.clone(),
            database: profile.default_database.clone(),
            session_database: profile.default_database.clone(),
            session: ClientSession::default(),
        }
    }

    fn client_args(&self, database: &str, sql: &str, headers: bool) -> Vec<String> {
        let mut args = vec!["mysql".to_string(), "--batch".to_string()];
        if !headers {
            args.push("--skip-column-names".to_string());
        }
        args.push("-u".to_string());
        args.push(self.user.clone());
        if !database.is_empty() {
            args.push("-D".to_string());
            args.push(database.to_string());
        }
        args.push("-e".to_string());
        args.push(sql.to_string());
        args
    }

    /// Run administrative SQL, discarding output
    async fn admin(&self, sql: &str) -> Result<()> {
        self.exec.run_admin(&self.client_args(&self.database, sql, false)).await.map(|_| ())
    }

    /// Run administrative SQL returning the first column of every row
    async fn column(&self, sql: &str) -> Result<Vec<String>> {
        let stdout = self.exec.run_admin(&self.client_args(&self.database, sql, false)).await?;
        Ok(output_lines(&stdout)
            .iter()
            .map(|line| unescape_field(line.split('\t').next().unwrap_or_default()))
            .collect())
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        let values = self.column(sql).await?;
        Ok(values.first().and_then(|v| v.trim().parse().ok()).unwrap_or(0))
    }
}

#[async_trait]
impl EngineAdapter for MySqlClientAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let count = self
            .count(&format!(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = '{name}'"
            ))
            .await?;
        Ok(count > 0)
    }

    async fn create_database(
        &mut self,
        name: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<()> {
        tracing::debug!(engine = "mysql", database = %name, "no per-database timezone, skipping");
        let mut script = create_database_sql(name);
        if let Some(owner) = owner {
            script.push_str("; ");
            script.push_str(&grant_sql("ALL PRIVILEGES", name, owner));
            script.push_str("; ");
            script.push_str(FLUSH_PRIVILEGES);
        }
        self.admin(&script).await
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.admin(&format!("DROP DATABASE `{name}`")).await
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let count = self.count(&format!("SELECT COUNT(*) FROM mysql.user WHERE user = '{name}'")).await?;
        Ok(count > 0)
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        match self.admin(&create_user_sql(name, password)).await {
            Ok(()) => Ok(true),
            Err(e) if is_existing_user(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.admin(&format!("DROP USER `{name}`@'%'")).await
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        let privilege = privilege_clause(&grant.role);
        let script = format!(
            "{}; {FLUSH_PRIVILEGES}",
            grant_sql(&privilege, &grant.target_database, &grant.principal)
        );
        self.admin(&script).await
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.column("SELECT schema_name FROM information_schema.schemata ORDER BY schema_name")
            .await
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        self.column("SELECT CONCAT(user, '@', host) FROM mysql.user ORDER BY user, host").await
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        self.column(&format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{database}' ORDER BY table_name"
        ))
        .await
    }

    async fn execute_raw(
        &mut self,
        _database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        match session_effect(input) {
            SessionEffect::OpenTransaction => Err(transaction_refused(EngineKind::MySql)),
            SessionEffect::UseDatabase(database) => {
                let database = validate_identifier(&database, IdentKind::Database)?;
                // The client rejects an unknown database before running anything
                self.exec.run(&self.client_args(database.as_str(), "DO 0", false), None).await?;
                self.session_database = database.to_string();
                Ok(RawResult::Message("Database changed".to_string()))
            }
            effect => {
                let script = self.session.script(input);
                let stdout =
                    self.exec.run(&self.client_args(&self.session_database, &script, true), None).await?;
                if effect == SessionEffect::Setting {
                    self.session.remember(input);
                }
                Ok(parse_batch_output(&stdout))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The client reports `ER_CANNOT_USER` as `ERROR 1396 (HY000) ...` on stderr
fn is_existing_user(err: &DbkitError) -> bool {
    matches!(err, DbkitError::EngineError { detail, .. } if detail.contains("ERROR 1396"))
}

/// Parse `mysql --batch` output (header line first)
fn parse_batch_output(stdout: &str) -> RawResult {
    let lines = output_lines(stdout);
    let Some((header, body)) = lines.split_first() else {
        return RawResult::Message("OK".to_string());
    };

    let columns: Vec<String> = header.split('\t').map(unescape_field).collect();
    let rows = body
        .iter()
        .map(|line| {
            line.split('\t')
                .map(|field| {
                    if field == "NULL" {
                        serde_json::Value::Null
                    } else {
                        serde_json::Value::String(unescape_field(field))
                    }
                })
                .collect()
        })
        .collect();

    RawResult::Rows(RowSet { columns, rows })
}

/// Undo `--batch` escaping of a single field
fn unescape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Transport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn adapter(database: &str) -> MySqlClientAdapter {
        let profile = ConnectionProfile {
            engine: EngineKind::MySql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "pw".to_string(),
            default_database: database.to_string(),
            timezone: "Asia/Shanghai".to_string(),
            transport: Transport::Container { service: "mysql".to_string() },
        };
        MySqlClientAdapter::new(&profile, "mysql")
    }

    #[test]
    fn test_client_args_keep_password_out_of_argv() {
        let argv = adapter("").exec.argv(&adapter("").client_args("", "SELECT 1", true));
        assert_eq!(
            argv,
            vec![
                "compose", "exec", "-T", "-e", "MYSQL_PWD=pw", "mysql", "mysql", "--batch", "-u",
                "root", "-e", "SELECT 1"
            ]
        );
        assert!(!argv.iter().any(|a| a == "-ppw" || a == "--password=pw"));
    }

    #[test]
    fn test_client_args_listing_mode() {
        let a = adapter("shop");
        let args = a.client_args(&a.database, "SHOW TABLES", false);
        assert_eq!(
            args,
            vec!["mysql", "--batch", "--skip-column-names", "-u", "root", "-D", "shop", "-e", "SHOW TABLES"]
        );
    }

    #[test]
    fn test_parse_batch_rows() {
        let out = "id\tname\tnote\n1\talice\tNULL\n2\tbob\tline\\nbreak\n";
        let RawResult::Rows(set) = parse_batch_output(out) else {
            panic!("expected rows");
        };
        assert_eq!(set.columns, vec!["id", "name", "note"]);
        assert_eq!(
            set.rows,
            vec![
                vec![json!("1"), json!("alice"), json!(null)],
                vec![json!("2"), json!("bob"), json!("line\nbreak")],
            ]
        );
    }

    #[test]
    fn test_parse_header_only_result() {
        let RawResult::Rows(set) = parse_batch_output("id\n") else {
            panic!("expected rows");
        };
        assert_eq!(set.columns, vec!["id"]);
        assert!(set.rows.is_empty());
    }

    #[test]
    fn test_parse_empty_output_is_ok_message() {
        assert_eq!(parse_batch_output(""), RawResult::Message("OK".to_string()));
    }

    #[test]
    fn test_unescape_field() {
        assert_eq!(unescape_field(r"a\tb"), "a\tb");
        assert_eq!(unescape_field(r"c:\\dir"), r"c:\dir");
        assert_eq!(unescape_field(r"nul\0"), "nul\0");
        assert_eq!(unescape_field(r"odd\q"), r"odd\q");
        assert_eq!(unescape_field("trailing\\"), "trailing\\");
    }

    #[test]
    fn test_existing_user_detection() {
        assert!(is_existing_user(&DbkitError::engine_error(
            "mysql",
            "ERROR 1396 (HY000) at line 1: Operation CREATE USER failed for 'bob'@'%'"
        )));
        assert!(!is_existing_user(&DbkitError::engine_error("mysql", "ERROR 1045 (28000)")));
        assert!(!is_existing_user(&DbkitError::query_failed("ERROR 1396")));
    }

    /// Stub that logs every invocation and fails for `-D nope` and for CREATE USER
    #[cfg(unix)]
    fn stubbed(dir: &std::path::Path) -> MySqlClientAdapter {
        let stub = crate::engine::exec::write_stub_docker(
            dir,
            r#"printf '%s\n' "$*" >> "$(dirname "$0")/calls.log"
case "$*" in
  *"-D nope"*) echo "ERROR 1049 (42000): Unknown database 'nope'" >&2; exit 1 ;;
  *"CREATE USER"*) echo "ERROR 1396 (HY000) at line 1: Operation CREATE USER failed" >&2; exit 1 ;;
esac
printf 'x\n1\n'"#,
        );
        let mut a = adapter("");
        a.exec = a.exec.with_program(stub);
        a
    }

    #[cfg(unix)]
    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_keeps_database_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = stubbed(dir.path());

        a.execute_raw(None, "SET @a = 1").await.unwrap();
        assert_eq!(
            a.execute_raw(None, "USE shop").await.unwrap(),
            RawResult::Message("Database changed".to_string())
        );
        let result = a.execute_raw(None, "SELECT @a").await.unwrap();
        assert!(matches!(result, RawResult::Rows(_)));

        // Unknown database: the session stays where it was
        let err = a.execute_raw(None, "USE nope").await.unwrap_err();
        assert!(err.message().contains("Unknown database 'nope'"));
        assert_eq!(a.session_database, "shop");

        // Refused before any process starts
        let err = a.execute_raw(None, "BEGIN").await.unwrap_err();
        assert!(matches!(err, DbkitError::QueryFailed(_)));

        let calls = calls(dir.path());
        assert_eq!(calls.len(), 4, "{calls:#?}");
        assert!(calls[0].ends_with("-u root -e SET @a = 1"));
        assert!(calls[1].ends_with("-D shop -e DO 0"));
        assert!(calls[2].ends_with("-D shop -e SET @a = 1; SELECT @a"));
        assert!(calls[3].contains("-D nope"));

        // Lifecycle calls keep using the profile database
        assert_eq!(a.database, "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_user_reports_existing_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = stubbed(dir.path());
        let bob = crate::safety::validate_identifier("bob", IdentKind::User).unwrap();

        assert!(!a.create_user(&bob, "pw").await.unwrap());
    }
}
