//! Container-Exec Transport
//!
//! Runs an engine's own command-line client inside a compose service:
//!
//! ```text
//! docker compose exec -T [-e KEY=VALUE]... <service> <argv...>
//! ```
//!
//! `-T` disables TTY allocation so stdout can be captured and parsed. The docker binary
//! can be replaced with `DBKIT_DOCKER` (podman, a wrapper script, ...).
//!
//! # Session State
//! Every REPL statement runs in a fresh client process. [`ClientSession`] carries the state a
//! native connection would keep: the database selected with `USE` and every session `SET`,
//! replayed ahead of later statements. A transaction cannot outlive its process, so a
//! statement that only opens one is refused; `BEGIN; ...; COMMIT;` on one line still works.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::engine::EngineKind;
use crate::error::{DbkitError, Result};

/// Environment variable overriding the docker binary
pub const DOCKER_BIN_ENV: &str = "DBKIT_DOCKER";

/// One compose service plus the environment injected into every exec
#[derive(Debug, Clone)]
pub struct ContainerExec {
    engine: EngineKind,
    program: String,
    service: String,
    env: Vec<(String, String)>,
}

impl ContainerExec {
    pub fn new(engine: EngineKind, service: impl Into<String>) -> Self {
        let program = std::env::var(DOCKER_BIN_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "docker".to_string());
        Self { engine, program, service: service.into(), env: Vec::new() }
    }

    /// Inject `KEY=VALUE` into the exec'd process (skipped when `value` is empty)
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.env.push((key.into(), value));
        }
        self
    }

    /// Use `program` instead of the docker binary
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Full argument vector passed to the docker binary
    #[must_use]
    pub fn argv<S: AsRef<str>>(&self, client_args: &[S]) -> Vec<String> {
        let mut argv = vec!["compose".to_string(), "exec".to_string(), "-T".to_string()];
        for (key, value) in &self.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(self.service.clone());
        argv.extend(client_args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// Run the client and return its stdout
    ///
    /// # Errors
    /// `ConnectionFailed` when the docker binary cannot be started, `QueryFailed` carrying the
    /// client's stderr when it exits non-zero.
    pub async fn run<S: AsRef<str>>(&self, client_args: &[S], stdin: Option<&str>) -> Result<String> {
        let argv = self.argv(client_args);
        tracing::debug!(
            engine = %self.engine,
            service = %self.service,
            client = client_args.first().map(|a| a.as_ref()).unwrap_or(""),
            "container exec"
        );

        let mut child = Command::new(&self.program)
            .args(&argv)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DbkitError::connection_failed(format!(
                    "Failed to run '{}' for service '{}': {e}",
                    self.program, self.service
                ))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("{} client exited with {}", self.engine, output.status)
            } else {
                stderr
            };
            Err(DbkitError::query_failed(detail))
        }
    }

    /// Like [`Self::run`] but reports failures as `EngineError` (lifecycle operations)
    pub async fn run_admin<S: AsRef<str>>(&self, client_args: &[S]) -> Result<String> {
        self.run(client_args, None).await.map_err(|e| match e {
            DbkitError::QueryFailed(detail) => DbkitError::engine_error(self.engine.as_str(), detail),
            other => other,
        })
    }
}

/// How a raw statement touches session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// `USE <db>` selects the default database
    UseDatabase(String),
    /// Session setting (`SET ...`, `RESET ...`)
    Setting,
    /// Opens a transaction, or switches autocommit off
    OpenTransaction,
    None,
}

/// Classify one REPL statement (already stripped of its trailing `;`)
#[must_use]
pub fn session_effect(statement: &str) -> SessionEffect {
    // Several statements on one line run in a single process
    if statement.contains(';') {
        return SessionEffect::None;
    }
    let upper = statement.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();

    match words.as_slice() {
        ["USE", _] => statement
            .split_whitespace()
            .nth(1)
            .map_or(SessionEffect::None, |db| SessionEffect::UseDatabase(db.trim_matches('`').to_string())),
        ["BEGIN", ..] | ["START", "TRANSACTION", ..] => SessionEffect::OpenTransaction,
        ["SET", rest @ ..] if disables_autocommit(rest) => SessionEffect::OpenTransaction,
        ["SET", "TRANSACTION" | "LOCAL", ..] => SessionEffect::None,
        ["SET", _, ..] | ["RESET", _, ..] => SessionEffect::Setting,
        _ => SessionEffect::None,
    }
}

fn disables_autocommit(words: &[&str]) -> bool {
    let setting = words.concat();
    setting.contains("AUTOCOMMIT=0") || setting.contains("AUTOCOMMIT=OFF")
}

/// Session settings replayed ahead of every statement sent to a one-shot client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSession {
    settings: Vec<String>,
}

impl ClientSession {
    /// Remember a setting that ran successfully
    pub fn remember(&mut self, statement: &str) {
        self.settings.push(statement.trim().to_string());
    }

    /// `statement` prefixed with every remembered setting
    #[must_use]
    pub fn script(&self, statement: &str) -> String {
        let mut parts: Vec<&str> = self.settings.iter().map(String::as_str).collect();
        parts.push(statement);
        parts.join("; ")
    }
}

/// Refusal for a transaction that would end with its client process
#[must_use]
pub fn transaction_refused(engine: EngineKind) -> DbkitError {
    DbkitError::query_failed(format!(
        "{engine} container sessions run each statement in its own client process, so a \
         transaction cannot stay open; send it on one line (BEGIN; ...; COMMIT;)"
    ))
}

/// Split client output into trimmed, non-empty lines
#[must_use]
pub fn output_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Write an executable `/bin/sh` script standing in for the docker binary
#[cfg(all(test, unix))]
pub(crate) fn write_stub_docker(dir: &std::path::Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("docker");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path.to_string_lossy().into_owned()
}
