//! Configuration Resolution
//!
//! This module turns layered inputs into one immutable [`ConnectionProfile`].
//!
//! # Resolution Precedence
//! 1. Explicit command-line flags (highest priority)
//! 2. Process environment variables
//! 3. Variables loaded from the nearest `.env` file
//! 4. Built-in per-engine defaults
//!
//! Layers 2 and 3 share one namespace: `.env` values are only loaded for variables the
//! process environment does not already define, so a real environment variable always wins.
//!
//! # `.env` Discovery
//! The working directory and up to four of its parents are searched for a `.env` file. The
//! first one found is loaded once per process; later calls are no-ops.
//!
//! # Environment Names
//! Each field accepts several names, tried in order: engine-specific names first
//! (`MYSQL_HOST`, `PGHOST`, `MONGO_HOST`, ...), then the generic `DB_*` names.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::engine::{ConnectionProfile, EngineKind, Transport};
use crate::error::{DbkitError, Result};

/// Directories inspected for `.env`: the start directory plus four ancestors
pub const DOTENV_SEARCH_DEPTH: usize = 5;

/// Timezone applied to new relational databases when none is configured
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";

/// Default host for every engine
pub const DEFAULT_HOST: &str = "127.0.0.1";

const TRANSPORT_ENV: &str = "DBKIT_TRANSPORT";
const TIMEZONE_ENV: &str = "DBKIT_TIMEZONE";

/// Values given explicitly on the command line
#[derive(Default, Clone)]
pub struct ProfileOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// `native` or `container`
    pub transport: Option<String>,
    pub service: Option<String>,
    pub timezone: Option<String>,
}

impl std::fmt::Debug for ProfileOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileOverrides")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("transport", &self.transport)
            .field("service", &self.service)
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// Environment variable names for one engine, in lookup order
#[derive(Debug, Clone, Copy)]
pub struct EnvAliases {
    pub host: &'static [&'static str],
    pub port: &'static [&'static str],
    pub user: &'static [&'static str],
    pub password: &'static [&'static str],
    pub database: &'static [&'static str],
    pub service: &'static [&'static str],
}

/// Environment names consulted for `engine`
#[must_use]
pub const fn env_aliases(engine: EngineKind) -> EnvAliases {
    match engine {
        EngineKind::MySql => EnvAliases {
            host: &["MYSQL_HOST", "DB_HOST"],
            port: &["MYSQL_PORT", "MYSQL_TCP_PORT", "DB_PORT"],
            user: &["MYSQL_ROOT_USER", "MYSQL_ADMIN_USER", "DB_USER"],
            password: &["MYSQL_ROOT_PASSWORD", "MYSQL_PWD", "DB_PASSWORD"],
            database: &["MYSQL_DATABASE"],
            service: &["MYSQL_SERVICE"],
        },
        EngineKind::Postgres => EnvAliases {
            host: &["PGHOST", "PG_HOST", "DB_HOST"],
            port: &["PGPORT", "PG_PORT", "DB_PORT"],
            user: &["PGUSER", "PG_USER", "DB_USER"],
            password: &["PGPASSWORD", "PG_PASSWORD", "PG_PASS", "DB_PASSWORD"],
            database: &["PGDATABASE"],
            service: &["PG_SERVICE"],
        },
        EngineKind::Mongo => EnvAliases {
            host: &["MONGO_HOST", "DB_HOST"],
            port: &["MONGO_PORT", "DB_PORT"],
            user: &["MONGO_INITDB_ROOT_USERNAME", "MONGO_USER", "DB_USER"],
            password: &["MONGO_INITDB_ROOT_PASSWORD", "MONGO_PASSWORD", "DB_PASSWORD"],
            database: &["MONGO_AUTH_DB"],
            service: &["MONGO_SERVICE"],
        },
    }
}

/// Resolve the profile for `engine` from flags, the environment and `.env`
///
/// Loads the nearest `.env` file on first use.
///
/// # Errors
/// `ConfigError` when a port or transport value cannot be parsed.
pub fn resolve_profile(engine: EngineKind, overrides: &ProfileOverrides) -> Result<ConnectionProfile> {
    load_dotenv();
    resolve_with(engine, overrides, |name| std::env::var(name).ok())
}

/// Resolve a profile against an arbitrary variable lookup
///
/// Empty variables count as unset.
///
/// # Errors
/// `ConfigError` when a port or transport value cannot be parsed. The message names the
/// offending flag or variable, never the value.
pub fn resolve_with<F>(
    engine: EngineKind,
    overrides: &ProfileOverrides,
    lookup: F,
) -> Result<ConnectionProfile>
where
    F: Fn(&str) -> Option<String>,
{
    let aliases = env_aliases(engine);
    let env = |names: &[&'static str]| -> Option<(&'static str, String)> {
        names.iter().find_map(|name| {
            lookup(name).filter(|v| !v.trim().is_empty()).map(|v| (*name, v))
        })
    };
    let pick = |flag: &Option<String>, names: &[&'static str], default: &str| -> String {
        flag.clone()
            .or_else(|| env(names).map(|(_, v)| v))
            .unwrap_or_else(|| default.to_string())
    };

    let port = match overrides.port {
        Some(port) => port,
        None => match env(aliases.port) {
            Some((name, raw)) => parse_port(&raw).ok_or_else(|| {
                DbkitError::config_error(format!("{name} is not a valid port number"))
            })?,
            None => engine.default_port(),
        },
    };

    let transport_raw = match &overrides.transport {
        Some(flag) => Some(("--transport", flag.clone())),
        None => lookup(TRANSPORT_ENV).filter(|v| !v.trim().is_empty()).map(|v| (TRANSPORT_ENV, v)),
    };
    let service = pick(&overrides.service, aliases.service, engine.default_service());
    let transport = match transport_raw {
        None => Transport::Native,
        Some((source, raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "native" => Transport::Native,
            "container" | "docker" => Transport::Container { service },
            _ => {
                return Err(DbkitError::config_error(format!(
                    "{source} must be 'native' or 'container'"
                )))
            }
        },
    };

    let timezone = overrides
        .timezone
        .clone()
        .or_else(|| lookup(TIMEZONE_ENV).filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());

    let profile = ConnectionProfile {
        engine,
        host: pick(&overrides.host, aliases.host, DEFAULT_HOST),
        port,
        user: pick(&overrides.user, aliases.user, engine.default_user()),
        password: pick(&overrides.password, aliases.password, ""),
        default_database: pick(&overrides.database, aliases.database, engine.default_database()),
        timezone,
        transport,
    };

    tracing::debug!(profile = ?profile, "resolved connection profile");
    Ok(profile)
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Find the nearest `.env` walking up from `start` ([`DOTENV_SEARCH_DEPTH`] directories)
#[must_use]
pub fn find_dotenv(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .take(DOTENV_SEARCH_DEPTH)
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.is_file())
}

/// Load `path` into the process environment without overriding variables already set
///
/// # Errors
/// `ConfigError` when the file cannot be read or parsed.
pub fn load_dotenv_file(path: &Path) -> Result<()> {
    dotenvy::from_path(path)
        .map_err(|e| DbkitError::config_error(format!("Failed to load {}: {e}", path.display())))
}

/// Load the nearest `.env` once per process
///
/// Returns the file that was loaded, if any. An unreadable `.env` is logged and skipped.
pub fn load_dotenv() -> Option<&'static Path> {
    static LOADED: OnceLock<Option<PathBuf>> = OnceLock::new();

    LOADED
        .get_or_init(|| {
            let cwd = std::env::current_dir().ok()?;
            let path = find_dotenv(&cwd)?;
            match load_dotenv_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "loaded .env");
                    Some(path)
                }
                Err(e) => {
                    tracing::warn!("{}", e.message());
                    None
                }
            }
        })
        .as_deref()
}
