//! dbkit CLI Entry Point
//!
//! Thin router from the command line to the library:
//! - `gen-password` - print a fresh password
//! - `mysql` / `pgsql` / `mongo` - one lifecycle verb, or an interactive session
//!
//! Command output and the typed-name confirmation before a delete go to stdout. Logs, session
//! prompts, the login password prompt and errors go to stderr.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dbkit::config::{resolve_profile, ProfileOverrides};
use dbkit::engine::settle_close;
use dbkit::password::{generate_password, parse_length};
use dbkit::{open_adapter, run_repl, ConnectionProfile, DbkitError, EngineKind, LifecycleService, Verb};

const LOG_ENV: &str = "DBKIT_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

/// dbkit - One verb set for MySQL, PostgreSQL and MongoDB administration
#[derive(Parser)]
#[command(name = "dbkit")]
#[command(about = "Create, delete, grant, list and open sessions on database servers")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `debug` or `dbkit=trace` (overrides DBKIT_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a random password
    GenPassword {
        /// Password length, 1 to 4096 (anything else prints 32 characters)
        #[arg(value_name = "LENGTH")]
        length: Option<String>,

        #[arg(short = 'n', long = "length", value_name = "LENGTH")]
        length_flag: Option<String>,
    },

    /// Administer a MySQL server
    Mysql {
        #[command(flatten)]
        conn: ConnectionArgs,

        #[command(subcommand)]
        verb: RelationalCommand,
    },

    /// Administer a PostgreSQL server
    Pgsql {
        #[command(flatten)]
        conn: ConnectionArgs,

        #[command(subcommand)]
        verb: RelationalCommand,
    },

    /// Administer a MongoDB server
    Mongo {
        #[command(flatten)]
        conn: ConnectionArgs,

        #[command(subcommand)]
        verb: DocumentCommand,
    },
}

/// Connection flags shared by every engine (each falls back to env, `.env`, then defaults)
#[derive(Args)]
struct ConnectionArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    database: Option<String>,

    /// `native` or `container`
    #[arg(long)]
    transport: Option<String>,

    /// Compose service used by the container transport
    #[arg(long)]
    service: Option<String>,

    /// Timezone stamped on new PostgreSQL databases (ignored by `mysql` and `mongo`, which
    /// have no per-database timezone)
    #[arg(long)]
    timezone: Option<String>,
}

impl From<ConnectionArgs> for ProfileOverrides {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            user: args.user,
            password: args.password,
            database: args.database,
            transport: args.transport,
            service: args.service,
            timezone: args.timezone,
        }
    }
}

#[derive(Subcommand)]
enum RelationalCommand {
    /// Create a database (`create-db <DATABASE>` or `create-db <OWNER> <DATABASE>`)
    CreateDb {
        #[arg(value_name = "OWNER_OR_DATABASE")]
        first: String,

        #[arg(value_name = "DATABASE")]
        second: Option<String>,
    },

    /// Create a user with a generated password, optionally granting a privilege on a database
    CreateUser {
        username: String,

        /// Privilege level (default ALL)
        privilege: Option<String>,

        database: Option<String>,
    },

    /// Drop a database after typed confirmation
    DeleteDb { database: String },

    /// Drop a user after typed confirmation
    DeleteUser { username: String },

    /// Grant all privileges on a database to a user
    Grant { database: String, username: String },

    /// List databases
    Dbs,

    /// List users
    Users,

    /// List tables of a database
    Tables { database: String },

    /// Interactive session as the admin user
    Client,

    /// Interactive session as another user
    Login { username: String, password: Option<String> },
}

#[derive(Subcommand)]
enum DocumentCommand {
    /// Create a database (seeded with a marker collection)
    CreateDb { database: String },

    /// Create a user with a generated password (default role readWrite on admin)
    CreateUser { username: String, role: Option<String>, database: Option<String> },

    /// Drop a database after typed confirmation
    DeleteDb { database: String },

    /// Drop a user after typed confirmation
    DeleteUser { username: String },

    /// Grant a role on a database to a user
    Grant { username: String, role: String, database: String },

    /// List databases
    Dbs,

    /// List users
    Users,

    /// List collections of a database
    Collections { database: String },

    /// Interactive session as the admin user
    Client,

    /// Interactive session as another user
    Login { username: String, password: Option<String> },
}

/// What an engine subcommand asks for
enum Action {
    Verb(Verb),
    Session,
    Login { username: String, password: Option<String> },
}

impl From<RelationalCommand> for Action {
    fn from(command: RelationalCommand) -> Self {
        match command {
            RelationalCommand::CreateDb { first, second } => match second {
                Some(database) => Self::Verb(Verb::CreateDatabase { owner: Some(first), database }),
                None => Self::Verb(Verb::CreateDatabase { owner: None, database: first }),
            },
            RelationalCommand::CreateUser { username, privilege, database } => {
                Self::Verb(Verb::CreateUser { username, role: privilege, database })
            }
            RelationalCommand::DeleteDb { database } => Self::Verb(Verb::DeleteDatabase { database }),
            RelationalCommand::DeleteUser { username } => Self::Verb(Verb::DeleteUser { username }),
            RelationalCommand::Grant { database, username } => {
                Self::Verb(Verb::Grant { username, role: None, database })
            }
            RelationalCommand::Dbs => Self::Verb(Verb::ListDatabases),
            RelationalCommand::Users => Self::Verb(Verb::ListUsers),
            RelationalCommand::Tables { database } => Self::Verb(Verb::ListChildren { database }),
            RelationalCommand::Client => Self::Session,
            RelationalCommand::Login { username, password } => Self::Login { username, password },
        }
    }
}

impl From<DocumentCommand> for Action {
    fn from(command: DocumentCommand) -> Self {
        match command {
            DocumentCommand::CreateDb { database } => {
                Self::Verb(Verb::CreateDatabase { owner: None, database })
            }
            DocumentCommand::CreateUser { username, role, database } => {
                Self::Verb(Verb::CreateUser { username, role, database })
            }
            DocumentCommand::DeleteDb { database } => Self::Verb(Verb::DeleteDatabase { database }),
            DocumentCommand::DeleteUser { username } => Self::Verb(Verb::DeleteUser { username }),
            DocumentCommand::Grant { username, role, database } => {
                Self::Verb(Verb::Grant { username, role: Some(role), database })
            }
            DocumentCommand::Dbs => Self::Verb(Verb::ListDatabases),
            DocumentCommand::Users => Self::Verb(Verb::ListUsers),
            DocumentCommand::Collections { database } => Self::Verb(Verb::ListChildren { database }),
            DocumentCommand::Client => Self::Session,
            DocumentCommand::Login { username, password } => Self::Login { username, password },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<DbkitError>().map_or(1, DbkitError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    // Logs never share stdout with command output
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let (engine, conn, action) = match command {
        Commands::GenPassword { length, length_flag } => {
            let length = parse_length(length_flag.as_deref().or(length.as_deref()));
            println!("{}", generate_password(length));
            return Ok(());
        }
        Commands::Mysql { conn, verb } => (EngineKind::MySql, conn, Action::from(verb)),
        Commands::Pgsql { conn, verb } => (EngineKind::Postgres, conn, Action::from(verb)),
        Commands::Mongo { conn, verb } => (EngineKind::Mongo, conn, Action::from(verb)),
    };

    let profile = resolve_profile(engine, &conn.into())?;

    match action {
        Action::Verb(verb) => run_verb(&profile, &verb).await,
        Action::Session => run_session(&profile).await,
        Action::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None if io::stdin().is_terminal() => dialoguer::Password::new()
                    .with_prompt(format!("Password for {username}"))
                    .allow_empty_password(true)
                    .interact()
                    .context("failed to read password")?,
                None => profile.password.clone(),
            };
            run_session(&profile.for_login(username, password)).await
        }
    }
}

async fn run_verb(profile: &ConnectionProfile, verb: &Verb) -> anyhow::Result<()> {
    // Rejected names never cost a connection
    verb.validate(profile.engine)?;

    let mut adapter = open_adapter(profile).await?;
    let stdin = io::stdin();
    let outcome = LifecycleService::new(adapter.as_mut(), stdin.lock(), io::stdout().lock())
        .run(verb)
        .await;
    let outcome = settle_close(outcome, adapter.close().await)?;
    tracing::debug!(outcome = ?outcome, "verb finished");
    Ok(())
}

async fn run_session(profile: &ConnectionProfile) -> anyhow::Result<()> {
    let mut adapter = open_adapter(profile).await?;
    let stdin = io::stdin();
    let state = run_repl(adapter.as_mut(), stdin.lock(), io::stdout(), io::stderr()).await;
    settle_close(state, adapter.close().await)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_timezone_help_names_engines_that_ignore_it() {
        let mut cli = Cli::command();
        let mysql = cli.find_subcommand_mut("mysql").expect("mysql subcommand");
        let timezone = mysql
            .get_arguments()
            .find(|arg| arg.get_id() == "timezone")
            .expect("--timezone flag");
        let help = timezone.get_help().map(ToString::to_string).unwrap_or_default();
        assert!(help.contains("ignored by"), "{help}");
        assert!(help.contains("mysql"), "{help}");
    }

    #[test]
    fn test_privilege_without_database_is_rejected_before_connecting() {
        let cli = Cli::try_parse_from(["dbkit", "mysql", "create-user", "bob", "SELECT"]).unwrap();
        let Commands::Mysql { verb, .. } = cli.command else {
            panic!("expected mysql");
        };
        let Action::Verb(verb) = Action::from(verb) else {
            panic!("expected a verb");
        };
        assert!(verb.validate(EngineKind::MySql).is_err());
    }
}
