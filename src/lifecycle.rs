//! Resource Lifecycle Orchestration
//!
//! One [`Verb`] runs end-to-end against an already-open [`EngineAdapter`]:
//!
//! 1. Every name is validated before the adapter is touched
//! 2. Create verbs check existence and stop with "already exists" when the target is there
//! 3. Delete verbs check existence, stop with "does not exist" when it is not, and otherwise
//!    require the operator to type the resource's name
//! 4. Grants run directly (re-applying a grant is harmless)
//! 5. Listings are printed sorted by name
//!
//! Expected conditions (already exists, does not exist, cancelled) are reported on `out` and
//! returned as an [`Outcome`]; only validation, connection and engine failures are errors.

use std::io::{BufRead, Write};

use crate::engine::{EngineAdapter, EngineKind, RoleGrant};
use crate::error::{DbkitError, Result};
use crate::output::render_list;
use crate::password::GeneratedCredential;
use crate::safety::{confirm, validate_identifier, validate_optional, IdentKind, ResourceName};

/// Prompt shown before dropping a database
pub const CONFIRM_DATABASE_PROMPT: &str = "Type database name to confirm: ";

/// Prompt shown before dropping a user
pub const CONFIRM_USER_PROMPT: &str = "Type username to confirm: ";

/// Database document-store users are granted on when none is given
const DEFAULT_DOCUMENT_GRANT_DATABASE: &str = "admin";

/// A lifecycle request with raw (not yet validated) names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    CreateDatabase { owner: Option<String>, database: String },
    /// `role` is a privilege level on relational engines and a role name on the document store
    CreateUser { username: String, role: Option<String>, database: Option<String> },
    DeleteDatabase { database: String },
    DeleteUser { username: String },
    Grant { username: String, role: Option<String>, database: String },
    ListDatabases,
    ListUsers,
    /// Tables or collections of one database
    ListChildren { database: String },
}

impl Verb {
    /// Check every name the verb carries without touching an engine
    ///
    /// # Errors
    /// `InvalidIdentifier` for the first rejected name.
    pub fn validate(&self, engine: EngineKind) -> Result<()> {
        let role_kind = role_kind(engine);
        match self {
            Self::CreateDatabase { owner, database } => {
                validate_optional(owner.as_deref(), IdentKind::Owner)?;
                validate_identifier(database, IdentKind::Database)?;
            }
            Self::CreateUser { username, role, database } => {
                validate_identifier(username, IdentKind::User)?;
                validate_optional(role.as_deref(), role_kind)?;
                validate_optional(database.as_deref(), IdentKind::Database)?;
                require_grant_target(engine, role.as_deref(), database.as_deref())?;
            }
            Self::DeleteDatabase { database } | Self::ListChildren { database } => {
                validate_identifier(database, IdentKind::Database)?;
            }
            Self::DeleteUser { username } => {
                validate_identifier(username, IdentKind::User)?;
            }
            Self::Grant { username, role, database } => {
                validate_identifier(username, IdentKind::User)?;
                validate_optional(role.as_deref(), role_kind)?;
                validate_identifier(database, IdentKind::Database)?;
            }
            Self::ListDatabases | Self::ListUsers => {}
        }
        Ok(())
    }
}

/// Relational privileges only exist on a database, so one given without a database is refused
fn require_grant_target(engine: EngineKind, role: Option<&str>, database: Option<&str>) -> Result<()> {
    match (role, database) {
        (Some(role), None) if engine.is_relational() => Err(DbkitError::invalid_input(format!(
            "privilege '{role}' needs a database: create-user <username> {role} <database>"
        ))),
        _ => Ok(()),
    }
}

fn role_kind(engine: EngineKind) -> IdentKind {
    if engine.is_relational() {
        IdentKind::Privilege
    } else {
        IdentKind::Role
    }
}

/// How a verb ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    AlreadyExists,
    Deleted,
    /// Target (or a required owner) does not exist; nothing was changed
    Missing,
    /// Operator declined the confirmation
    Cancelled,
    Granted,
    Listed(usize),
}

/// Runs verbs against one adapter, talking to the operator through `input`/`out`
pub struct LifecycleService<'a, R, W> {
    adapter: &'a mut dyn EngineAdapter,
    input: R,
    out: W,
}

impl<'a, R: BufRead, W: Write> LifecycleService<'a, R, W> {
    pub fn new(adapter: &'a mut dyn EngineAdapter, input: R, out: W) -> Self {
        Self { adapter, input, out }
    }

    /// Execute one verb
    ///
    /// # Errors
    /// `InvalidIdentifier`/`InvalidInput` before any engine call, `EngineError` or
    /// `ConnectionFailed` from the adapter, `Io` when the operator streams fail.
    pub async fn run(&mut self, verb: &Verb) -> Result<Outcome> {
        let engine = self.adapter.kind();
        tracing::debug!(engine = %engine, verb = ?verb, "running verb");

        match verb {
            Verb::CreateDatabase { owner, database } => {
                let database = validate_identifier(database, IdentKind::Database)?;
                let owner = validate_optional(owner.as_deref(), IdentKind::Owner)?;
                if owner.is_some() && !engine.is_relational() {
                    return Err(DbkitError::invalid_input(format!(
                        "{engine} databases have no owner"
                    )));
                }
                self.create_database(&database, owner.as_ref()).await
            }

            Verb::CreateUser { username, role, database } => {
                let username = validate_identifier(username, IdentKind::User)?;
                let role_kind = role_kind(engine);
                let role = validate_optional(role.as_deref(), role_kind)?;
                let database = validate_optional(database.as_deref(), IdentKind::Database)?;
                require_grant_target(
                    engine,
                    role.as_ref().map(ResourceName::as_str),
                    database.as_ref().map(ResourceName::as_str),
                )?;

                // Relational users only get privileges when a database is named; document-store
                // users always get a role (readWrite on admin by default)
                let grant_target = if engine.is_relational() {
                    database
                } else {
                    Some(match database {
                        Some(db) => db,
                        None => validate_identifier(DEFAULT_DOCUMENT_GRANT_DATABASE, IdentKind::Database)?,
                    })
                };
                let grant = match grant_target {
                    Some(target_database) => Some(RoleGrant {
                        principal: username.clone(),
                        role: self.role_or_default(role, role_kind)?,
                        target_database,
                    }),
                    None => None,
                };
                self.create_user(&username, grant.as_ref()).await
            }

            Verb::DeleteDatabase { database } => {
                let database = validate_identifier(database, IdentKind::Database)?;
                self.delete_database(&database).await
            }

            Verb::DeleteUser { username } => {
                let username = validate_identifier(username, IdentKind::User)?;
                self.delete_user(&username).await
            }

            Verb::Grant { username, role, database } => {
                let role_kind = role_kind(engine);
                let grant = RoleGrant {
                    principal: validate_identifier(username, IdentKind::User)?,
                    role: self
                        .role_or_default(validate_optional(role.as_deref(), role_kind)?, role_kind)?,
                    target_database: validate_identifier(database, IdentKind::Database)?,
                };
                self.adapter.grant(&grant).await?;
                writeln!(self.out, "Granted.")?;
                Ok(Outcome::Granted)
            }

            Verb::ListDatabases => {
                let items = self.adapter.list_databases().await?;
                self.list(items)
            }

            Verb::ListUsers => {
                let items = self.adapter.list_users().await?;
                self.list(items)
            }

            Verb::ListChildren { database } => {
                let database = validate_identifier(database, IdentKind::Database)?;
                let items = self.adapter.list_child_resources(&database).await?;
                self.list(items)
            }
        }
    }

    fn role_or_default(&self, role: Option<ResourceName>, kind: IdentKind) -> Result<ResourceName> {
        match role {
            Some(role) => Ok(role),
            None => validate_identifier(self.adapter.kind().default_role(), kind),
        }
    }

    async fn create_database(
        &mut self,
        database: &ResourceName,
        owner: Option<&ResourceName>,
    ) -> Result<Outcome> {
        if self.adapter.database_exists(database).await? {
            writeln!(self.out, "Database '{database}' already exists.")?;
            return Ok(Outcome::AlreadyExists);
        }

        if let Some(owner) = owner {
            if !self.adapter.user_exists(owner).await? {
                writeln!(self.out, "User '{owner}' does not exist.")?;
                return Ok(Outcome::Missing);
            }
        }

        self.adapter.create_database(database, owner).await?;
        tracing::info!(database = %database, "database created");
        writeln!(self.out, "Database '{database}' created.")?;
        Ok(Outcome::Created)
    }

    async fn create_user(&mut self, username: &ResourceName, grant: Option<&RoleGrant>) -> Result<Outcome> {
        if self.adapter.user_exists(username).await? {
            writeln!(self.out, "User '{username}' already exists.")?;
            return Ok(Outcome::AlreadyExists);
        }

        let credential = GeneratedCredential::new(username.as_str());
        if !self.adapter.create_user(username, &credential.password).await? {
            // Created by someone else since the check; this password was never set
            writeln!(self.out, "User '{username}' already exists.")?;
            return Ok(Outcome::AlreadyExists);
        }
        tracing::info!(user = %username, "user created");

        // Shown before granting so a failed grant cannot lose the password
        writeln!(self.out, "User: {}", credential.username)?;
        writeln!(self.out, "Password: {}", credential.password)?;
        writeln!(self.out, "Save this password. It will not be shown again.")?;

        if let Some(grant) = grant {
            self.adapter.grant(grant).await?;
            writeln!(
                self.out,
                "Granted {} on '{}' to '{}'.",
                grant.role, grant.target_database, grant.principal
            )?;
        }
        Ok(Outcome::Created)
    }

    async fn delete_database(&mut self, database: &ResourceName) -> Result<Outcome> {
        if !self.adapter.database_exists(database).await? {
            writeln!(self.out, "Database '{database}' does not exist.")?;
            return Ok(Outcome::Missing);
        }

        if !confirm(&mut self.input, &mut self.out, CONFIRM_DATABASE_PROMPT, database.as_str())? {
            writeln!(self.out, "Cancelled.")?;
            return Ok(Outcome::Cancelled);
        }

        self.adapter.drop_database(database).await?;
        tracing::info!(database = %database, "database dropped");
        writeln!(self.out, "Database '{database}' deleted.")?;
        Ok(Outcome::Deleted)
    }

    async fn delete_user(&mut self, username: &ResourceName) -> Result<Outcome> {
        if !self.adapter.user_exists(username).await? {
            writeln!(self.out, "User '{username}' does not exist.")?;
            return Ok(Outcome::Missing);
        }

        if !confirm(&mut self.input, &mut self.out, CONFIRM_USER_PROMPT, username.as_str())? {
            writeln!(self.out, "Cancelled.")?;
            return Ok(Outcome::Cancelled);
        }

        self.adapter.drop_user(username).await?;
        tracing::info!(user = %username, "user dropped");
        writeln!(self.out, "User '{username}' deleted.")?;
        Ok(Outcome::Deleted)
    }

    fn list(&mut self, mut items: Vec<String>) -> Result<Outcome> {
        items.sort();
        render_list(&mut self.out, &items)?;
        Ok(Outcome::Listed(items.len()))
    }
}
