//! dbkit - One Verb Set for Three Database Engines
//!
//! dbkit administers MySQL, PostgreSQL and MongoDB servers through the same small set of
//! verbs: create/delete database, create/delete user, grant, list, and an interactive session.
//!
//! # Core Principles
//! - Identifiers are whitelisted (`[A-Za-z0-9_]+`) before they reach any engine
//! - Create verbs are idempotent, delete verbs require typing the resource's name
//! - Generated passwords are shown exactly once
//! - The same contract holds whether an engine is reached natively or through its own CLI
//!   inside a container
//!
//! # Module Organization
//! - [`error`] - Error types and exit codes
//! - [`config`] - Connection profile resolution (flags, environment, `.env`, defaults)
//! - [`safety`] - Identifier validation and type-to-confirm prompts
//! - [`password`] - Credential generation
//! - [`engine`] - Engine adapter trait, core types and implementations
//! - [`lifecycle`] - Verb orchestration
//! - [`repl`] - Interactive session loop
//! - [`output`] - Result rendering

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod output;
pub mod password;
pub mod repl;
pub mod safety;

// Re-export commonly used types for convenience
pub use config::{resolve_profile, ProfileOverrides};
pub use engine::{
    open_adapter, ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant, RowSet,
    Transport,
};
pub use error::{DbkitError, Result};
pub use lifecycle::{LifecycleService, Outcome, Verb};
pub use password::{generate_password, GeneratedCredential, DEFAULT_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH};
pub use repl::{run_repl, ReplState};
pub use safety::{confirm, validate_identifier, IdentKind, ResourceName};
