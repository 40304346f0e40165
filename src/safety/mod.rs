//! Identifier Validation and Destructive-Operation Confirmation
//!
//! This module is the safety layer in front of every engine.
//!
//! # Identifier Whitelist
//! Engine DDL (`CREATE DATABASE`, `CREATE USER`, `GRANT`, `dropUser`, ...) cannot take
//! identifiers through prepared-statement placeholders, so names are interpolated into
//! command text. The only accepted alphabet is `[A-Za-z0-9_]`; anything else is rejected
//! before a connection is even opened. [`ResourceName`] can only be obtained through
//! [`validate_identifier`], which makes "validated before interpolation" a type-level fact
//! for every adapter.
//!
//! # Type-to-Confirm Gate
//! [`confirm`] guards deletions: the operator must type the resource's own name exactly.

use std::fmt;
use std::io::{BufRead, Write};

use crate::error::{DbkitError, Result};

/// What a user-supplied name is going to be used as (only affects error messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Database,
    User,
    Owner,
    Role,
    Privilege,
    Collection,
}

impl IdentKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::User => "username",
            Self::Owner => "owner",
            Self::Role => "role",
            Self::Privilege => "privilege",
            Self::Collection => "collection",
        }
    }
}

impl fmt::Display for IdentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database, user, role or collection name guaranteed to match `^[A-Za-z0-9_]+$`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName(String);

impl ResourceName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a user-supplied identifier
///
/// # Errors
/// `InvalidIdentifier` when `name` is empty or contains a character outside `[A-Za-z0-9_]`.
pub fn validate_identifier(name: &str, kind: IdentKind) -> Result<ResourceName> {
    if is_safe_identifier(name) {
        Ok(ResourceName(name.to_string()))
    } else {
        Err(DbkitError::invalid_identifier(kind.as_str(), name))
    }
}

/// Validate an optional identifier, passing `None` through
pub fn validate_optional(name: Option<&str>, kind: IdentKind) -> Result<Option<ResourceName>> {
    name.map(|n| validate_identifier(n, kind)).transpose()
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Ask the operator to type `expected` to proceed
///
/// Writes `prompt` to `out`, reads one line from `input` and returns true only when the
/// trimmed line equals `expected` exactly (case-sensitive). End of input means "no".
///
/// # Errors
/// Propagates I/O failures of the interactive streams.
pub fn confirm<R, W>(input: &mut R, out: &mut W, prompt: &str, expected: &str) -> Result<bool>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    write!(out, "{prompt}")?;
    out.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        // EOF: treat as cancellation
        writeln!(out)?;
        return Ok(false);
    }

    Ok(line.trim() == expected)
}
