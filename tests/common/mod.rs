//! In-memory engine shared by the integration tests
//!
//! Records every adapter call so tests can assert that rejected input never reached the
//! engine, and keeps just enough state to make create/delete/list behave like a server.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use dbkit::{DbkitError, EngineAdapter, EngineKind, RawResult, ResourceName, Result, RoleGrant, RowSet};

#[derive(Debug)]
pub struct FakeEngine {
    pub kind: EngineKind,
    pub databases: BTreeSet<String>,
    /// username -> password
    pub users: BTreeMap<String, String>,
    /// (principal, role, database)
    pub grants: Vec<(String, String, String)>,
    /// database -> tables/collections
    pub children: BTreeMap<String, Vec<String>>,
    /// Users another session creates between our existence check and our CREATE
    pub concurrent_users: BTreeMap<String, String>,
    pub calls: Vec<String>,
    pub closed: bool,
}

impl FakeEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            databases: BTreeSet::new(),
            users: BTreeMap::new(),
            grants: Vec::new(),
            children: BTreeMap::new(),
            concurrent_users: BTreeMap::new(),
            calls: Vec::new(),
            closed: false,
        }
    }

    pub fn with_databases(mut self, names: &[&str]) -> Self {
        self.databases.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    pub fn with_users(mut self, names: &[&str]) -> Self {
        for name in names {
            self.users.insert((*name).to_string(), "secret".to_string());
        }
        self
    }

    /// `name` is created elsewhere (with `password`) right after the existence check
    pub fn with_concurrent_user(mut self, name: &str, password: &str) -> Self {
        self.concurrent_users.insert(name.to_string(), password.to_string());
        self
    }

    pub fn with_children(mut self, database: &str, names: &[&str]) -> Self {
        self.databases.insert(database.to_string());
        self.children
            .insert(database.to_string(), names.iter().map(|n| (*n).to_string()).collect());
        self
    }

    /// Calls that changed server state
    pub fn mutations(&self) -> Vec<&str> {
        self.calls
            .iter()
            .map(String::as_str)
            .filter(|c| !c.ends_with("_exists") && !c.starts_with("list_"))
            .collect()
    }

    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }

    fn relational_statement(statement: &str) -> Result<RawResult> {
        let upper = statement.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        if upper == "SELECT 1" {
            return Ok(RawResult::Rows(RowSet {
                columns: vec!["?column?".to_string()],
                rows: vec![vec![json!(1)]],
            }));
        }
        if upper.starts_with("INSERT") || upper.starts_with("UPDATE") {
            return Ok(RawResult::Affected(2));
        }
        if upper.starts_with("CREATE TABLE") {
            return Ok(RawResult::Affected(0));
        }
        let first = statement.split_whitespace().next().unwrap_or_default();
        Err(DbkitError::query_failed(format!("syntax error at or near \"{first}\"")))
    }

    fn document_command(&self, database: Option<&ResourceName>, input: &str) -> Result<RawResult> {
        let db = database.map_or("admin", ResourceName::as_str);
        let words: Vec<&str> = input.split_whitespace().collect();
        match words.as_slice() {
            ["find", collection] | ["find", collection, _] => {
                let known = self.children.get(db).is_some_and(|c| c.iter().any(|n| n == collection));
                if !known {
                    return Ok(RawResult::Documents(Vec::new()));
                }
                Ok(RawResult::Documents(vec![json!({"db": db, "collection": collection})]))
            }
            _ if input.starts_with('{') => Ok(RawResult::Documents(vec![json!({"ok": 1, "db": db})])),
            _ => Err(DbkitError::query_failed(format!("Unknown command: {input}"))),
        }
    }
}

#[async_trait]
impl EngineAdapter for FakeEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        self.record("database_exists");
        Ok(self.databases.contains(name.as_str()))
    }

    async fn create_database(&mut self, name: &ResourceName, owner: Option<&ResourceName>) -> Result<()> {
        self.record("create_database");
        self.databases.insert(name.to_string());
        if self.kind == EngineKind::Mongo {
            self.children.insert(name.to_string(), vec!["init_collection".to_string()]);
        }
        if let Some(owner) = owner {
            self.grants.push((owner.to_string(), "OWNER".to_string(), name.to_string()));
        }
        Ok(())
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.record("drop_database");
        self.databases.remove(name.as_str());
        self.children.remove(name.as_str());
        Ok(())
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        self.record("user_exists");
        Ok(self.users.contains_key(name.as_str()))
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        self.record("create_user");
        if let Some(theirs) = self.concurrent_users.remove(name.as_str()) {
            self.users.insert(name.to_string(), theirs);
            return Ok(false);
        }
        self.users.insert(name.to_string(), password.to_string());
        Ok(true)
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.record("drop_user");
        self.users.remove(name.as_str());
        Ok(())
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        self.record("grant");
        self.grants.push((
            grant.principal.to_string(),
            grant.role.to_string(),
            grant.target_database.to_string(),
        ));
        Ok(())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.record("list_databases");
        // Reverse order so callers have to sort
        Ok(self.databases.iter().rev().cloned().collect())
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        self.record("list_users");
        Ok(self.users.keys().rev().cloned().collect())
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        self.record("list_child_resources");
        if !self.databases.contains(database.as_str()) {
            return Err(DbkitError::engine_error(
                self.kind.as_str(),
                format!("database '{database}' not found"),
            ));
        }
        Ok(self.children.get(database.as_str()).cloned().unwrap_or_default())
    }

    async fn execute_raw(&mut self, database: Option<&ResourceName>, input: &str) -> Result<RawResult> {
        self.calls.push(format!("execute_raw {input}"));
        if self.kind.is_relational() {
            Self::relational_statement(input)
        } else {
            self.document_command(database, input)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
