//! `MongoDB` Engine Adapter (native driver)
//!
//! # Model
//! - Databases exist once they hold data, so `create-db` writes an `{initialized: true}`
//!   marker into `init_collection`
//! - Users live in the `admin` database and authenticate against it
//! - A grant is a single `grantRolesToUser` with `{role, db}`
//!
//! # REPL Commands
//! - `find <collection> [limit]` (limit defaults to 20)
//! - a JSON object, run as a database command against the current database
//!
//! `use <db>`, `show dbs` and `show collections` are handled by the REPL itself.

use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential};
use mongodb::Client;
use serde_json::json;

use crate::engine::{
    with_connect_timeout, ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant,
    CONNECT_TIMEOUT,
};
use crate::error::{DbkitError, Result};
use crate::safety::{validate_identifier, IdentKind, ResourceName};

pub mod client;

const ENGINE: &str = "mongo";

/// Database holding every user created by dbkit
pub const AUTH_DATABASE: &str = "admin";

/// Collection written by `create-db` so the database materialises
pub const INIT_COLLECTION: &str = "init_collection";

/// Documents returned by `find` without an explicit limit
pub const DEFAULT_FIND_LIMIT: i64 = 20;

/// `NamespaceExists`
const CODE_NAMESPACE_EXISTS: i32 = 48;
/// `Location51003`: user already exists
const CODE_USER_EXISTS: i32 = 51003;

/// A parsed REPL line
#[derive(Debug, Clone, PartialEq)]
pub enum MongoCommand {
    Find { collection: ResourceName, limit: i64 },
    RunCommand(serde_json::Map<String, serde_json::Value>),
}

/// Parse one REPL line into a command
///
/// # Errors
/// `QueryFailed` for anything that is neither `find` nor a JSON object.
pub fn parse_command(input: &str) -> Result<MongoCommand> {
    let line = input.trim();

    if line.starts_with('{') {
        return match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(map)) if !map.is_empty() => Ok(MongoCommand::RunCommand(map)),
            Ok(_) => Err(DbkitError::query_failed("Command document must not be empty")),
            Err(e) => Err(DbkitError::query_failed(format!("Invalid command document: {e}"))),
        };
    }

    let mut words = line.split_whitespace();
    match words.next() {
        Some(verb) if verb.eq_ignore_ascii_case("find") => {
            let collection = words
                .next()
                .ok_or_else(|| DbkitError::query_failed("Usage: find <collection> [limit]"))?;
            let collection = validate_identifier(collection, IdentKind::Collection)
                .map_err(|e| DbkitError::query_failed(e.message()))?;
            let limit = match words.next() {
                None => DEFAULT_FIND_LIMIT,
                Some(raw) => raw
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| DbkitError::query_failed(format!("Invalid limit '{raw}'")))?,
            };
            if words.next().is_some() {
                return Err(DbkitError::query_failed("Usage: find <collection> [limit]"));
            }
            Ok(MongoCommand::Find { collection, limit })
        }
        _ => Err(DbkitError::query_failed(format!(
            "Unrecognized command '{line}' (expected find <collection> [limit] or a JSON command document)"
        ))),
    }
}

fn create_user_command(name: &ResourceName, password: &str) -> serde_json::Value {
    json!({ "createUser": name.as_str(), "pwd": password, "roles": [] })
}

fn grant_command(grant: &RoleGrant) -> serde_json::Value {
    json!({
        "grantRolesToUser": grant.principal.as_str(),
        "roles": [{ "role": grant.role.as_str(), "db": grant.target_database.as_str() }],
    })
}

/// `MongoDB` adapter over a native client
pub struct MongoAdapter {
    client: Option<Client>,
}

impl MongoAdapter {
    /// Connect and ping the server
    ///
    /// # Errors
    /// `ConnectionFailed` when the URI is unusable or the ping fails within the timeout.
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        if profile.engine != EngineKind::Mongo {
            return Err(DbkitError::invalid_input(format!(
                "Expected MongoDB engine, got {}",
                profile.engine
            )));
        }

        let options = build_client_options(profile).await?;
        let client = Client::with_options(options).map_err(|e| {
            DbkitError::connection_failed(format!("Failed to configure MongoDB client: {e}"))
        })?;

        // The driver connects lazily; ping so bad credentials fail here
        with_connect_timeout(EngineKind::Mongo, async {
            client.database(AUTH_DATABASE).run_command(doc! { "ping": 1 }).await.map_err(|e| {
                DbkitError::connection_failed(format!(
                    "Failed to connect to MongoDB at {}:{}: {e}",
                    profile.host, profile.port
                ))
            })
        })
        .await?;

        Ok(Self { client: Some(client) })
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DbkitError::engine_error(ENGINE, "Connection already closed"))
    }

    async fn admin_command(&self, command: Document, what: &str) -> Result<Document> {
        self.client()?
            .database(AUTH_DATABASE)
            .run_command(command)
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to {what}: {e}")))
    }

    async fn run_find(&self, database: &str, collection: &ResourceName, limit: i64) -> Result<RawResult> {
        let mut cursor = self
            .client()?
            .database(database)
            .collection::<Document>(collection.as_str())
            .find(doc! {})
            .limit(limit)
            .await
            .map_err(|e| DbkitError::query_failed(e.to_string()))?;

        let mut documents = Vec::new();
        while cursor.advance().await.map_err(|e| DbkitError::query_failed(e.to_string()))? {
            let document =
                cursor.deserialize_current().map_err(|e| DbkitError::query_failed(e.to_string()))?;
            documents.push(document_to_json(document));
        }
        Ok(RawResult::Documents(documents))
    }
}

#[async_trait]
impl EngineAdapter for MongoAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Mongo
    }

    async fn database_exists(&mut self, name: &ResourceName) -> Result<bool> {
        Ok(self.list_databases().await?.iter().any(|db| db == name.as_str()))
    }

    async fn create_database(
        &mut self,
        name: &ResourceName,
        _owner: Option<&ResourceName>,
    ) -> Result<()> {
        let database = self.client()?.database(name.as_str());

        if let Err(e) = database.create_collection(INIT_COLLECTION).await {
            if command_code(&e) != Some(CODE_NAMESPACE_EXISTS) {
                return Err(DbkitError::engine_error(
                    ENGINE,
                    format!("Failed to create database: {e}"),
                ));
            }
        }

        database
            .collection::<Document>(INIT_COLLECTION)
            .insert_one(doc! { "initialized": true })
            .await
            .map_err(|e| {
                DbkitError::engine_error(ENGINE, format!("Failed to write init marker: {e}"))
            })?;
        Ok(())
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.client()?
            .database(name.as_str())
            .drop()
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to drop database: {e}")))
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let reply = self.admin_command(doc! { "usersInfo": name.as_str() }, "look up user").await?;
        Ok(reply.get_array("users").map(|users| !users.is_empty()).unwrap_or(false))
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        let command = json_to_document(create_user_command(name, password))?;
        match self.client()?.database(AUTH_DATABASE).run_command(command).await {
            Ok(_) => Ok(true),
            Err(e) if command_code(&e) == Some(CODE_USER_EXISTS) => Ok(false),
            Err(e) => Err(DbkitError::engine_error(
                ENGINE,
                format!("Failed to create user '{name}': {e}"),
            )),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.admin_command(doc! { "dropUser": name.as_str() }, "drop user").await.map(|_| ())
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        let command = json_to_document(grant_command(grant))?;
        self.admin_command(command, "grant role").await.map(|_| ())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.client()?
            .list_database_names()
            .await
            .map_err(|e| DbkitError::engine_error(ENGINE, format!("Failed to list databases: {e}")))
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        let reply = self.admin_command(doc! { "usersInfo": 1 }, "list users").await?;
        let users = reply
            .get_array("users")
            .map(|users| {
                users
                    .iter()
                    .filter_map(Bson::as_document)
                    .filter_map(|u| u.get_str("user").ok().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(users)
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        self.client()?
            .database(database.as_str())
            .list_collection_names()
            .await
            .map_err(|e| {
                DbkitError::engine_error(ENGINE, format!("Failed to list collections: {e}"))
            })
    }

    async fn execute_raw(
        &mut self,
        database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        let database = database.map_or(AUTH_DATABASE, ResourceName::as_str);

        match parse_command(input)? {
            MongoCommand::Find { collection, limit } => self.run_find(database, &collection, limit).await,
            MongoCommand::RunCommand(map) => {
                let command = bson::to_document(&map)
                    .map_err(|e| DbkitError::query_failed(format!("Invalid command document: {e}")))?;
                let reply = self
                    .client()?
                    .database(database)
                    .run_command(command)
                    .await
                    .map_err(|e| DbkitError::query_failed(e.to_string()))?;
                Ok(RawResult::Documents(vec![document_to_json(reply)]))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}

async fn build_client_options(profile: &ConnectionProfile) -> Result<ClientOptions> {
    let uri = format!("mongodb://{}:{}/", profile.host, profile.port);
    let mut options = ClientOptions::parse(uri.as_str())
        .await
        .map_err(|e| DbkitError::connection_failed(format!("Invalid MongoDB address: {e}")))?;

    if !profile.user.is_empty() {
        options.credential = Some(
            Credential::builder()
                .username(profile.user.clone())
                .password(profile.password.clone())
                .source(AUTH_DATABASE.to_string())
                .build(),
        );
    }
    options.connect_timeout = Some(CONNECT_TIMEOUT);
    options.server_selection_timeout = Some(CONNECT_TIMEOUT);
    options.app_name = Some("dbkit".to_string());

    Ok(options)
}

/// Server error code of a failed command, if any
fn command_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn json_to_document(value: serde_json::Value) -> Result<Document> {
    bson::to_document(&value).map_err(|e| DbkitError::engine_error(ENGINE, e.to_string()))
}

/// Relaxed extended JSON (`ObjectId` as `{"$oid": ...}`, plain numbers)
fn document_to_json(document: Document) -> serde_json::Value {
    Bson::Document(document).into_relaxed_extjson()
}
