//! `MongoDB` Engine Adapter (container client)
//!
//! Drives `mongosh --quiet --eval <script>` inside a compose service. Every script evaluates a
//! single expression and prints it with `EJSON.stringify(..., {relaxed: true})`, so the last
//! line of stdout is always one JSON value. Shell exceptions are caught in the script and
//! reported as `{ok: 0, code, errmsg}` like a failed server command.
//!
//! Scripts only ever embed validated identifiers and `serde_json`-encoded literals.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    create_user_command, grant_command, parse_command, MongoCommand, AUTH_DATABASE,
    CODE_USER_EXISTS, INIT_COLLECTION,
};
use crate::engine::exec::{output_lines, ContainerExec};
use crate::engine::{ConnectionProfile, EngineAdapter, EngineKind, RawResult, RoleGrant};
use crate::error::{DbkitError, Result};
use crate::safety::ResourceName;

const ENGINE: &str = "mongo";

/// `MongoDB` adapter that shells out to `mongosh` inside a container
pub struct MongoClientAdapter {
    exec: ContainerExec,
    user: String,
    password: String,
}

impl MongoClientAdapter {
    #[must_use]
    pub fn new(profile: &ConnectionProfile, service: &str) -> Self {
        Self {
            exec: ContainerExec::new(EngineKind::Mongo, service),
            user: profile.user.clone(),
            password: profile.password.clone(),
        }
    }

    fn client_args(&self, expression: &str) -> Vec<String> {
        let mut args = vec!["mongosh".to_string(), "--quiet".to_string()];
        if !self.user.is_empty() {
            args.extend([
                "-u".to_string(),
                self.user.clone(),
                "-p".to_string(),
                self.password.clone(),
                "--authenticationDatabase".to_string(),
                AUTH_DATABASE.to_string(),
            ]);
        }
        args.push("--eval".to_string());
        args.push(script(expression));
        args
    }

    /// Evaluate `expression` and return its JSON value
    async fn eval(&self, expression: &str) -> Result<Value> {
        let stdout = self.exec.run_admin(&self.client_args(expression)).await?;
        parse_reply(&stdout).map_err(|detail| DbkitError::engine_error(ENGINE, detail))
    }

    /// Evaluate and fail on `{ok: 0}` replies
    async fn eval_checked(&self, expression: &str, what: &str) -> Result<Value> {
        let reply = self.eval(expression).await?;
        match command_failure(&reply) {
            Some((_, message)) => {
                Err(DbkitError::engine_error(ENGINE, format!("Failed to {what}: {message}")))
            }
            None => Ok(reply),
        }
    }

    async fn admin_command(&self, command: &Value, what: &str) -> Result<Value> {
        self.eval_checked(&format!("{}.runCommand({command})", sibling(AUTH_DATABASE)), what)
            .await
    }
}

#[async_trait]
impl EngineAdapter for MongoClientAdapter {
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
        // insertOne creates the collection (and the database) on first write
        self.eval_checked(
            &format!(
                "{}.getCollection({}).insertOne({{ initialized: true }})",
                sibling(name.as_str()),
                js_string(INIT_COLLECTION)
            ),
            "create database",
        )
        .await
        .map(|_| ())
    }

    async fn drop_database(&mut self, name: &ResourceName) -> Result<()> {
        self.eval_checked(&format!("{}.dropDatabase()", sibling(name.as_str())), "drop database")
            .await
            .map(|_| ())
    }

    async fn user_exists(&mut self, name: &ResourceName) -> Result<bool> {
        let reply = self
            .admin_command(&serde_json::json!({ "usersInfo": name.as_str() }), "look up user")
            .await?;
        Ok(reply["users"].as_array().is_some_and(|users| !users.is_empty()))
    }

    async fn create_user(&mut self, name: &ResourceName, password: &str) -> Result<bool> {
        let command = create_user_command(name, password);
        let reply =
            self.eval(&format!("{}.runCommand({command})", sibling(AUTH_DATABASE))).await?;
        match command_failure(&reply) {
            None => Ok(true),
            Some((Some(code), _)) if code == i64::from(CODE_USER_EXISTS) => Ok(false),
            Some((_, message)) => Err(DbkitError::engine_error(
                ENGINE,
                format!("Failed to create user '{name}': {message}"),
            )),
        }
    }

    async fn drop_user(&mut self, name: &ResourceName) -> Result<()> {
        self.admin_command(&serde_json::json!({ "dropUser": name.as_str() }), "drop user")
            .await
            .map(|_| ())
    }

    async fn grant(&mut self, grant: &RoleGrant) -> Result<()> {
        self.admin_command(&grant_command(grant), "grant role").await.map(|_| ())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        let reply = self.eval_checked("db.getMongo().getDBNames()", "list databases").await?;
        Ok(string_array(&reply))
    }

    async fn list_users(&mut self) -> Result<Vec<String>> {
        let reply =
            self.admin_command(&serde_json::json!({ "usersInfo": 1 }), "list users").await?;
        Ok(reply["users"]
            .as_array()
            .map(|users| {
                users.iter().filter_map(|u| u["user"].as_str().map(str::to_string)).collect()
            })
            .unwrap_or_default())
    }

    async fn list_child_resources(&mut self, database: &ResourceName) -> Result<Vec<String>> {
        let reply = self
            .eval_checked(
                &format!("{}.getCollectionNames()", sibling(database.as_str())),
                "list collections",
            )
            .await?;
        Ok(string_array(&reply))
    }

    async fn execute_raw(
        &mut self,
        database: Option<&ResourceName>,
        input: &str,
    ) -> Result<RawResult> {
        let database = database.map_or(AUTH_DATABASE, ResourceName::as_str);

        let expression = match parse_command(input)? {
            MongoCommand::Find { collection, limit } => format!(
                "{}.getCollection({}).find({{}}).limit({limit}).toArray()",
                sibling(database),
                js_string(collection.as_str())
            ),
            MongoCommand::RunCommand(map) => {
                format!("{}.runCommand({})", sibling(database), Value::Object(map))
            }
        };

        let stdout = self.exec.run(&self.client_args(&expression), None).await?;
        let reply = parse_reply(&stdout).map_err(DbkitError::query_failed)?;
        if let Some((_, message)) = command_failure(&reply) {
            return Err(DbkitError::query_failed(message));
        }

        Ok(match reply {
            Value::Array(documents) => RawResult::Documents(documents),
            other => RawResult::Documents(vec![other]),
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// JSON string literal, which is also a valid JavaScript string literal
fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn sibling(database: &str) -> String {
    format!("db.getSiblingDB({})", js_string(database))
}

fn script(expression: &str) -> String {
    format!(
        "print(EJSON.stringify((function () {{ try {{ return {expression}; }} catch (e) {{ \
         return {{ ok: 0, code: e.code, errmsg: String(e.message) }}; }} }})(), {{ relaxed: true }}))"
    )
}

/// The last output line parsed as JSON
fn parse_reply(stdout: &str) -> std::result::Result<Value, String> {
    let lines = output_lines(stdout);
    let last = lines.last().ok_or_else(|| "mongosh printed nothing".to_string())?;
    serde_json::from_str(last).map_err(|e| format!("Unexpected mongosh output '{last}': {e}"))
}

/// `(code, message)` for an `{ok: 0}` reply
fn command_failure(reply: &Value) -> Option<(Option<i64>, String)> {
    let ok = reply.get("ok")?.as_f64()?;
    if ok != 0.0 {
        return None;
    }
    let message = reply["errmsg"].as_str().unwrap_or("command failed").to_string();
    Some((reply["code"].as_i64(), message))
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}
