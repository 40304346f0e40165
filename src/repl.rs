//! Interactive Session Loop
//!
//! A blocking, line-oriented loop over one [`EngineAdapter`].
//!
//! # Relational Sessions
//! Lines accumulate in a buffer until one ends with `;`; the buffered statement is then sent
//! to [`EngineAdapter::execute_raw`]. A partial statement at end of input is discarded.
//!
//! # Document-Store Sessions
//! Every line is a complete command. Three verbs are handled locally:
//! - `use <db>` switches the tracked current database
//! - `show dbs` lists databases
//! - `show collections` lists collections of the current database
//!
//! Everything else goes to the adapter together with the current database.
//!
//! # Termination
//! `\q`, `quit` or `exit` (any case) at the start of a statement, or end of input.
//!
//! Results go to `out`; prompts and `ERROR:` lines go to `diag`. A failing statement never
//! ends the session.

use std::io::{BufRead, Write};

use crate::engine::EngineAdapter;
use crate::error::{DbkitError, Result};
use crate::output::{render_error, render_list, render_raw};
use crate::safety::{validate_identifier, IdentKind, ResourceName};

/// Mutable session state, owned by the loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplState {
    /// Database selected with `use` (document store only)
    pub current_database: Option<ResourceName>,
    /// Accumulated partial statement (relational only)
    pub buffer: String,
}

/// Run the session until quit or end of input, returning the final state
///
/// # Errors
/// Only failures of the interactive streams end the loop with an error.
pub async fn run_repl<R, W, E>(
    adapter: &mut dyn EngineAdapter,
    mut input: R,
    mut out: W,
    mut diag: E,
) -> Result<ReplState>
where
    R: BufRead,
    W: Write,
    E: Write,
{
    let engine = adapter.kind();
    let mut state = ReplState::default();
    let mut line = String::new();

    tracing::debug!(engine = %engine, "session started");

    loop {
        write!(diag, "{}", prompt(engine.as_str(), &state))?;
        diag.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            if !state.buffer.trim().is_empty() {
                tracing::debug!("discarding unterminated statement");
            }
            writeln!(diag)?;
            break;
        }

        let trimmed = line.trim();
        if state.buffer.is_empty() && is_quit(trimmed) {
            break;
        }

        let outcome = if engine.is_relational() {
            match take_statement(&mut state, &line) {
                Some(statement) => run_statement(adapter, None, &statement, &mut out).await,
                None => continue,
            }
        } else {
            if trimmed.is_empty() {
                continue;
            }
            document_command(adapter, &mut state, trimmed, &mut out).await
        };

        match outcome {
            Ok(()) => {}
            Err(DbkitError::Io(io)) => return Err(DbkitError::Io(io)),
            Err(e) => render_error(&mut diag, &e.message())?,
        }
        out.flush()?;
    }

    tracing::debug!(engine = %engine, "session ended");
    Ok(state)
}

fn prompt(engine: &str, state: &ReplState) -> String {
    match (&state.current_database, state.buffer.is_empty()) {
        (_, false) => format!("{}-> ", " ".repeat(engine.len().saturating_sub(1))),
        (Some(db), true) => format!("{engine}:{db}> "),
        (None, true) => format!("{engine}> "),
    }
}

fn is_quit(line: &str) -> bool {
    let word = line.trim_end_matches(';').trim();
    word == "\\q" || word.eq_ignore_ascii_case("quit") || word.eq_ignore_ascii_case("exit")
}

/// Append `line` to the buffer; return the statement once it is terminated by `;`
fn take_statement(state: &mut ReplState, line: &str) -> Option<String> {
    let piece = line.trim_end();
    if piece.trim().is_empty() && state.buffer.is_empty() {
        return None;
    }

    if !state.buffer.is_empty() {
        state.buffer.push('\n');
    }
    state.buffer.push_str(piece);

    if !piece.ends_with(';') {
        return None;
    }

    let statement = state.buffer.trim().trim_end_matches(';').trim().to_string();
    state.buffer.clear();
    (!statement.is_empty()).then_some(statement)
}

async fn run_statement<W: Write>(
    adapter: &mut dyn EngineAdapter,
    database: Option<&ResourceName>,
    statement: &str,
    out: &mut W,
) -> Result<()> {
    let result = adapter.execute_raw(database, statement).await?;
    render_raw(out, &result)?;
    Ok(())
}

async fn document_command<W: Write>(
    adapter: &mut dyn EngineAdapter,
    state: &mut ReplState,
    line: &str,
    out: &mut W,
) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();

    match words.as_slice() {
        [verb, db] if verb.eq_ignore_ascii_case("use") => {
            let db = validate_identifier(db, IdentKind::Database)?;
            writeln!(out, "switched to db {db}")?;
            state.current_database = Some(db);
            Ok(())
        }
        [verb, what] if verb.eq_ignore_ascii_case("show") => {
            let mut items = if what.eq_ignore_ascii_case("dbs") || what.eq_ignore_ascii_case("databases") {
                adapter.list_databases().await?
            } else if what.eq_ignore_ascii_case("collections") {
                let db = state.current_database.as_ref().ok_or_else(|| {
                    DbkitError::query_failed("No database selected (run 'use <db>' first)")
                })?;
                adapter.list_child_resources(db).await?
            } else {
                return Err(DbkitError::query_failed(format!(
                    "Unknown show target '{what}' (expected dbs or collections)"
                )));
            };
            items.sort();
            render_list(out, &items)?;
            Ok(())
        }
        _ => run_statement(adapter, state.current_database.as_ref(), line, out).await,
    }
}
