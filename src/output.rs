//! Result Rendering
//!
//! Everything dbkit prints on stdout goes through this module.
//!
//! # Output Contract
//! - Row sets: a tab-separated header line, then one tab-separated line per row
//! - SQL NULL / JSON null renders as `NULL`
//! - Tabs, newlines and carriage returns inside values are escaped (`\t`, `\n`, `\r`) so one
//!   row is always one line
//! - Affected-row counts: `OK <n> row(s) affected`
//! - Document-store replies: one compact JSON document per line
//! - Listings (`dbs`, `users`, ...): one name per line
//!
//! REPL diagnostics (`ERROR: ...`, prompts) and logs never go to stdout.

use std::io::{self, Write};

use crate::engine::{RawResult, RowSet};

/// Render one cell
#[must_use]
pub fn format_value(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => escape_cell(s),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        // Nested JSON (JSONB columns) stays compact JSON
        Value::Array(_) | Value::Object(_) => escape_cell(&value.to_string()),
    }
}

fn escape_cell(s: &str) -> String {
    if !s.contains(['\t', '\n', '\r']) {
        return s.to_string();
    }
    s.replace('\t', "\\t").replace('\n', "\\n").replace('\r', "\\r")
}

/// Write a tabular result (header first, even when there are no rows)
pub fn render_rows<W: Write + ?Sized>(out: &mut W, set: &RowSet) -> io::Result<()> {
    let header: Vec<String> = set.columns.iter().map(|c| escape_cell(c)).collect();
    writeln!(out, "{}", header.join("\t"))?;

    for row in &set.rows {
        let cells: Vec<String> = row.iter().map(format_value).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    Ok(())
}

/// Write any REPL result
pub fn render_raw<W: Write + ?Sized>(out: &mut W, result: &RawResult) -> io::Result<()> {
    match result {
        RawResult::Rows(set) => render_rows(out, set),
        RawResult::Affected(n) => writeln!(out, "OK {n} row(s) affected"),
        RawResult::Message(message) => writeln!(out, "{message}"),
        RawResult::Documents(documents) => {
            for document in documents {
                writeln!(out, "{document}")?;
            }
            Ok(())
        }
    }
}

/// Write one name per line
pub fn render_list<W: Write + ?Sized, S: AsRef<str>>(out: &mut W, items: &[S]) -> io::Result<()> {
    for item in items {
        writeln!(out, "{}", item.as_ref())?;
    }
    Ok(())
}

/// Write a REPL error line
pub fn render_error<W: Write + ?Sized>(diag: &mut W, message: &str) -> io::Result<()> {
    writeln!(diag, "ERROR: {message}")
}
