/// SQLite schema management
///
/// The schema lives in a statement file (bundled by default). It is applied
/// when the database has not been initialized yet, tracked through
/// `PRAGMA user_version`. Every connect then checks for columns that newer
/// versions require and adds the missing ones so older database files keep
/// working.
use rusqlite::Connection;

use crate::storage::StorageError;

/// Bundled schema applied when no override is configured
pub const SQLITE_SCHEMA: &str = include_str!("../../schema/sqlite_schema.sql");

/// Current database schema version
///
/// Increment this when the schema file changes shape
const CURRENT_VERSION: i32 = 1;

/// Columns added after the first release: (table, column, definition)
///
/// SQLite refuses non-constant defaults in `ALTER TABLE ADD COLUMN`, so none
/// of these may default to `CURRENT_TIMESTAMP`.
const REQUIRED_COLUMNS: &[(&str, &str, &str)] = &[
    ("focus_sessions", "paused_at", "TEXT"),
    ("focus_sessions", "paused_duration", "INTEGER DEFAULT 0"),
    ("focus_session_interruptions", "updated_at", "TEXT"),
];

/// Initialize the database schema and heal missing columns
pub fn initialize_database(conn: &Connection, schema_sql: &str) -> Result<(), StorageError> {
    let current_version = get_current_version(conn)?;

    if current_version < CURRENT_VERSION {
        apply_schema(conn, schema_sql)?;
        set_version(conn, CURRENT_VERSION)?;
    }

    let added = ensure_columns(conn)?;
    if !added.is_empty() {
        tracing::info!("Added missing columns: {}", added.join(", "));
    }

    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<i32, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i32>(0))?)
}

fn set_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Execute every statement of a schema file
pub fn apply_schema(conn: &Connection, schema_sql: &str) -> Result<(), StorageError> {
    let statements = split_statements(schema_sql);
    for statement in &statements {
        conn.execute_batch(statement).map_err(|e| {
            StorageError::Schema(format!("Failed to execute `{}`: {}", first_line(statement), e))
        })?;
    }

    tracing::info!("Applied SQLite schema ({} statements)", statements.len());
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or_default().trim()
}

/// Split a statement file into individual statements
///
/// `--` comments are dropped. A semicolon ends a statement unless it sits in
/// a string literal or inside a `CREATE TRIGGER ... BEGIN ... END` body, where
/// only the semicolon following `END` closes the statement.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            current.push(c);
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    current.push('\'');
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }

        match c {
            '\'' => {
                in_string = true;
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                // Skip the comment up to (not including) the newline
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ';' => {
                if is_trigger(&current) && !ends_with_keyword(&current, "END") {
                    current.push(c);
                    continue;
                }
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(format!("{};", statement));
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }

    statements
}

fn is_trigger(statement: &str) -> bool {
    let words: Vec<String> = statement
        .split_whitespace()
        .take(3)
        .map(|w| w.to_uppercase())
        .collect();
    match words.as_slice() {
        [create, trigger, ..] if create == "CREATE" && trigger == "TRIGGER" => true,
        [create, temp, trigger]
            if create == "CREATE"
                && (temp == "TEMP" || temp == "TEMPORARY")
                && trigger == "TRIGGER" =>
        {
            true
        }
        _ => false,
    }
}

fn ends_with_keyword(statement: &str, keyword: &str) -> bool {
    statement
        .split_whitespace()
        .last()
        .map_or(false, |word| word.eq_ignore_ascii_case(keyword))
}

/// Column names of a table; empty when the table does not exist
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Add any required column missing from an existing table
///
/// Returns the `table.column` names that were added.
pub fn ensure_columns(conn: &Connection) -> Result<Vec<String>, StorageError> {
    let mut added = Vec::new();

    for (table, column, definition) in REQUIRED_COLUMNS {
        let columns = table_columns(conn, table)?;
        if columns.is_empty() || columns.iter().any(|c| c == column) {
            continue;
        }

        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            table, column, definition
        ))?;
        added.push(format!("{}.{}", table, column));
    }

    Ok(added)
}
