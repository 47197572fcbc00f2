//! SQLite driver backed by rusqlite
//!
//! URLs: `sqlite::memory:` or `sqlite:mem:<name>` open a private in-memory
//! database (one per pooled handle); anything else after `sqlite:` is a file
//! path.

use super::{Connection, Driver, Row, SqlConnection};
use crate::dialect::Dialect;
use crate::value::Value;
use crate::{Error, Result};
use regex::Regex;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use std::sync::Arc;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "rusqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("sqlite:")
    }

    fn connect(&self, url: &str) -> Result<Connection> {
        Ok(Connection::Sql(Box::new(SqliteConnection::open(url)?)))
    }
}

/// Open SQLite database with the helper functions registered
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    pub fn open(url: &str) -> Result<Self> {
        let target = url
            .strip_prefix("sqlite:")
            .ok_or_else(|| Error::MalformedConfiguration(format!("Not a SQLite URL [{}]", url)))?;

        let conn = if target.is_empty() || target == ":memory:" || target.starts_with("mem:") {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(target.trim_start_matches("//"))?
        };

        let store = Self { conn };
        store.bootstrap();
        Ok(store)
    }

    /// Pragmas and helper functions; failures are logged and ignored
    fn bootstrap(&self) {
        if let Err(e) = self.conn.query_row("PRAGMA journal_mode=wal", [], |_| Ok(())) {
            debug!("journal_mode pragma not applied: {}", e);
        }
        if let Err(e) = self.conn.execute_batch("PRAGMA synchronous=off") {
            debug!("synchronous pragma not applied: {}", e);
        }
        if let Err(e) = self.register_functions() {
            debug!("helper function registration failed: {}", e);
        }
    }

    fn register_functions(&self) -> rusqlite::Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

        // `x REGEXP p` calls regexp(p, x)
        self.conn.create_scalar_function("regexp", 2, flags, |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |raw| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(raw.as_str()?)?)
            })?;
            Ok(text_arg(ctx, 1).is_some_and(|text| pattern.is_match(text)))
        })?;

        self.conn.create_scalar_function("json_array_contains", 2, flags, |ctx| {
            let Some(json) = text_arg(ctx, 0) else {
                return Ok(false);
            };
            let needle: String = ctx.get(1)?;
            let items: Vec<serde_json::Value> = serde_json::from_str(json)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(items.iter().any(|item| match item {
                serde_json::Value::String(s) => *s == needle,
                other => other.to_string() == needle,
            }))
        })?;

        Ok(())
    }

    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

fn text_arg<'a>(ctx: &'a Context<'_>, index: usize) -> Option<&'a str> {
    match ctx.get_raw(index) {
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

impl SqlConnection for SqliteConnection {
    fn execute(&mut self, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(sql, [])?)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sqlite(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_memory() -> SqliteConnection {
        SqliteConnection::open("sqlite::memory:").unwrap()
    }

    #[test]
    fn test_regexp_function() {
        let mut conn = open_memory();
        conn.execute("CREATE TABLE t (name text)").unwrap();
        conn.execute("INSERT INTO t VALUES ('alice'), ('bob'), (NULL)").unwrap();

        let rows = conn.query("SELECT name FROM t WHERE name REGEXP '^a'").unwrap();
        assert_eq!(rows, vec![vec![Value::Text("alice".into())]]);
    }

    #[test]
    fn test_json_array_contains_function() {
        let mut conn = open_memory();
        conn.execute("CREATE TABLE t (tags text)").unwrap();
        conn.execute(r#"INSERT INTO t VALUES ('["a","b"]'), ('["c"]')"#).unwrap();

        let rows = conn
            .query("SELECT json_array_length(tags) FROM t WHERE json_array_contains(tags, 'b')")
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(2)]]);
    }

    #[test]
    fn test_row_values() {
        let mut conn = open_memory();
        let rows = conn.query("SELECT 1, 2.5, 'x', NULL").unwrap();
        assert_eq!(
            rows,
            vec![vec![Value::Int(1), Value::Float(2.5), Value::Text("x".into()), Value::Null]]
        );
    }

    #[test]
    fn test_file_database_persists() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("store.db").display());

        let mut conn = SqliteConnection::open(&url).unwrap();
        conn.execute("CREATE TABLE t (x integer)").unwrap();
        conn.execute("INSERT INTO t VALUES (7)").unwrap();
        drop(conn);

        let mut conn = SqliteConnection::open(&url).unwrap();
        assert_eq!(conn.query("SELECT x FROM t").unwrap(), vec![vec![Value::Int(7)]]);
    }

    #[test]
    fn test_rejects_foreign_url() {
        assert!(SqliteConnection::open("duckdb:").is_err());
    }
}
