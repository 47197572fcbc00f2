//! Storage engine dialects
//!
//! A closed set of engines, each answering the same questions: how to quote
//! identifiers, which native type backs a scalar kind, where to connect by
//! default, and how to spell the statement fragments that differ between
//! engines (upsert, limit/offset, list predicates, regex matching).
//!
//! Dialects carry no state. Every builder here is a pure function of its
//! arguments plus the static type tables in [`types`].

mod types;

use crate::value::{ScalarKind, Value};
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Largest LIMIT MariaDB accepts; stands in for "no limit" when only an offset is wanted
const MARIADB_MAX_LIMIT: &str = "18446744073709551615";

/// Supported storage engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    H2,
    Sqlite,
    #[serde(rename = "mariadb")]
    MariaDb,
    Postgres,
    #[serde(rename = "duckdb")]
    DuckDb,
    #[serde(rename = "mongodb")]
    Mongo,
}

/// How a dialect expresses insert-or-update by identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// Single engine-native verb, e.g. `INSERT OR REPLACE INTO`
    Replace(&'static str),
    /// `INSERT INTO ... ON CONFLICT (id) DO UPDATE SET col=EXCLUDED.col`
    OnConflict,
    /// No single statement; the executor checks for the row and branches
    Conditional,
    /// Whole-document replace on a document store
    Document,
}

impl Dialect {
    /// Configuration key for this dialect
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::H2 => "h2",
            Dialect::Sqlite => "sqlite",
            Dialect::MariaDb => "mariadb",
            Dialect::Postgres => "postgres",
            Dialect::DuckDb => "duckdb",
            Dialect::Mongo => "mongodb",
        }
    }

    pub fn all() -> &'static [Dialect] {
        &[
            Dialect::H2,
            Dialect::Sqlite,
            Dialect::MariaDb,
            Dialect::Postgres,
            Dialect::DuckDb,
            Dialect::Mongo,
        ]
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Dialect::Mongo)
    }

    /// Native type for a scalar kind, or `None` when the engine cannot store it
    pub fn native_type(&self, kind: ScalarKind) -> Option<&'static str> {
        types::native_type(*self, kind)
    }

    /// Identifier quote character
    pub fn quote(&self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::MariaDb => "`",
            Dialect::H2 | Dialect::Postgres | Dialect::DuckDb => "\"",
            Dialect::Mongo => "",
        }
    }

    /// Connection target used when the caller supplies none
    pub fn default_location(&self) -> &'static str {
        match self {
            Dialect::H2 => "h2:mem:temporary",
            Dialect::Sqlite => "sqlite::memory:",
            Dialect::MariaDb => "mariadb:mem:temporary",
            Dialect::Postgres => "postgresql://localhost:9999/",
            Dialect::DuckDb => "duckdb:",
            Dialect::Mongo => "mongodb:mem:temporary",
        }
    }

    pub fn normalize_column_name(&self, name: &str) -> String {
        match self {
            // Postgres folds unquoted identifiers to lower case
            Dialect::Postgres => name.to_lowercase(),
            _ => name.to_string(),
        }
    }

    /// Normalized and quoted column reference
    pub fn column(&self, name: &str) -> String {
        if self.is_document() {
            return document_field(name).to_string();
        }
        let q = self.quote();
        format!("{q}{}{q}", self.normalize_column_name(name))
    }

    /// Quoted table reference
    pub fn table(&self, name: &str) -> String {
        let q = self.quote();
        format!("{q}{name}{q}")
    }

    /// Render a value as a SQL literal
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => "NULL".to_string(),
            Value::Text(s) => self.string_literal(s),
            Value::List(items) => match self {
                Dialect::DuckDb => format!(
                    "[{}]",
                    items
                        .iter()
                        .map(|item| self.string_literal(item))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                _ => self.string_literal(&value.to_json().to_string()),
            },
        }
    }

    pub fn string_literal(&self, s: &str) -> String {
        let escaped = s.replace('\'', "''");
        match self {
            // backslash is an escape character inside MariaDB string literals
            Dialect::MariaDb => format!("'{}'", escaped.replace('\\', "\\\\")),
            _ => format!("'{}'", escaped),
        }
    }

    /// Function that measures string length
    pub fn length_function(&self) -> &'static str {
        match self {
            Dialect::MariaDb => "CHAR_LENGTH",
            _ => "LENGTH",
        }
    }

    pub fn supports_window(&self) -> bool {
        !self.is_document()
    }

    pub fn upsert_strategy(&self) -> UpsertStrategy {
        match self {
            Dialect::Sqlite | Dialect::DuckDb => UpsertStrategy::Replace("INSERT OR REPLACE INTO"),
            Dialect::H2 => UpsertStrategy::Replace("MERGE INTO"),
            Dialect::Postgres => UpsertStrategy::OnConflict,
            Dialect::MariaDb => UpsertStrategy::Conditional,
            Dialect::Mongo => UpsertStrategy::Document,
        }
    }

    /// Build an insert-or-replace statement.
    ///
    /// `columns` are quoted column references with the identity column first;
    /// each row holds rendered literals in the same order. Returns `None` when
    /// the dialect has no single-statement upsert.
    pub fn command_upsert(&self, table: &str, columns: &[String], rows: &[Vec<String>]) -> Option<String> {
        let values = rows
            .iter()
            .map(|row| format!("({})", row.join(", ")))
            .collect::<Vec<_>>()
            .join(", ");
        let head = format!("{} ({}) VALUES {}", self.table(table), columns.join(", "), values);

        match self.upsert_strategy() {
            UpsertStrategy::Replace(verb) => Some(format!("{} {}", verb, head)),
            UpsertStrategy::OnConflict => {
                let id = columns.first()?;
                let updates = columns[1..]
                    .iter()
                    .map(|c| format!("{c}=EXCLUDED.{c}"))
                    .collect::<Vec<_>>();
                if updates.is_empty() {
                    Some(format!("INSERT INTO {} ON CONFLICT ({}) DO NOTHING", head, id))
                } else {
                    Some(format!(
                        "INSERT INTO {} ON CONFLICT ({}) DO UPDATE SET {}",
                        head,
                        id,
                        updates.join(", ")
                    ))
                }
            }
            UpsertStrategy::Conditional | UpsertStrategy::Document => None,
        }
    }

    /// LIMIT/OFFSET clause with a leading space, or empty
    pub fn command_limit_and_offset(&self, limit: Option<usize>, offset: Option<usize>) -> String {
        let limit = limit.filter(|n| *n > 0);
        let offset = offset.filter(|n| *n > 0);
        let mut clause = String::new();

        match (limit, offset) {
            (Some(n), _) => clause.push_str(&format!(" LIMIT {}", n)),
            // these engines reject OFFSET without LIMIT
            (None, Some(_)) if *self == Dialect::MariaDb => {
                clause.push_str(&format!(" LIMIT {}", MARIADB_MAX_LIMIT))
            }
            (None, Some(_)) if *self == Dialect::Sqlite => clause.push_str(" LIMIT -1"),
            (None, _) => {}
        }
        if let Some(n) = offset {
            clause.push_str(&format!(" OFFSET {}", n));
        }
        clause
    }

    /// Length of a list column, if the engine can compute it
    pub fn command_list_length(&self, column: &str) -> Option<String> {
        match self {
            Dialect::Sqlite => Some(format!("json_array_length({})", column)),
            Dialect::MariaDb => Some(format!("JSON_LENGTH({})", column)),
            Dialect::DuckDb => Some(format!("len({})", column)),
            Dialect::H2 | Dialect::Postgres | Dialect::Mongo => None,
        }
    }

    /// Membership test on a list column, if the engine can express it
    pub fn command_list_contains(&self, column: &str, value: &str) -> Option<String> {
        match self {
            // json_array_contains is registered on every SQLite connection
            Dialect::Sqlite => Some(format!(
                "json_array_contains({}, {})",
                column,
                self.string_literal(value)
            )),
            Dialect::MariaDb => {
                let json = serde_json::Value::String(value.to_string()).to_string();
                Some(format!("JSON_CONTAINS({}, {}, '$')", column, self.string_literal(&json)))
            }
            Dialect::DuckDb => Some(format!(
                "list_contains({}, {})",
                column,
                self.string_literal(value)
            )),
            Dialect::H2 | Dialect::Postgres | Dialect::Mongo => None,
        }
    }

    /// Regular-expression match on a column
    pub fn command_regex(&self, column: &str, pattern: &str) -> Option<String> {
        let pattern = self.string_literal(pattern);
        match self {
            Dialect::H2 | Dialect::Sqlite | Dialect::MariaDb => {
                Some(format!("{} REGEXP {}", column, pattern))
            }
            Dialect::Postgres => Some(format!("{} ~ {}", column, pattern)),
            Dialect::DuckDb => Some(format!("regexp_matches({}, {})", column, pattern)),
            Dialect::Mongo => None,
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` with the identity column first
    pub fn command_create_table(&self, table: &str, columns: &[(String, &'static str)]) -> String {
        let id_type = self.native_type(ScalarKind::Long).unwrap_or("bigint");
        let mut defs = vec![format!("{} {} PRIMARY KEY", self.column(crate::model::ID_COLUMN), id_type)];
        defs.extend(columns.iter().map(|(column, native)| format!("{} {}", column, native)));
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.table(table), defs.join(", "))
    }

    pub fn requires_database_creation(&self) -> bool {
        matches!(self, Dialect::MariaDb)
    }

    /// Split a server URL into (server base, database name)
    pub fn split_database_url(&self, url: &str) -> Result<(String, String)> {
        let pattern = match self {
            Dialect::MariaDb => r"^(?:jdbc:)?(mariadb://.+/)([^?/]+)",
            Dialect::Postgres => r"^(?:jdbc:)?(postgres(?:ql)?://.+/)([^?/]+)",
            _ => {
                return Err(Error::unsupported(*self, "database creation"));
            }
        };
        let re = Regex::new(pattern).map_err(|e| Error::MalformedConfiguration(e.to_string()))?;
        let caps = re.captures(url).ok_or_else(|| {
            Error::MalformedConfiguration(format!("Invalid {} URL [{}]", self.display_name(), url))
        })?;
        Ok((caps[1].to_string(), caps[2].to_string()))
    }

    pub fn command_create_database(&self, name: &str) -> Option<String> {
        match self {
            Dialect::MariaDb => Some(format!(
                "CREATE DATABASE IF NOT EXISTS {} DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_bin",
                self.table(name)
            )),
            _ => None,
        }
    }

    /// Resolve the dialect from a connection URL scheme
    pub fn from_url(url: &str) -> Result<Dialect> {
        let url = strip_jdbc(url);
        let scheme = url
            .split(':')
            .next()
            .filter(|s| !s.is_empty() && s.len() < url.len())
            .ok_or_else(|| Error::MalformedConfiguration(format!("No scheme in URL [{}]", url)))?;
        scheme.parse()
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Dialect::H2 => "H2",
            Dialect::Sqlite => "SQLite",
            Dialect::MariaDb => "MariaDB",
            Dialect::Postgres => "PostgreSQL",
            Dialect::DuckDb => "DuckDB",
            Dialect::Mongo => "MongoDB",
        }
    }

    /// Capability flags, for diagnostics
    pub fn capabilities(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("list length", self.command_list_length("c").is_some()),
            ("list contains", self.command_list_contains("c", "v").is_some()),
            ("regex match", self.command_regex("c", "p").is_some() || self.is_document()),
            ("windowed average", self.supports_window()),
            (
                "single-statement upsert",
                matches!(
                    self.upsert_strategy(),
                    UpsertStrategy::Replace(_) | UpsertStrategy::OnConflict
                ),
            ),
            ("database creation", self.requires_database_creation()),
        ]
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "h2" => Ok(Dialect::H2),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "mariadb" | "mysql" => Ok(Dialect::MariaDb),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "duckdb" | "duck" => Ok(Dialect::DuckDb),
            "mongodb" | "mongo" | "mongodb+srv" => Ok(Dialect::Mongo),
            _ => Err(Error::MalformedConfiguration(format!("Unknown dialect: {}", s))),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Drop an optional `jdbc:` prefix
pub fn strip_jdbc(url: &str) -> &str {
    url.strip_prefix("jdbc:").unwrap_or(url)
}

/// Document field name for a property; identity lives in `_id`
pub fn document_field(name: &str) -> &str {
    if name == crate::model::ID_COLUMN { "_id" } else { name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_str_aliases() {
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::MariaDb);
        assert!("oracle".parse::<Dialect>().is_err());
        for dialect in Dialect::all() {
            assert_eq!(dialect.as_str().parse::<Dialect>().unwrap(), *dialect);
        }
    }

    #[test]
    fn test_from_url() {
        assert_eq!(Dialect::from_url("jdbc:sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("mariadb://db:3306/app").unwrap(), Dialect::MariaDb);
        assert_eq!(Dialect::from_url("postgresql://localhost:9999/").unwrap(), Dialect::Postgres);
        assert!(Dialect::from_url("no-scheme").is_err());
    }

    #[test]
    fn test_column_quoting_and_normalization() {
        assert_eq!(Dialect::Postgres.column("firstName"), "\"firstname\"");
        assert_eq!(Dialect::MariaDb.column("order"), "`order`");
        assert_eq!(Dialect::H2.column("firstName"), "\"firstName\"");
        assert_eq!(Dialect::Mongo.column("id"), "_id");
    }

    #[test]
    fn test_string_literals_are_escaped() {
        assert_eq!(Dialect::Sqlite.string_literal("it's"), "'it''s'");
        assert_eq!(Dialect::MariaDb.string_literal(r"a\b"), r"'a\\b'");
        assert_eq!(
            Dialect::DuckDb.literal(&Value::List(vec!["a".into(), "b".into()])),
            "['a', 'b']"
        );
        assert_eq!(
            Dialect::Sqlite.literal(&Value::List(vec!["a".into()])),
            r#"'["a"]'"#
        );
    }

    #[test]
    fn test_upsert_verbs() {
        let columns = vec!["\"id\"".to_string(), "\"age\"".to_string()];
        let rows = vec![vec!["1".to_string(), "10".to_string()]];

        let duck = Dialect::DuckDb.command_upsert("Person", &columns, &rows).unwrap();
        assert_eq!(duck, "INSERT OR REPLACE INTO \"Person\" (\"id\", \"age\") VALUES (1, 10)");

        let h2 = Dialect::H2.command_upsert("Person", &columns, &rows).unwrap();
        assert!(h2.starts_with("MERGE INTO \"Person\""));

        let pg = Dialect::Postgres.command_upsert("Person", &columns, &rows).unwrap();
        assert_eq!(
            pg,
            "INSERT INTO \"Person\" (\"id\", \"age\") VALUES (1, 10) ON CONFLICT (\"id\") DO UPDATE SET \"age\"=EXCLUDED.\"age\""
        );

        assert!(Dialect::MariaDb.command_upsert("Person", &columns, &rows).is_none());
    }

    #[test]
    fn test_limit_and_offset() {
        assert_eq!(Dialect::Postgres.command_limit_and_offset(Some(10), Some(5)), " LIMIT 10 OFFSET 5");
        assert_eq!(Dialect::Postgres.command_limit_and_offset(None, Some(5)), " OFFSET 5");
        assert_eq!(Dialect::Postgres.command_limit_and_offset(Some(0), None), "");
        assert_eq!(
            Dialect::MariaDb.command_limit_and_offset(None, Some(5)),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(Dialect::MariaDb.command_limit_and_offset(Some(3), None), " LIMIT 3");
    }

    #[test]
    fn test_list_commands_are_capability_gated() {
        assert_eq!(Dialect::DuckDb.command_list_length("tags").unwrap(), "len(tags)");
        assert_eq!(
            Dialect::MariaDb.command_list_contains("tags", "a").unwrap(),
            r#"JSON_CONTAINS(tags, '"a"', '$')"#
        );
        assert!(Dialect::Postgres.command_list_length("tags").is_none());
        assert!(Dialect::H2.command_list_contains("tags", "a").is_none());
    }

    #[test]
    fn test_regex_commands() {
        assert_eq!(Dialect::DuckDb.command_regex("name", "^a").unwrap(), "regexp_matches(name, '^a')");
        assert_eq!(Dialect::Postgres.command_regex("name", "^a").unwrap(), "name ~ '^a'");
        assert_eq!(Dialect::Sqlite.command_regex("name", "^a").unwrap(), "name REGEXP '^a'");
    }

    #[test]
    fn test_split_database_url() {
        let (base, db) = Dialect::MariaDb
            .split_database_url("jdbc:mariadb://localhost:3306/shop?useSSL=false")
            .unwrap();
        assert_eq!(base, "mariadb://localhost:3306/");
        assert_eq!(db, "shop");

        let err = Dialect::MariaDb.split_database_url("mariadb:oops").unwrap_err();
        assert!(matches!(err, Error::MalformedConfiguration(ref m) if m.contains("Invalid MariaDB URL")));
    }

    #[test]
    fn test_create_table() {
        let sql = Dialect::Sqlite.command_create_table("Person", &[("`age`".to_string(), "integer")]);
        assert_eq!(sql, "CREATE TABLE IF NOT EXISTS `Person` (`id` integer PRIMARY KEY, `age` integer)");
    }
}
