//! Connections, drivers and the process-wide handle pool
//!
//! Executors never open connections themselves. They ask the pool for the
//! handle of a URL; the pool opens it once through the first registered
//! [`Driver`] that accepts the URL and shares it until [`release`] is called.
//!
//! Built-in drivers cover SQLite (`sqlite:` URLs, via rusqlite) and an
//! in-process document engine (`mongodb:mem:` URLs). Other engines plug in by
//! registering a driver with [`register_driver`].

pub mod document;
pub mod sqlite;

pub use document::{MemoryDocumentDriver, MemoryDocumentStore};
pub use sqlite::{SqliteConnection, SqliteDriver};

use crate::dialect::{strip_jdbc, Dialect};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, info};

/// One result row, in select-list order
pub type Row = Vec<Value>;

/// A stored document; identity lives under `_id`
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Text-statement connection to a SQL engine
pub trait SqlConnection: Send {
    /// Run a statement that returns no rows; yields the affected row count
    fn execute(&mut self, sql: &str) -> Result<usize>;

    fn query(&mut self, sql: &str) -> Result<Vec<Row>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Session on a document store
pub trait DocumentConnection: Send {
    /// Insert the document, replacing any document with the same identity
    fn replace(&mut self, collection: &str, id: i64, document: Document) -> Result<()>;

    fn find(
        &mut self,
        collection: &str,
        filter: &serde_json::Value,
        sort: &[(String, bool)],
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// Overwrite some fields of one document; false when it does not exist
    fn update_fields(&mut self, collection: &str, id: i64, fields: Document) -> Result<bool>;

    fn delete(&mut self, collection: &str, filter: &serde_json::Value) -> Result<usize>;

    fn count(&mut self, collection: &str, filter: &serde_json::Value) -> Result<usize>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An open native connection
pub enum Connection {
    Sql(Box<dyn SqlConnection>),
    Document(Box<dyn DocumentConnection>),
}

impl Connection {
    fn close(&mut self) -> Result<()> {
        match self {
            Connection::Sql(conn) => conn.close(),
            Connection::Document(conn) => conn.close(),
        }
    }
}

/// Opens connections for one dialect
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    fn accepts(&self, url: &str) -> bool;

    fn connect(&self, url: &str) -> Result<Connection>;
}

fn drivers() -> &'static RwLock<Vec<Arc<dyn Driver>>> {
    static DRIVERS: OnceLock<RwLock<Vec<Arc<dyn Driver>>>> = OnceLock::new();
    DRIVERS.get_or_init(|| {
        RwLock::new(vec![
            Arc::new(SqliteDriver) as Arc<dyn Driver>,
            Arc::new(MemoryDocumentDriver) as Arc<dyn Driver>,
        ])
    })
}

/// Register a driver; later registrations take precedence
pub fn register_driver(driver: Arc<dyn Driver>) {
    debug!("Registering {} driver for {}", driver.name(), driver.dialect());
    drivers()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .push(driver);
}

/// Find the driver for a URL
pub fn find_driver(dialect: Dialect, url: &str) -> Result<Arc<dyn Driver>> {
    drivers()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .rev()
        .find(|d| d.dialect() == dialect && d.accepts(url))
        .cloned()
        .ok_or_else(|| {
            Error::Backend(format!("no {} driver registered for URL [{}]", dialect, url))
        })
}

/// Shared connection for one URL; a serialization point for its users
pub struct Handle {
    url: String,
    dialect: Dialect,
    conn: Mutex<Option<Connection>>,
}

impl Handle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Run `f` with exclusive access to the SQL connection
    pub fn with_sql<R>(&self, f: impl FnOnce(&mut dyn SqlConnection) -> Result<R>) -> Result<R> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            None => Err(Error::ClosedBackend(self.url.clone())),
            Some(Connection::Sql(conn)) => f(conn.as_mut()),
            Some(Connection::Document(_)) => {
                Err(Error::Backend(format!("{} is not a SQL connection", self.url)))
            }
        }
    }

    /// Run `f` with exclusive access to the document session
    pub fn with_documents<R>(
        &self,
        f: impl FnOnce(&mut dyn DocumentConnection) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            None => Err(Error::ClosedBackend(self.url.clone())),
            Some(Connection::Document(conn)) => f(conn.as_mut()),
            Some(Connection::Sql(_)) => {
                Err(Error::Backend(format!("{} is not a document connection", self.url)))
            }
        }
    }

    pub fn execute(&self, sql: &str) -> Result<usize> {
        debug!(url = %self.url, "{}", sql);
        self.with_sql(|conn| conn.execute(sql))
    }

    pub fn query(&self, sql: &str) -> Result<Vec<Row>> {
        debug!(url = %self.url, "{}", sql);
        self.with_sql(|conn| conn.query(sql))
    }

    fn close(&self) -> Result<()> {
        let taken = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        match taken {
            Some(mut conn) => conn.close(),
            None => Ok(()),
        }
    }
}

fn handles() -> &'static Mutex<HashMap<String, Arc<Handle>>> {
    static HANDLES: OnceLock<Mutex<HashMap<String, Arc<Handle>>>> = OnceLock::new();
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get the shared handle for a URL, connecting on first use
pub fn acquire(dialect: Dialect, url: &str) -> Result<Arc<Handle>> {
    let url = strip_jdbc(url);
    let mut handles = handles().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = handles.get(url) {
        if handle.dialect != dialect {
            return Err(Error::MalformedConfiguration(format!(
                "{} is already open as {}",
                url, handle.dialect
            )));
        }
        return Ok(handle.clone());
    }

    let driver = find_driver(dialect, url)?;
    let conn = driver.connect(url)?;
    info!("Opened {} connection to {} ({})", dialect, url, driver.name());

    let handle = Arc::new(Handle {
        url: url.to_string(),
        dialect,
        conn: Mutex::new(Some(conn)),
    });
    handles.insert(url.to_string(), handle.clone());
    Ok(handle)
}

/// Close the connection for a URL and forget it; true if one was open.
///
/// Holders of the old handle get `ClosedBackend` from then on; the next
/// `acquire` opens a fresh connection.
pub fn release(url: &str) -> Result<bool> {
    let url = strip_jdbc(url);
    let removed = handles().lock().unwrap_or_else(|e| e.into_inner()).remove(url);
    match removed {
        Some(handle) => {
            handle.close()?;
            info!("Released connection to {}", url);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Run the dialect's CREATE DATABASE step for a server URL
pub fn create_database(dialect: Dialect, url: &str) -> Result<()> {
    let url = strip_jdbc(url);
    let (base, name) = dialect.split_database_url(url)?;
    let Some(statement) = dialect.command_create_database(&name) else {
        return Ok(());
    };

    let driver = find_driver(dialect, &base)?;
    match driver.connect(&base)? {
        Connection::Sql(mut conn) => {
            debug!(url = %base, "{}", statement);
            conn.execute(&statement)?;
            conn.close()
        }
        Connection::Document(mut conn) => conn.close(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Driver whose connections record every statement and answer queries
    /// with a single `0` (counts) or NULL (maxima) cell
    pub(crate) struct RecordingDriver {
        pub dialect: Dialect,
        pub prefix: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingConnection {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SqlConnection for RecordingConnection {
        fn execute(&mut self, sql: &str) -> Result<usize> {
            self.log.lock().unwrap().push(sql.to_string());
            Ok(1)
        }

        fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
            self.log.lock().unwrap().push(sql.to_string());
            if sql.starts_with("SELECT COUNT") {
                Ok(vec![vec![Value::Int(0)]])
            } else if sql.starts_with("SELECT MAX") {
                Ok(vec![vec![Value::Null]])
            } else {
                Ok(Vec::new())
            }
        }
    }

    impl Driver for RecordingDriver {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn dialect(&self) -> Dialect {
            self.dialect
        }

        fn accepts(&self, url: &str) -> bool {
            url.starts_with(self.prefix)
        }

        fn connect(&self, _url: &str) -> Result<Connection> {
            Ok(Connection::Sql(Box::new(RecordingConnection { log: self.log.clone() })))
        }
    }

    pub(crate) fn recording(dialect: Dialect, prefix: &'static str) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        register_driver(Arc::new(RecordingDriver { dialect, prefix, log: log.clone() }));
        log
    }

    #[test]
    fn test_acquire_shares_one_handle_per_url() {
        let a = acquire(Dialect::Sqlite, "sqlite:mem:pool_share").unwrap();
        let b = acquire(Dialect::Sqlite, "jdbc:sqlite:mem:pool_share").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        release("sqlite:mem:pool_share").unwrap();
    }

    #[test]
    fn test_release_closes_handle() {
        let handle = acquire(Dialect::Sqlite, "sqlite:mem:pool_release").unwrap();
        handle.execute("CREATE TABLE t (x integer)").unwrap();

        assert!(release("sqlite:mem:pool_release").unwrap());
        assert!(handle.is_closed());
        assert!(matches!(handle.query("SELECT 1"), Err(Error::ClosedBackend(_))));
        assert!(!release("sqlite:mem:pool_release").unwrap());

        // a fresh acquire opens a new, empty database
        let fresh = acquire(Dialect::Sqlite, "sqlite:mem:pool_release").unwrap();
        assert!(fresh.query("SELECT x FROM t").is_err());
        release("sqlite:mem:pool_release").unwrap();
    }

    #[test]
    fn test_unknown_engine_has_no_driver() {
        let err = acquire(Dialect::H2, "h2:mem:nobody_home").err().unwrap();
        assert!(err.is_backend_failure());
    }

    #[test]
    fn test_create_database_issues_statement() {
        let log = recording(Dialect::MariaDb, "mariadb://createdb-host");
        create_database(Dialect::MariaDb, "jdbc:mariadb://createdb-host:3306/shop?x=1").unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["CREATE DATABASE IF NOT EXISTS `shop` DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"]
        );

        let err = create_database(Dialect::MariaDb, "mariadb:not-a-server").unwrap_err();
        assert!(matches!(err, Error::MalformedConfiguration(_)));
    }
}
