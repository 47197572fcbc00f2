//! Query executors
//!
//! A [`QueryExecutor`] serves one entity type on one backend. It owns the
//! table (or collection), compiles queries through the backend's dialect,
//! runs them on the pooled connection and decodes results into entities.
//!
//! Executors are created through [`QueryExecutor::of`], which caches them per
//! (entity type, location, table): concurrent first calls construct
//! exactly one executor. [`release`] closes a location and evicts every
//! executor using it.

mod cursor;

pub use cursor::Cursor;

use crate::backend::{self, Document, Handle, Row};
use crate::config::{self, BackendConfig};
use crate::constraint::Op;
use crate::dialect::{document_field, strip_jdbc, Dialect, UpsertStrategy};
use crate::expression::Expression;
use crate::model::{Entity, Property, ID_COLUMN};
use crate::query::{AvgOption, Query};
use crate::scheduler::{self, Token};
use crate::specifier::{PropertyRef, Specifier};
use crate::value::{Field, Numeric, ScalarKind, Value};
use crate::{Error, Result};
use cursor::Source;
use serde_json::json;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) queries: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) deletes: AtomicU64,
}

/// Statements issued by one executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub queries: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl std::fmt::Display for ExecutorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Executor Statistics:")?;
        writeln!(f, "  Queries: {}", self.queries)?;
        writeln!(f, "  Writes: {}", self.writes)?;
        writeln!(f, "  Deletes: {}", self.deletes)
    }
}

struct Bulk<E> {
    queued: Vec<E>,
    timer: Option<Token>,
}

type CacheKey = (TypeId, String, String);
type Slot = Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>;

fn cache() -> &'static Mutex<HashMap<CacheKey, Slot>> {
    static EXECUTORS: OnceLock<Mutex<HashMap<CacheKey, Slot>>> = OnceLock::new();
    EXECUTORS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Close the backend at `url` and evict every executor using it.
///
/// Executors obtained earlier fail with `ClosedBackend` from then on.
pub fn release(url: &str) -> Result<bool> {
    let url = strip_jdbc(url);

    // Evict and close under the cache lock so no lookup sees a closed handle
    let mut executors = cache().lock().unwrap_or_else(|e| e.into_inner());
    let before = executors.len();
    executors.retain(|(_, location, _), _| location != url);
    let evicted = before - executors.len();
    let closed = backend::release(url)?;
    drop(executors);

    if evicted > 0 {
        info!("Evicted {} executor(s) for {}", evicted, url);
    }
    Ok(closed || evicted > 0)
}

/// Query and write operations for entity type `E` on one backend
pub struct QueryExecutor<E: Entity> {
    dialect: Dialect,
    url: String,
    table: String,
    handle: Arc<Handle>,
    next_id: AtomicI64,
    counters: Arc<Counters>,
    page_size: usize,
    bulk: Mutex<Bulk<E>>,
    bulk_max: usize,
    bulk_delay: Duration,
}

impl<E: Entity> QueryExecutor<E> {
    /// The cached executor for `E` on `config`, constructing it on first use.
    ///
    /// Executors are keyed by the table they serve, so an unnamed config and
    /// one named after the model share an executor. Only callers for the same
    /// key wait on each other while a connection is opened.
    pub fn of(config: &BackendConfig) -> Result<Arc<Self>> {
        let url = config.resolved_location()?;
        let table = config
            .name
            .clone()
            .unwrap_or_else(|| E::model().name().to_string());
        let key = (TypeId::of::<E>(), url.clone(), table.clone());

        let slot = cache()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone();

        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            return existing
                .clone()
                .downcast::<Self>()
                .map_err(|_| Error::Backend(format!("executor cache mismatch for {}", url)));
        }

        let executor = Arc::new(Self::connect(config.dialect, url, table)?);
        *slot = Some(executor.clone());
        Ok(executor)
    }

    fn connect(dialect: Dialect, url: String, table: String) -> Result<Self> {
        let model = E::model();
        model.validate(dialect)?;

        if dialect.requires_database_creation() && url.contains("://") {
            backend::create_database(dialect, &url)?;
        }
        let handle = backend::acquire(dialect, &url)?;
        let settings = config::current();

        let executor = Self {
            dialect,
            url,
            table,
            handle,
            next_id: AtomicI64::new(0),
            counters: Arc::new(Counters::default()),
            page_size: settings.page_size,
            bulk: Mutex::new(Bulk { queued: Vec::new(), timer: None }),
            bulk_max: settings.bulk_max.max(1),
            bulk_delay: settings.bulk_delay(),
        };
        executor.create_schema()?;
        executor.seed_identity()?;
        info!(
            "{} executor ready on {} ({}, table {})",
            model.name(),
            executor.url,
            dialect,
            executor.table
        );
        Ok(executor)
    }

    fn create_schema(&self) -> Result<()> {
        if self.dialect.is_document() {
            return Ok(());
        }
        let mut columns = Vec::new();
        for property in E::model().properties() {
            let native = self
                .dialect
                .native_type(property.kind())
                .ok_or_else(|| Error::unsupported(self.dialect, format!("{} properties", property.kind())))?;
            columns.push((self.dialect.column(property.name()), native));
        }
        self.handle
            .execute(&self.dialect.command_create_table(&self.table, &columns))?;
        Ok(())
    }

    fn seed_identity(&self) -> Result<()> {
        let max = if self.dialect.is_document() {
            let top = self.handle.with_documents(|docs| {
                docs.find(&self.table, &json!({}), &[("_id".to_string(), false)], 0, Some(1))
            })?;
            top.first().and_then(|doc| doc.get("_id")).and_then(|id| id.as_i64())
        } else {
            let sql = format!(
                "SELECT MAX({}) FROM {}",
                self.id_column(),
                self.dialect.table(&self.table)
            );
            first_cell(&self.handle.query(&sql)?).and_then(|v| v.as_i64())
        };
        self.next_id.store(max.unwrap_or(0), Ordering::SeqCst);
        Ok(())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Table or collection name
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            queries: self.counters.queries.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.handle.is_closed() {
            Err(Error::ClosedBackend(self.url.clone()))
        } else {
            Ok(())
        }
    }

    fn id_column(&self) -> String {
        self.dialect.column(ID_COLUMN)
    }

    fn table_ref(&self) -> String {
        self.dialect.table(&self.table)
    }

    fn select_list(&self) -> String {
        let mut columns = vec![self.id_column()];
        columns.extend(E::model().properties().iter().map(|p| self.dialect.column(p.name())));
        columns.join(", ")
    }

    fn identity_for(&self, entity: &E) -> i64 {
        match entity.id() {
            0 => self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            id => {
                self.next_id.fetch_max(id, Ordering::SeqCst);
                id
            }
        }
    }

    /// Give an unpersisted entity its identity now, without writing it
    pub fn assign_id(&self, entity: &mut E) -> i64 {
        let id = self.identity_for(entity);
        entity.set_id(id);
        id
    }

    fn resolve(&self, properties: &[&dyn PropertyRef<E>]) -> Result<Vec<&'static Property<E>>> {
        let model = E::model();
        properties
            .iter()
            .map(|p| model.require(p.property_name()))
            .collect()
    }

    // ========== Reads ==========

    /// Lazily run a query; nothing executes until the cursor is iterated
    pub fn find_by(&self, query: Query<E>) -> Result<Cursor<E>> {
        self.ensure_open()?;
        let source = if self.dialect.is_document() {
            Source::Documents {
                collection: self.table.clone(),
                filter: query.compile_document(self.dialect)?,
                sort: query.document_sort()?,
            }
        } else {
            Source::Sql {
                select: format!(
                    "SELECT {} FROM {}{}{}",
                    self.select_list(),
                    self.table_ref(),
                    query.compile_where(self.dialect)?,
                    query.compile_order(self.dialect)?
                ),
            }
        };
        Ok(Cursor::new(
            self.handle.clone(),
            self.dialect,
            source,
            query.limit_value(),
            query.offset_value(),
            self.page_size,
            self.counters.clone(),
        ))
    }

    pub fn find_all(&self) -> Result<Cursor<E>> {
        self.find_by(Query::new())
    }

    pub fn find_by_expression(&self, expression: Expression) -> Result<Cursor<E>> {
        self.find_by(Query::new().matching(expression))
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<E>> {
        let query = Query::new()
            .matching(Expression::compare(ID_COLUMN, Op::Eq, id))
            .limit(1);
        self.find_by(query)?.next().transpose()
    }

    pub fn count(&self) -> Result<u64> {
        self.count_by(&Query::new())
    }

    pub fn count_by(&self, query: &Query<E>) -> Result<u64> {
        self.ensure_open()?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        if self.dialect.is_document() {
            let filter = query.compile_document(self.dialect)?;
            let n = self.handle.with_documents(|docs| docs.count(&self.table, &filter))?;
            return Ok(n as u64);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            self.table_ref(),
            query.compile_where(self.dialect)?
        );
        let n = first_cell(&self.handle.query(&sql)?)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(n.max(0) as u64)
    }

    /// Average of a numeric property over all rows
    pub fn average<T: Numeric>(&self, specifier: &Specifier<E, T>, option: &AvgOption) -> Result<Vec<f64>> {
        self.average_by(&Query::new(), specifier, option)
    }

    /// Average over the rows a query selects.
    ///
    /// A plain average yields one value (none for an empty selection). With a
    /// range, yields one windowed average per row in row order.
    pub fn average_by<T: Numeric>(
        &self,
        query: &Query<E>,
        specifier: &Specifier<E, T>,
        option: &AvgOption,
    ) -> Result<Vec<f64>> {
        self.ensure_open()?;
        specifier.resolve()?;
        let frame = option.frame()?;
        if frame.is_some() && option.distinct {
            return Err(Error::unsupported(self.dialect, "DISTINCT in a windowed average"));
        }
        if frame.is_some() && !self.dialect.supports_window() {
            return Err(Error::unsupported(self.dialect, "windowed average"));
        }

        if self.dialect.is_document() {
            let mut values = self
                .document_values(query, specifier.name())?
                .into_iter()
                .filter_map(|v| v.as_f64())
                .collect::<Vec<_>>();
            if option.distinct {
                let mut unique: Vec<f64> = Vec::new();
                for v in values {
                    if !unique.contains(&v) {
                        unique.push(v);
                    }
                }
                values = unique;
            }
            if values.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![values.iter().sum::<f64>() / values.len() as f64]);
        }

        let column = specifier.column(self.dialect);
        let filter = query.compile_where(self.dialect)?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let Some(frame) = frame else {
            let distinct = if option.distinct { "DISTINCT " } else { "" };
            let sql = format!("SELECT AVG({}{}) FROM {}{}", distinct, column, self.table_ref(), filter);
            return Ok(first_cell(&self.handle.query(&sql)?)
                .and_then(|v| v.as_f64())
                .into_iter()
                .collect());
        };

        let order = match &option.order_by {
            Some(property) => {
                E::model().require(property)?;
                format!("{}, {}", self.dialect.column(property), self.id_column())
            }
            None => self.id_column(),
        };
        let sql = format!(
            "SELECT AVG({}) OVER (ORDER BY {} {}) FROM {}{} ORDER BY {}",
            column,
            order,
            frame,
            self.table_ref(),
            filter,
            order
        );
        Ok(self
            .handle
            .query(&sql)?
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_f64))
            .collect())
    }

    pub fn min<T: Field>(&self, specifier: &Specifier<E, T>) -> Result<Option<T>> {
        self.extreme(specifier, "MIN", std::cmp::Ordering::Less)
    }

    pub fn max<T: Field>(&self, specifier: &Specifier<E, T>) -> Result<Option<T>> {
        self.extreme(specifier, "MAX", std::cmp::Ordering::Greater)
    }

    fn extreme<T: Field>(
        &self,
        specifier: &Specifier<E, T>,
        function: &str,
        wanted: std::cmp::Ordering,
    ) -> Result<Option<T>> {
        self.ensure_open()?;
        specifier.resolve()?;
        let value = if self.dialect.is_document() {
            let mut best: Option<Value> = None;
            for v in self.document_values(&Query::new(), specifier.name())? {
                if v.is_null() {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(b) => v.compare(b) == Some(wanted),
                };
                if better {
                    best = Some(v);
                }
            }
            best
        } else {
            self.counters.queries.fetch_add(1, Ordering::Relaxed);
            let sql = format!(
                "SELECT {}({}) FROM {}",
                function,
                specifier.column(self.dialect),
                self.table_ref()
            );
            first_cell(&self.handle.query(&sql)?).cloned()
        };
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => T::from_value(&v).map(Some),
        }
    }

    /// Sum of a numeric property; zero for an empty table
    pub fn sum<T: Numeric>(&self, specifier: &Specifier<E, T>) -> Result<f64> {
        self.ensure_open()?;
        specifier.resolve()?;
        if self.dialect.is_document() {
            return Ok(self
                .document_values(&Query::new(), specifier.name())?
                .iter()
                .filter_map(Value::as_f64)
                .sum());
        }
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        let sql = format!(
            "SELECT SUM({}) FROM {}",
            specifier.column(self.dialect),
            self.table_ref()
        );
        Ok(first_cell(&self.handle.query(&sql)?)
            .and_then(Value::as_f64)
            .unwrap_or(0.0))
    }

    /// Distinct values of a property, ascending
    pub fn distinct<T: Field>(&self, specifier: &Specifier<E, T>) -> Result<Vec<T>> {
        self.ensure_open()?;
        specifier.resolve()?;
        let values = if self.dialect.is_document() {
            let mut unique: Vec<Value> = Vec::new();
            for v in self.document_values(&Query::new(), specifier.name())? {
                if !unique.contains(&v) {
                    unique.push(v);
                }
            }
            unique.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
            unique
        } else {
            self.counters.queries.fetch_add(1, Ordering::Relaxed);
            let column = specifier.column(self.dialect);
            let sql = format!(
                "SELECT DISTINCT {} FROM {} ORDER BY {}",
                column,
                self.table_ref(),
                column
            );
            self.handle
                .query(&sql)?
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect()
        };
        values.iter().map(T::from_value).collect()
    }

    fn document_values(&self, query: &Query<E>, property: &str) -> Result<Vec<Value>> {
        let filter = query.compile_document(self.dialect)?;
        let sort = query.document_sort()?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        let docs = self
            .handle
            .with_documents(|docs| docs.find(&self.table, &filter, &sort, 0, None))?;
        let field = document_field(property);
        Ok(docs
            .iter()
            .map(|doc| doc.get(field).map(Value::from_json).unwrap_or(Value::Null))
            .collect())
    }

    // ========== Writes ==========

    /// Insert or replace by identity; assigns an identity to unpersisted entities
    pub fn update(&self, entity: &mut E) -> Result<()> {
        self.update_all(std::slice::from_mut(entity))
    }

    pub fn update_all(&self, entities: &mut [E]) -> Result<()> {
        self.ensure_open()?;
        if entities.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = entities.iter().map(|e| self.identity_for(e)).collect();

        match self.dialect.upsert_strategy() {
            UpsertStrategy::Document => {
                self.handle.with_documents(|docs| {
                    for (entity, id) in entities.iter().zip(&ids) {
                        docs.replace(&self.table, *id, encode_document(entity))?;
                    }
                    Ok(())
                })?;
            }
            UpsertStrategy::Conditional => {
                for (entity, id) in entities.iter().zip(&ids) {
                    self.upsert_conditional(entity, *id)?;
                }
            }
            UpsertStrategy::Replace(_) | UpsertStrategy::OnConflict => {
                let mut columns = vec![self.id_column()];
                columns.extend(E::model().properties().iter().map(|p| self.dialect.column(p.name())));
                let rows = entities
                    .iter()
                    .zip(&ids)
                    .map(|(entity, id)| self.literal_row(entity, *id))
                    .collect::<Vec<_>>();
                let sql = self
                    .dialect
                    .command_upsert(&self.table, &columns, &rows)
                    .ok_or_else(|| Error::unsupported(self.dialect, "upsert"))?;
                self.handle.execute(&sql)?;
            }
        }

        for (entity, id) in entities.iter_mut().zip(ids) {
            entity.set_id(id);
        }
        self.counters
            .writes
            .fetch_add(entities.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn literal_row(&self, entity: &E, id: i64) -> Vec<String> {
        let mut row = vec![id.to_string()];
        row.extend(
            E::model()
                .read_all(entity)
                .iter()
                .map(|v| self.dialect.literal(v)),
        );
        row
    }

    /// Upsert for dialects without a single-statement form: check, then UPDATE or INSERT
    fn upsert_conditional(&self, entity: &E, id: i64) -> Result<()> {
        let exists_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = {}",
            self.table_ref(),
            self.id_column(),
            id
        );
        let exists = first_cell(&self.handle.query(&exists_sql)?)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            > 0;

        let model = E::model();
        if exists {
            if model.properties().is_empty() {
                return Ok(());
            }
            let pairs = model
                .properties()
                .iter()
                .map(|p| (p, p.read(entity)))
                .collect::<Vec<_>>();
            self.handle.execute(&self.update_statement(id, &pairs))?;
        } else {
            let mut columns = vec![self.id_column()];
            columns.extend(model.properties().iter().map(|p| self.dialect.column(p.name())));
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table_ref(),
                columns.join(", "),
                self.literal_row(entity, id).join(", ")
            );
            self.handle.execute(&sql)?;
        }
        Ok(())
    }

    fn update_statement(&self, id: i64, pairs: &[(&Property<E>, Value)]) -> String {
        let assignments = pairs
            .iter()
            .map(|(p, v)| format!("{}={}", self.dialect.column(p.name()), self.dialect.literal(v)))
            .collect::<Vec<_>>();
        format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.table_ref(),
            assignments.join(", "),
            self.id_column(),
            id
        )
    }

    /// Write new values for some properties of a stored row; false if no row matched
    fn write_properties(&self, id: i64, pairs: &[(&Property<E>, Value)]) -> Result<bool> {
        self.ensure_open()?;
        if pairs.is_empty() {
            return Ok(true);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        if self.dialect.is_document() {
            let fields = pairs
                .iter()
                .map(|(p, v)| (p.name().to_string(), v.to_json()))
                .collect::<Document>();
            return self
                .handle
                .with_documents(|docs| docs.update_fields(&self.table, id, fields));
        }
        Ok(self.handle.execute(&self.update_statement(id, pairs))? > 0)
    }

    /// Persist only the named properties of a stored entity
    pub fn update_properties(&self, entity: &E, properties: &[&dyn PropertyRef<E>]) -> Result<bool> {
        let id = require_identity(entity)?;
        let pairs = self
            .resolve(properties)?
            .into_iter()
            .map(|p| (p, p.read(entity)))
            .collect::<Vec<_>>();
        self.write_properties(id, &pairs)
    }

    // ========== Deletes ==========

    /// Remove the entity's row; false if there was none
    pub fn delete(&self, entity: &E) -> Result<bool> {
        match entity.id() {
            0 => {
                self.ensure_open()?;
                Ok(false)
            }
            id => self.delete_by_id(id),
        }
    }

    pub fn delete_by_id(&self, id: i64) -> Result<bool> {
        self.ensure_open()?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if self.dialect.is_document() {
            let n = self
                .handle
                .with_documents(|docs| docs.delete(&self.table, &json!({ "_id": id })))?;
            return Ok(n > 0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.table_ref(),
            self.id_column(),
            id
        );
        Ok(self.handle.execute(&sql)? > 0)
    }

    /// Reset the named properties to their zero value, on the entity and in storage
    pub fn delete_properties(&self, entity: &mut E, properties: &[&dyn PropertyRef<E>]) -> Result<bool> {
        let id = require_identity(entity)?;
        let resolved = self.resolve(properties)?;
        for property in &resolved {
            property.reset(entity)?;
        }
        let pairs = resolved
            .into_iter()
            .map(|p| (p, p.zero().clone()))
            .collect::<Vec<_>>();
        self.write_properties(id, &pairs)
    }

    pub fn delete_properties_by_id(&self, id: i64, properties: &[&dyn PropertyRef<E>]) -> Result<bool> {
        let pairs = self
            .resolve(properties)?
            .into_iter()
            .map(|p| (p, p.zero().clone()))
            .collect::<Vec<_>>();
        self.write_properties(id, &pairs)
    }

    // ========== Restores ==========

    /// Reload the entity from storage in place; false (entity untouched) if absent
    pub fn restore(&self, entity: &mut E) -> Result<bool> {
        if entity.id() == 0 {
            self.ensure_open()?;
            return Ok(false);
        }
        match self.find_by_id(entity.id())? {
            Some(found) => {
                *entity = found;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reload only the named properties
    pub fn restore_properties(&self, entity: &mut E, properties: &[&dyn PropertyRef<E>]) -> Result<bool> {
        self.ensure_open()?;
        let id = require_identity(entity)?;
        let resolved = self.resolve(properties)?;
        if resolved.is_empty() {
            return Ok(true);
        }
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let values: Option<Vec<Value>> = if self.dialect.is_document() {
            let docs = self.handle.with_documents(|docs| {
                docs.find(&self.table, &json!({ "_id": id }), &[], 0, Some(1))
            })?;
            docs.first().map(|doc| {
                resolved
                    .iter()
                    .map(|p| doc.get(p.name()).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
        } else {
            let columns = resolved
                .iter()
                .map(|p| self.dialect.column(p.name()))
                .collect::<Vec<_>>();
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = {}",
                columns.join(", "),
                self.table_ref(),
                self.id_column(),
                id
            );
            self.handle.query(&sql)?.into_iter().next()
        };

        let Some(values) = values else {
            return Ok(false);
        };
        for (property, value) in resolved.iter().zip(&values) {
            property.write(entity, value)?;
        }
        Ok(true)
    }

    // ========== Lazy bulk updates ==========

    /// Queue an upsert; the queue is written when it reaches the configured
    /// size, when the bulk delay elapses, or on [`flush`](Self::flush)
    pub fn update_lazily(self: &Arc<Self>, entity: &mut E) -> Result<()> {
        self.ensure_open()?;
        self.assign_id(entity);

        let mut bulk = self.bulk.lock().unwrap_or_else(|e| e.into_inner());
        bulk.queued.push(entity.clone());

        if bulk.queued.len() >= self.bulk_max {
            if let Some(timer) = bulk.timer.take() {
                timer.cancel();
            }
            let mut batch = std::mem::take(&mut bulk.queued);
            drop(bulk);
            debug!("Bulk queue full; writing {} {}", batch.len(), self.table);
            return self.update_all(&mut batch);
        }

        if bulk.timer.is_none() {
            let executor = Arc::downgrade(self);
            bulk.timer = Some(scheduler::global().schedule(self.bulk_delay, move || {
                if let Some(executor) = executor.upgrade() {
                    if let Err(e) = executor.flush() {
                        warn!("Lazy bulk write to {} failed: {}", executor.table, e);
                    }
                }
            }));
        }
        Ok(())
    }

    /// Write everything queued by `update_lazily`; returns how many were written
    pub fn flush(&self) -> Result<usize> {
        let mut batch = {
            let mut bulk = self.bulk.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = bulk.timer.take() {
                timer.cancel();
            }
            std::mem::take(&mut bulk.queued)
        };
        if batch.is_empty() {
            return Ok(0);
        }
        self.update_all(&mut batch)?;
        Ok(batch.len())
    }

    pub fn pending_bulk(&self) -> usize {
        self.bulk.lock().unwrap_or_else(|e| e.into_inner()).queued.len()
    }
}

fn require_identity<E: Entity>(entity: &E) -> Result<i64> {
    match entity.id() {
        0 => Err(Error::MissingIdentity),
        id => Ok(id),
    }
}

fn first_cell(rows: &[Row]) -> Option<&Value> {
    rows.first().and_then(|row| row.first())
}

pub(crate) fn decode_row<E: Entity>(row: &[Value]) -> Result<E> {
    let model = E::model();
    let (id, values) = row.split_first().ok_or_else(|| Error::Decode {
        expected: ScalarKind::Long,
        found: "empty row".to_string(),
    })?;
    let mut entity = E::default();
    entity.set_id(i64::from_value(id)?);
    for (property, value) in model.properties().iter().zip(values) {
        property.write(&mut entity, value)?;
    }
    Ok(entity)
}

pub(crate) fn decode_document<E: Entity>(doc: &Document) -> Result<E> {
    let model = E::model();
    let id = doc.get("_id").map(Value::from_json).unwrap_or(Value::Null);
    let mut entity = E::default();
    entity.set_id(i64::from_value(&id)?);
    for property in model.properties() {
        let value = doc.get(property.name()).map(Value::from_json).unwrap_or(Value::Null);
        property.write(&mut entity, &value)?;
    }
    Ok(entity)
}

fn encode_document<E: Entity>(entity: &E) -> Document {
    E::model()
        .properties()
        .iter()
        .map(|p| (p.name().to_string(), p.read(entity).to_json()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::recording;
    use crate::model::tests::Person;

    const NAME: Specifier<Person, String> = Specifier::new("name");
    const AGE: Specifier<Person, i32> = Specifier::new("age");
    const TAGS: Specifier<Person, Vec<String>> = Specifier::new("tags");

    fn sqlite(name: &str) -> Arc<QueryExecutor<Person>> {
        QueryExecutor::of(&BackendConfig::new(Dialect::Sqlite).at(format!("sqlite:mem:{}", name))).unwrap()
    }

    fn mongo(name: &str) -> Arc<QueryExecutor<Person>> {
        QueryExecutor::of(&BackendConfig::new(Dialect::Mongo).at(format!("mongodb:mem:{}", name))).unwrap()
    }

    fn seed(executor: &QueryExecutor<Person>, ages: &[i32]) -> Vec<Person> {
        let mut people = ages
            .iter()
            .enumerate()
            .map(|(i, age)| Person::new(&format!("p{}", i), *age))
            .collect::<Vec<_>>();
        executor.update_all(&mut people).unwrap();
        people
    }

    fn ages(cursor: Cursor<Person>) -> Vec<i32> {
        cursor.map(|p| p.unwrap().age).collect()
    }

    #[test]
    fn test_find_by_numeric_constraint() {
        for executor in [sqlite("exec_numeric"), mongo("exec_numeric")] {
            seed(&executor, &[10, 20, 30]);
            let query = Query::new().filter(AGE.constraint().is_less_than(25));
            assert_eq!(ages(executor.find_by(query).unwrap()), vec![10, 20]);

            let query = Query::new().filter(AGE.constraint().is_greater_than_or_equal(20)).descending(&AGE);
            assert_eq!(ages(executor.find_by(query).unwrap()), vec![30, 20]);
            assert_eq!(executor.count().unwrap(), 3);
        }
    }

    #[test]
    fn test_contains_matches_literally() {
        for executor in [sqlite("exec_contains"), mongo("exec_contains")] {
            let mut people = ["a_c", "abc", "50%", "500"]
                .iter()
                .map(|name| Person::new(name, 1))
                .collect::<Vec<_>>();
            executor.update_all(&mut people).unwrap();

            let names = |needle: &str| {
                executor
                    .find_by(Query::new().filter(NAME.constraint().contains(needle)))
                    .unwrap()
                    .map(|p| p.unwrap().name)
                    .collect::<Vec<_>>()
            };
            assert_eq!(names("_"), vec!["a_c"]);
            assert_eq!(names("%"), vec!["50%"]);
            assert_eq!(names("b"), vec!["abc"]);
        }
    }

    #[test]
    fn test_list_constraints() {
        for executor in [sqlite("exec_lists"), mongo("exec_lists")] {
            let mut a = Person::new("a", 1);
            a.tags = vec!["x".to_string()];
            let mut b = Person::new("b", 2);
            b.tags = vec!["x".to_string(), "y".to_string(), "z".to_string()];
            let mut c = Person::new("c", 3);
            executor.update_all(std::slice::from_mut(&mut a)).unwrap();
            executor.update(&mut b).unwrap();
            executor.update(&mut c).unwrap();

            let sized = Query::new().filter(TAGS.constraint().size(1));
            assert_eq!(ages(executor.find_by(sized).unwrap()), vec![1]);

            let more = Query::new().filter(TAGS.constraint().is_more_than(1));
            assert_eq!(ages(executor.find_by(more).unwrap()), vec![2]);

            let fewer = Query::new().filter(TAGS.constraint().is_less_than(3));
            assert_eq!(ages(executor.find_by(fewer).unwrap()), vec![1, 3]);

            let has_y = Query::new().filter(TAGS.constraint().contains("y"));
            assert_eq!(ages(executor.find_by(has_y).unwrap()), vec![2]);

            let found = executor.find_by_id(b.id).unwrap().unwrap();
            assert_eq!(found.tags, b.tags);
        }
    }

    #[test]
    fn test_update_is_idempotent_upsert() {
        for executor in [sqlite("exec_upsert"), mongo("exec_upsert")] {
            let mut person = Person::new("ada", 36);
            executor.update(&mut person).unwrap();
            assert!(person.id > 0);
            let id = person.id;

            executor.update(&mut person).unwrap();
            person.age = 37;
            executor.update(&mut person).unwrap();

            assert_eq!(person.id, id);
            assert_eq!(executor.count().unwrap(), 1);
            assert_eq!(executor.find_by_id(id).unwrap().unwrap(), person);
        }
    }

    #[test]
    fn test_identities_continue_after_existing_rows() {
        let file = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}", file.path().join("people.db").display());
        let executor = QueryExecutor::<Person>::of(&BackendConfig::from_url(&url).unwrap()).unwrap();
        let people = seed(&executor, &[1, 2]);
        release(&url).unwrap();

        let reopened = QueryExecutor::<Person>::of(&BackendConfig::from_url(&url).unwrap()).unwrap();
        let mut next = Person::new("next", 3);
        reopened.update(&mut next).unwrap();
        assert_eq!(next.id, people[1].id + 1);
        assert_eq!(reopened.count().unwrap(), 3);
        release(&url).unwrap();
    }

    #[test]
    fn test_delete_and_find_by_id() {
        for executor in [sqlite("exec_delete"), mongo("exec_delete")] {
            let people = seed(&executor, &[10, 20]);
            assert!(executor.delete(&people[0]).unwrap());
            assert!(!executor.delete(&people[0]).unwrap());
            assert!(executor.find_by_id(people[0].id).unwrap().is_none());
            assert!(!executor.delete(&Person::new("never", 1)).unwrap());
            assert_eq!(executor.count().unwrap(), 1);
        }
    }

    #[test]
    fn test_partial_delete_resets_to_zero() {
        for executor in [sqlite("exec_partial"), mongo("exec_partial")] {
            let mut people = seed(&executor, &[42]);
            let person = &mut people[0];
            assert!(executor.delete_properties(person, &[&AGE]).unwrap());
            assert_eq!(person.age, 0);

            let stored = executor.find_by_id(person.id).unwrap().unwrap();
            assert_eq!(stored.age, 0);
            assert_eq!(stored.name, "p0");

            assert!(executor.delete_properties_by_id(person.id, &[&"name"]).unwrap());
            assert_eq!(executor.find_by_id(person.id).unwrap().unwrap().name, "");

            let mut transient = Person::new("t", 1);
            assert!(matches!(
                executor.delete_properties(&mut transient, &[&AGE]),
                Err(Error::MissingIdentity)
            ));
            assert!(matches!(
                executor.delete_properties_by_id(person.id, &[&"height"]),
                Err(Error::UnknownProperty { .. })
            ));
        }
    }

    #[test]
    fn test_restore_falls_back_when_absent() {
        for executor in [sqlite("exec_restore"), mongo("exec_restore")] {
            let mut people = seed(&executor, &[10]);
            let person = &mut people[0];
            person.age = 99;
            person.name = "changed".to_string();

            assert!(executor.restore_properties(person, &[&AGE]).unwrap());
            assert_eq!(person.age, 10);
            assert_eq!(person.name, "changed");

            assert!(executor.restore(person).unwrap());
            assert_eq!(person.name, "p0");

            let mut ghost = Person { id: 9_999, ..Person::new("ghost", 5) };
            assert!(!executor.restore(&mut ghost).unwrap());
            assert_eq!(ghost.name, "ghost");
        }
    }

    #[test]
    fn test_update_properties_writes_only_named() {
        for executor in [sqlite("exec_update_props"), mongo("exec_update_props")] {
            let mut people = seed(&executor, &[10]);
            let person = &mut people[0];
            person.age = 11;
            person.name = "unsaved".to_string();

            assert!(executor.update_properties(person, &[&AGE]).unwrap());
            let stored = executor.find_by_id(person.id).unwrap().unwrap();
            assert_eq!(stored.age, 11);
            assert_eq!(stored.name, "p0");

            let ghost = Person { id: 9_999, ..Person::new("ghost", 5) };
            assert!(!executor.update_properties(&ghost, &[&AGE]).unwrap());
        }
    }

    #[test]
    fn test_average_plain_and_distinct() {
        for executor in [sqlite("exec_avg"), mongo("exec_avg")] {
            assert!(executor.average(&AGE, &AvgOption::new()).unwrap().is_empty());
            seed(&executor, &[10, 10, 40]);
            assert_eq!(executor.average(&AGE, &AvgOption::new()).unwrap(), vec![20.0]);
            assert_eq!(executor.average(&AGE, &AvgOption::new().distinct()).unwrap(), vec![25.0]);

            let query = Query::new().filter(AGE.constraint().is_less_than(20));
            assert_eq!(executor.average_by(&query, &AGE, &AvgOption::new()).unwrap(), vec![10.0]);
        }
    }

    #[test]
    fn test_windowed_average() {
        let executor = sqlite("exec_window");
        seed(&executor, &[10, 20, 30, 40, 50]);

        let trailing = executor.average(&AGE, &AvgOption::new().range(-2, 0)).unwrap();
        assert_eq!(trailing, vec![10.0, 15.0, 20.0, 30.0, 40.0]);

        let centered = executor.average(&AGE, &AvgOption::new().range(-1, 1)).unwrap();
        assert_eq!(centered, vec![15.0, 20.0, 30.0, 40.0, 45.0]);

        let err = executor
            .average(&AGE, &AvgOption::new().range(-1, 0).distinct())
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { .. }));

        let documents = mongo("exec_window");
        let err = documents.average(&AGE, &AvgOption::new().range(-1, 0)).unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { dialect: Dialect::Mongo, .. }));
    }

    #[test]
    fn test_min_max_sum_distinct() {
        for executor in [sqlite("exec_aggregates"), mongo("exec_aggregates")] {
            assert_eq!(executor.min(&AGE).unwrap(), None);
            assert_eq!(executor.sum(&AGE).unwrap(), 0.0);

            seed(&executor, &[30, 10, 30, 20]);
            assert_eq!(executor.min(&AGE).unwrap(), Some(10));
            assert_eq!(executor.max(&AGE).unwrap(), Some(30));
            assert_eq!(executor.sum(&AGE).unwrap(), 90.0);
            assert_eq!(executor.distinct(&AGE).unwrap(), vec![10, 20, 30]);
            assert_eq!(executor.max(&NAME).unwrap(), Some("p3".to_string()));
        }
    }

    #[test]
    fn test_cursor_is_lazy_and_paged() {
        for executor in [sqlite("exec_paging"), mongo("exec_paging")] {
            seed(&executor, &[1, 2, 3, 4, 5]);
            let before = executor.stats().queries;

            let cursor = executor.find_all().unwrap().page_size(2);
            assert_eq!(executor.stats().queries, before);

            assert_eq!(ages(cursor), vec![1, 2, 3, 4, 5]);
            assert_eq!(executor.stats().queries, before + 3);

            let mut first = executor.find_all().unwrap();
            assert_eq!(first.next().unwrap().unwrap().age, 1);
            assert_eq!(executor.stats().queries, before + 4);
        }
    }

    #[test]
    fn test_limit_and_offset() {
        for executor in [sqlite("exec_limit"), mongo("exec_limit")] {
            seed(&executor, &[1, 2, 3, 4, 5]);
            assert_eq!(ages(executor.find_by(Query::new().offset(1).limit(2)).unwrap()), vec![2, 3]);
            assert_eq!(ages(executor.find_by(Query::new().offset(3)).unwrap()), vec![4, 5]);
            assert_eq!(ages(executor.find_by(Query::new().limit(0)).unwrap()), vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_find_by_expression() {
        for executor in [sqlite("exec_expression"), mongo("exec_expression")] {
            seed(&executor, &[5, 15, 25]);
            let expression = Expression::compare("age", Op::Lt, 10).or(Expression::compare("age", Op::Gt, 20));
            assert_eq!(ages(executor.find_by_expression(expression).unwrap()), vec![5, 25]);
        }
    }

    #[test]
    fn test_released_backend_is_closed() {
        let executor = sqlite("exec_released");
        let mut people = seed(&executor, &[1]);

        assert!(release("sqlite:mem:exec_released").unwrap());
        assert!(matches!(executor.count(), Err(Error::ClosedBackend(_))));
        assert!(matches!(executor.update(&mut people[0]), Err(Error::ClosedBackend(_))));
        assert!(matches!(executor.find_all().err(), Some(Error::ClosedBackend(_))));

        let fresh = sqlite("exec_released");
        assert!(!Arc::ptr_eq(&executor, &fresh));
        assert_eq!(fresh.count().unwrap(), 0);
    }

    #[test]
    fn test_executor_cache_identity() {
        let a = sqlite("exec_cache");
        let b = QueryExecutor::<Person>::of(&BackendConfig::from_url("jdbc:sqlite:mem:exec_cache").unwrap()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let named = QueryExecutor::<Person>::of(
            &BackendConfig::new(Dialect::Sqlite).at("sqlite:mem:exec_cache").named("People"),
        )
        .unwrap();
        assert!(!Arc::ptr_eq(&a, &named));
        assert_eq!(named.table(), "People");
        assert_eq!(a.table(), "Person");

        seed(&named, &[1, 2]);
        assert_eq!(named.count().unwrap(), 2);
        assert_eq!(a.count().unwrap(), 0);
    }

    #[test]
    fn test_model_named_config_shares_executor() {
        let plain = sqlite("exec_same_table");
        let named = QueryExecutor::<Person>::of(
            &BackendConfig::new(Dialect::Sqlite).at("sqlite:mem:exec_same_table").named("Person"),
        )
        .unwrap();
        assert!(Arc::ptr_eq(&plain, &named));

        let mut alice = Person::new("alice", 30);
        let mut bob = Person::new("bob", 40);
        plain.update(&mut alice).unwrap();
        named.update(&mut bob).unwrap();

        assert_ne!(alice.id, bob.id);
        assert_eq!(plain.count().unwrap(), 2);
        assert_eq!(plain.find_by_id(alice.id).unwrap().unwrap().name, "alice");
        assert_eq!(plain.find_by_id(bob.id).unwrap().unwrap().name, "bob");
    }

    #[test]
    fn test_construction_does_not_block_other_keys() {
        let key = (TypeId::of::<Person>(), "sqlite:mem:exec_busy".to_string(), "Person".to_string());
        let slot = cache().lock().unwrap().entry(key).or_default().clone();
        let _constructing = slot.lock().unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(sqlite("exec_unrelated").count().unwrap());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    }

    #[test]
    fn test_release_then_reopen_gives_open_executor() {
        let executor = sqlite("exec_reopen");
        seed(&executor, &[1, 2]);

        assert!(release("sqlite:mem:exec_reopen").unwrap());
        assert!(!release("sqlite:mem:exec_reopen").unwrap());
        assert!(matches!(executor.count(), Err(Error::ClosedBackend(_))));

        let fresh = sqlite("exec_reopen");
        assert!(!Arc::ptr_eq(&executor, &fresh));
        seed(&fresh, &[3]);
        assert_eq!(fresh.count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_first_use_builds_one_executor() {
        let handles = (0..8)
            .map(|_| std::thread::spawn(|| sqlite("exec_concurrent")))
            .collect::<Vec<_>>();
        let executors = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        assert!(executors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_list_property_unsupported_on_h2() {
        let err = QueryExecutor::<Person>::of(&BackendConfig::new(Dialect::H2).at("h2:mem:exec_h2"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::CapabilityUnsupported { dialect: Dialect::H2, .. }));
    }

    #[test]
    fn test_postgres_statements() {
        let log = recording(Dialect::Postgres, "postgresql://exec-pg");
        let executor =
            QueryExecutor::<Person>::of(&BackendConfig::from_url("postgresql://exec-pg:5432/app").unwrap()).unwrap();
        let mut person = Person::new("ada", 36);
        executor.update(&mut person).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log[0],
            "CREATE TABLE IF NOT EXISTS \"Person\" (\"id\" bigint PRIMARY KEY, \"name\" varchar, \"age\" int, \"tags\" varchar)"
        );
        assert_eq!(log[1], "SELECT MAX(\"id\") FROM \"Person\"");
        assert_eq!(
            log[2],
            "INSERT INTO \"Person\" (\"id\", \"name\", \"age\", \"tags\") VALUES (1, 'ada', 36, '[]') \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\"=EXCLUDED.\"name\", \"age\"=EXCLUDED.\"age\", \"tags\"=EXCLUDED.\"tags\""
        );
    }

    #[test]
    fn test_mariadb_creates_database_and_upserts_conditionally() {
        let log = recording(Dialect::MariaDb, "mariadb://exec-maria");
        let executor =
            QueryExecutor::<Person>::of(&BackendConfig::from_url("mariadb://exec-maria:3306/shop").unwrap()).unwrap();
        let mut person = Person::new("ada", 36);
        executor.update(&mut person).unwrap();

        let log = log.lock().unwrap();
        assert!(log[0].starts_with("CREATE DATABASE IF NOT EXISTS `shop`"));
        assert!(log[1].starts_with("CREATE TABLE IF NOT EXISTS `Person`"));
        assert_eq!(log[3], "SELECT COUNT(*) FROM `Person` WHERE `id` = 1");
        assert!(log[4].starts_with("INSERT INTO `Person` (`id`, `name`, `age`, `tags`) VALUES (1, 'ada', 36"));
    }

    #[test]
    fn test_lazy_bulk_updates() {
        let executor = sqlite("exec_bulk");
        let mut people = (0..3).map(|i| Person::new("bulk", i)).collect::<Vec<_>>();
        for person in &mut people {
            executor.update_lazily(person).unwrap();
            assert!(person.id > 0);
        }
        assert_eq!(executor.pending_bulk(), 3);
        assert_eq!(executor.count().unwrap(), 0);

        assert_eq!(executor.flush().unwrap(), 3);
        assert_eq!(executor.pending_bulk(), 0);
        assert_eq!(executor.count().unwrap(), 3);
        assert_eq!(executor.flush().unwrap(), 0);
    }

    #[test]
    fn test_stats_display() {
        let stats = ExecutorStats { queries: 3, writes: 2, deletes: 1 };
        let text = stats.to_string();
        assert!(text.starts_with("Executor Statistics:"));
        assert!(text.contains("  Writes: 2"));
    }
}
