//! Lazy, forward-only result sequences

use super::{decode_document, decode_row, Counters};
use crate::backend::{Document, Handle, Row};
use crate::dialect::Dialect;
use crate::model::Entity;
use crate::Result;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

pub(crate) enum Source {
    Sql { select: String },
    Documents { collection: String, filter: serde_json::Value, sort: Vec<(String, bool)> },
}

enum Raw {
    Row(Row),
    Document(Document),
}

/// Results of `find_by`, fetched a page at a time as the caller iterates.
///
/// Creating a cursor runs nothing; the first `next()` issues the first page
/// query and each row is decoded only when it is yielded. A cursor cannot be
/// restarted, and after an error it yields nothing more.
pub struct Cursor<E> {
    handle: Arc<Handle>,
    dialect: Dialect,
    source: Source,
    limit: Option<usize>,
    offset: usize,
    page_size: usize,
    fetched: usize,
    buffer: VecDeque<Raw>,
    exhausted: bool,
    counters: Arc<Counters>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> Cursor<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: Arc<Handle>,
        dialect: Dialect,
        source: Source,
        limit: Option<usize>,
        offset: usize,
        page_size: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            handle,
            dialect,
            source,
            limit,
            offset,
            page_size: page_size.max(1),
            fetched: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            counters,
            _marker: PhantomData,
        }
    }

    /// Rows fetched per round trip
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fetch_page(&mut self) -> Result<()> {
        let remaining = self.limit.map(|limit| limit.saturating_sub(self.fetched));
        if remaining == Some(0) {
            self.exhausted = true;
            return Ok(());
        }
        let want = remaining.map_or(self.page_size, |r| r.min(self.page_size));
        let offset = self.offset + self.fetched;

        let page: Vec<Raw> = match &self.source {
            Source::Sql { select } => {
                let sql = format!(
                    "{}{}",
                    select,
                    self.dialect.command_limit_and_offset(Some(want), Some(offset))
                );
                self.handle.query(&sql)?.into_iter().map(Raw::Row).collect()
            }
            Source::Documents { collection, filter, sort } => {
                debug!(collection = %collection, filter = %filter, offset, want, "find");
                self.handle
                    .with_documents(|docs| docs.find(collection, filter, sort, offset, Some(want)))?
                    .into_iter()
                    .map(Raw::Document)
                    .collect()
            }
        };
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        if page.len() < want {
            self.exhausted = true;
        }
        self.fetched += page.len();
        self.buffer.extend(page);
        Ok(())
    }
}

impl<E: Entity> Iterator for Cursor<E> {
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        let raw = self.buffer.pop_front()?;
        Some(match raw {
            Raw::Row(row) => decode_row(&row),
            Raw::Document(doc) => decode_document(&doc),
        })
    }
}
