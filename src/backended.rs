//! Per-entity lifecycle coordinator
//!
//! [`Backended`] pairs one entity value with the cached executor for its
//! backend and tracks where the value stands:
//!
//! - `Transient`: no pending write and no confirmed stored state
//! - `PendingSave`: a delayed write is scheduled
//! - `Persisted`: the last write or restore succeeded
//!
//! Lifecycle calls never return backend errors. Failures are handed to the
//! instance's [`ErrorHook`], which does nothing unless one is installed.

use crate::config::{self, BackendConfig};
use crate::executor::QueryExecutor;
use crate::model::Entity;
use crate::scheduler::{self, Token};
use crate::specifier::PropertyRef;
use crate::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Transient,
    PendingSave,
    Persisted,
}

/// Lifecycle call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Delete,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Delete => "delete",
            Operation::Restore => "restore",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observer for lifecycle failures.
///
/// Called on the caller's thread for `save`, `delete` and `restore`, and on
/// the scheduler thread for delayed saves. `entity` is the state the failed
/// call tried to write or read.
pub trait ErrorHook<E>: Send + Sync {
    fn on_error(&self, _entity: &E, _operation: Operation, _error: &Error) {}
}

/// The default hook: failures go nowhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl<E> ErrorHook<E> for NoopHook {}

struct Slot {
    pending: Option<Token>,
    settled: Lifecycle,
}

#[derive(Clone)]
struct Shared {
    slot: Arc<Mutex<Slot>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot { pending: None, settled: Lifecycle::Transient })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        f(&mut self.slot.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn cancel_pending(&self) {
        self.with(|slot| {
            if let Some(token) = slot.pending.take() {
                token.cancel();
            }
        });
    }

    fn settle(&self, state: Lifecycle) {
        self.with(|slot| slot.settled = state);
    }
}

/// An entity bound to its backend
pub struct Backended<E: Entity> {
    entity: E,
    executor: Arc<QueryExecutor<E>>,
    shared: Shared,
    hook: Arc<dyn ErrorHook<E>>,
}

impl<E: Entity> Backended<E> {
    pub fn new(entity: E, executor: Arc<QueryExecutor<E>>) -> Self {
        Self {
            entity,
            executor,
            shared: Shared::new(),
            hook: Arc::new(NoopHook),
        }
    }

    /// Bind `entity` to the cached executor for `config`
    pub fn connect(entity: E, config: &BackendConfig) -> Result<Self> {
        Ok(Self::new(entity, QueryExecutor::of(config)?))
    }

    pub fn with_error_hook(mut self, hook: impl ErrorHook<E> + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    pub fn executor(&self) -> &Arc<QueryExecutor<E>> {
        &self.executor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.with(|slot| match slot.pending {
            Some(_) => Lifecycle::PendingSave,
            None => slot.settled,
        })
    }

    pub fn has_pending_save(&self) -> bool {
        self.lifecycle() == Lifecycle::PendingSave
    }

    pub fn into_inner(self) -> E {
        self.entity
    }

    fn report(&self, operation: Operation, error: &Error) {
        debug!("{} of {} {} failed: {}", operation, self.executor.table(), self.entity.id(), error);
        self.hook.on_error(&self.entity, operation, error);
    }

    /// Write now, cancelling any delayed save; true on success
    pub fn save(&mut self) -> bool {
        self.shared.cancel_pending();
        match self.executor.update(&mut self.entity) {
            Ok(()) => {
                self.shared.settle(Lifecycle::Persisted);
                true
            }
            Err(e) => {
                self.report(Operation::Save, &e);
                false
            }
        }
    }

    /// Write the current state after `delay`.
    ///
    /// Each call replaces the previous delayed save and restarts the delay,
    /// so a burst of calls produces one write carrying the last state. The
    /// entity gets its identity immediately. A zero delay saves now.
    pub fn save_lazily(&mut self, delay: Duration) {
        if delay.is_zero() {
            self.save();
            return;
        }
        self.executor.assign_id(&mut self.entity);

        let snapshot = self.entity.clone();
        let executor = self.executor.clone();
        let shared = self.shared.clone();
        let hook = self.hook.clone();
        let own: Arc<OnceLock<Token>> = Arc::new(OnceLock::new());
        let own_in_task = own.clone();

        // The slot stays locked until the new token is recorded, so the task
        // cannot settle before it is known as current.
        self.shared.with(|slot| {
            if let Some(previous) = slot.pending.take() {
                previous.cancel();
            }
            let token = scheduler::global().schedule(delay, move || {
                let mut snapshot = snapshot;
                let result = executor.update(&mut snapshot);
                shared.with(|slot| {
                    let current = match (slot.pending.as_ref(), own_in_task.get()) {
                        (Some(pending), Some(own)) => pending.same(own),
                        _ => false,
                    };
                    if current {
                        slot.pending = None;
                        if result.is_ok() {
                            slot.settled = Lifecycle::Persisted;
                        }
                    }
                });
                if let Err(e) = result {
                    debug!("delayed save of {} {} failed: {}", executor.table(), snapshot.id(), e);
                    hook.on_error(&snapshot, Operation::Save, &e);
                }
            });
            let _ = own.set(token.clone());
            slot.pending = Some(token);
        });
    }

    /// `save_lazily` with the configured debounce delay
    pub fn save_lazily_default(&mut self) {
        self.save_lazily(config::current().debounce());
    }

    /// Remove the stored row; true if one was removed.
    ///
    /// A pending delayed save is cancelled first so it cannot recreate the row.
    pub fn delete(&mut self) -> bool {
        self.shared.cancel_pending();
        match self.executor.delete(&self.entity) {
            Ok(removed) => {
                self.shared.settle(Lifecycle::Transient);
                removed
            }
            Err(e) => {
                self.report(Operation::Delete, &e);
                false
            }
        }
    }

    /// Reload from storage in place; left unchanged when nothing is stored
    pub fn restore(&mut self) -> &mut Self {
        match self.executor.restore(&mut self.entity) {
            Ok(true) => self.shared.settle(Lifecycle::Persisted),
            Ok(false) => {}
            Err(e) => self.report(Operation::Restore, &e),
        }
        self
    }

    /// Reload only the named properties
    pub fn restore_properties(&mut self, properties: &[&dyn PropertyRef<E>]) -> &mut Self {
        if let Err(e) = self.executor.restore_properties(&mut self.entity, properties) {
            self.report(Operation::Restore, &e);
        }
        self
    }
}

impl<E: Entity> Deref for Backended<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

impl<E: Entity> DerefMut for Backended<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.entity
    }
}
