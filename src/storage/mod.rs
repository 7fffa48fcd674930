//! Root storage handle, transactions and bookmarks.

pub mod ops;
pub mod transaction;

pub use ops::{
    Deleted, Entries, Fetched, GetAlarmOptions, GetOptions, Keys, ListOptions, OpName, PutOptions,
    ResolvedOptions, SetAlarmOptions, StorageOperations, configure_options,
};
pub use transaction::{SyncTransaction, Transaction};

use crate::alarm::AlarmManager;
use crate::bookmark::{Bookmark, RetentionWindow, now_millis};
use crate::cache::ActorCache;
use crate::config::ActorConfig;
use crate::error::ActorError;
use crate::gate::{GatePair, SectionId};
use crate::observer::ActorObserver;
use ops::{CacheScope, OpsCapability};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use tracing::{debug, info};

/// Per-actor state every storage handle shares.
pub(crate) struct StorageContext {
    pub(crate) cache: Arc<dyn ActorCache>,
    pub(crate) gates: GatePair,
    pub(crate) alarms: Arc<AlarmManager>,
    pub(crate) observer: Arc<dyn ActorObserver>,
    pub(crate) config: ActorConfig,
    pub(crate) sync_depth: AtomicU32,
    aborted: Mutex<Option<ActorError>>,
}

impl StorageContext {
    pub(crate) fn new(
        cache: Arc<dyn ActorCache>,
        gates: GatePair,
        alarms: Arc<AlarmManager>,
        observer: Arc<dyn ActorObserver>,
        config: ActorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            gates,
            alarms,
            observer,
            config,
            sync_depth: AtomicU32::new(0),
            aborted: Mutex::new(None),
        })
    }

    pub(crate) fn check_alive(&self) -> Result<(), ActorError> {
        match &*self.aborted.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn aborted(&self) -> Option<ActorError> {
        self.aborted.lock().clone()
    }

    /// Records the abort. Returns false if the actor was already aborted.
    pub(crate) fn mark_aborted(&self, err: ActorError) -> bool {
        let mut aborted = self.aborted.lock();
        if aborted.is_some() {
            return false;
        }
        *aborted = Some(err);
        true
    }
}

/// An actor's root storage handle.
///
/// Dereferences to [`StorageOperations`] for the key/value and alarm surface.
#[derive(Clone)]
pub struct Storage {
    ops: StorageOperations,
}

impl Storage {
    pub(crate) fn new(ctx: Arc<StorageContext>) -> Self {
        let direct_io = ctx.config.direct_io;
        Self {
            ops: StorageOperations {
                capability: OpsCapability {
                    scope: CacheScope::Root(Arc::clone(&ctx.cache)),
                    direct_io,
                },
                section: None,
                ctx,
            },
        }
    }

    /// The same storage, bound to an exclusive section of the input gate.
    pub(crate) fn for_section(&self, section: SectionId) -> Self {
        let mut ops = self.ops.clone();
        ops.section = Some(section);
        Self { ops }
    }

    /// The exclusive section this handle is bound to, if any.
    pub(crate) fn section(&self) -> Option<SectionId> {
        self.ops.section
    }

    /// The same storage with every call forced to skip the cache and ignore the input gate.
    pub fn with_direct_io(&self) -> Self {
        let mut ops = self.ops.clone();
        ops.capability.direct_io = true;
        Self { ops }
    }

    /// Runs `callback` in a transaction that commits when it returns `Ok` and
    /// rolls back when it returns `Err` or calls [`Transaction::rollback`].
    pub async fn transaction<T, F, Fut>(&self, callback: F) -> Result<T, ActorError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let txn = Transaction::open(&self.ops)?;
        match callback(txn.clone()).await {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.rollback()?;
                debug!(error = %err, "transaction callback failed");
                Err(err)
            }
        }
    }

    /// Runs `callback` to completion without yielding and commits before returning.
    ///
    /// Must be called from within a tokio runtime: the commit's confirmation is
    /// awaited on a spawned task that holds the output gate.
    pub fn transaction_sync<T>(
        &self,
        callback: impl FnOnce(&SyncTransaction<'_>) -> Result<T, ActorError>,
    ) -> Result<T, ActorError> {
        SyncTransaction::run(&self.ops, callback)
    }

    /// Flushes queued writes and waits until every write issued so far is confirmed.
    pub async fn sync(&self) -> Result<(), ActorError> {
        self.ops.ctx.check_alive()?;
        self.ops.ctx.cache.flush().await?;
        self.ops.ctx.gates.output.wait().await
    }

    pub async fn get_current_bookmark(&self) -> Result<Bookmark, ActorError> {
        self.ops.ctx.check_alive()?;
        self.ops.ctx.cache.current_bookmark().await
    }

    /// Bookmark for the state as of `timestamp_ms`. Future timestamps resolve to now.
    pub async fn get_bookmark_for_time(&self, timestamp_ms: i64) -> Result<Bookmark, ActorError> {
        self.ops.ctx.check_alive()?;
        let window = RetentionWindow::new(self.ops.ctx.config.bookmark_retention_ms);
        let resolved = window.resolve(timestamp_ms, now_millis())?;
        self.ops.ctx.cache.bookmark_for_time(resolved).await
    }

    /// Restores storage to `bookmark` when the actor next starts. Returns a
    /// bookmark that undoes the restore.
    pub async fn on_next_session_restore_bookmark(
        &self,
        bookmark: &Bookmark,
    ) -> Result<Bookmark, ActorError> {
        self.ops.ctx.check_alive()?;
        let undo = self.ops.ctx.cache.restore_on_next_session(bookmark).await?;
        info!(target = %bookmark, undo = %undo, "restore scheduled for next session");
        Ok(undo)
    }

    pub fn transaction_sync_depth(&self) -> u32 {
        self.ops
            .ctx
            .sync_depth
            .load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Deref for Storage {
    type Target = StorageOperations;

    fn deref(&self) -> &Self::Target {
        &self.ops
    }
}
