use super::ops::{
    CacheScope, Deleted, Entries, Fetched, GetAlarmOptions, GetOptions, Keys, ListOptions,
    OpName, OpsCapability, PutOptions, ResolvedOptions, SetAlarmOptions, StorageOperations,
};
use crate::alarm::DeleteAction;
use crate::cache::{CacheTransaction, Value};
use crate::error::ActorError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Holder of an open cache transaction. Becomes empty exactly once.
pub(crate) struct TxnSlot {
    inner: Mutex<Option<Box<dyn CacheTransaction>>>,
    rolled_back: AtomicBool,
    /// Last alarm write made inside the transaction, applied to the alarm manager on commit.
    alarm: Mutex<Option<Option<i64>>>,
}

impl TxnSlot {
    pub(crate) fn new(txn: Box<dyn CacheTransaction>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(txn)),
            rolled_back: AtomicBool::new(false),
            alarm: Mutex::new(None),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub(crate) fn with<T>(
        &self,
        op: OpName,
        f: impl FnOnce(&mut dyn CacheTransaction) -> Result<T, ActorError>,
    ) -> Result<T, ActorError> {
        let mut guard = self.inner.lock();
        let txn = guard
            .as_mut()
            .ok_or(ActorError::TransactionClosed { op: op.as_str() })?;
        f(txn.as_mut())
    }

    pub(crate) fn record_alarm(&self, scheduled_ms: Option<i64>) {
        *self.alarm.lock() = Some(scheduled_ms);
    }

    pub(crate) fn pending_alarm_set(&self) -> bool {
        matches!(*self.alarm.lock(), Some(Some(_)))
    }

    fn take(&self) -> Option<Box<dyn CacheTransaction>> {
        self.inner.lock().take()
    }
}

/// Handle passed to a [`super::Storage::transaction`] callback.
///
/// Reads see the transaction's own writes. Nothing becomes visible to other
/// handles until the transaction commits.
#[derive(Clone)]
pub struct Transaction {
    ops: StorageOperations,
    slot: Arc<TxnSlot>,
}

impl Transaction {
    pub(crate) fn open(parent: &StorageOperations) -> Result<Self, ActorError> {
        parent.ctx.check_alive()?;
        let CacheScope::Root(cache) = &parent.capability.scope else {
            return Err(ActorError::UnsupportedOperation(
                "transactions cannot be nested inside a transaction".into(),
            ));
        };
        let slot = TxnSlot::new(cache.begin_transaction()?);
        Ok(Self {
            ops: StorageOperations {
                capability: OpsCapability {
                    scope: CacheScope::Transaction(Arc::clone(&slot)),
                    direct_io: parent.capability.direct_io,
                },
                section: parent.section,
                ctx: Arc::clone(&parent.ctx),
            },
            slot,
        })
    }

    /// Commits unless already committed or rolled back.
    pub fn commit(&self) -> Result<(), ActorError> {
        if self.slot.rolled_back.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(txn) = self.slot.take() else {
            return Ok(());
        };
        let confirmation = txn.commit()?;
        if let Some(scheduled_ms) = self.slot.alarm.lock().take() {
            self.ops.ctx.alarms.written(scheduled_ms);
        }
        self.ops.ctx.gates.output.lock_while(confirmation)
    }

    /// Discards every write. Later operations fail with `TransactionClosed`.
    pub fn rollback(&self) -> Result<(), ActorError> {
        let Some(txn) = self.slot.take() else {
            return Ok(());
        };
        self.slot.rolled_back.store(true, Ordering::Release);
        self.ops
            .ctx
            .observer
            .storage_operation(OpName::Rollback, &ResolvedOptions::default());
        txn.rollback();
        debug!("transaction rolled back");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.slot.rolled_back.load(Ordering::Acquire)
    }
}

impl Deref for Transaction {
    type Target = StorageOperations;

    fn deref(&self) -> &Self::Target {
        &self.ops
    }
}

/// Decrements the synchronous transaction depth when a level exits, including by panic.
struct DepthGuard<'a> {
    depth: &'a AtomicU32,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicU32, max: u32) -> Result<Self, ActorError> {
        let previous = depth.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            depth.fetch_sub(1, Ordering::AcqRel);
            return Err(ActorError::SyncTransactionDepthExceeded { depth: max });
        }
        Ok(Self { depth })
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle passed to a [`super::Storage::transaction_sync`] callback.
///
/// Every operation completes before returning. Nested levels started with
/// [`SyncTransaction::transaction_sync`] share the same cache transaction and
/// roll back to a savepoint when they fail.
pub struct SyncTransaction<'a> {
    ops: &'a StorageOperations,
    txn: Mutex<Box<dyn CacheTransaction>>,
    alarm: Mutex<Option<Option<i64>>>,
}

impl<'a> SyncTransaction<'a> {
    pub(crate) fn run<T>(
        ops: &'a StorageOperations,
        callback: impl FnOnce(&SyncTransaction<'a>) -> Result<T, ActorError>,
    ) -> Result<T, ActorError> {
        ops.ctx.check_alive()?;
        let CacheScope::Root(cache) = &ops.capability.scope else {
            return Err(ActorError::UnsupportedOperation(
                "transaction_sync() cannot be called within a transaction".into(),
            ));
        };
        if ops.ctx.sync_depth.load(Ordering::Acquire) > 0 {
            return Err(ActorError::UnsupportedOperation(
                "nested transaction_sync() must go through the enclosing transaction".into(),
            ));
        }
        let _depth = DepthGuard::enter(&ops.ctx.sync_depth, ops.config().max_transaction_sync_depth)?;
        let sync = SyncTransaction {
            ops,
            txn: Mutex::new(cache.begin_transaction()?),
            alarm: Mutex::new(None),
        };
        // An error or panic drops `sync` without committing, which discards its writes.
        let value = callback(&sync)?;
        let alarm = sync.alarm.into_inner();
        let confirmation = sync.txn.into_inner().commit()?;
        if let Some(scheduled_ms) = alarm {
            ops.ctx.alarms.written(scheduled_ms);
        }
        ops.ctx.gates.output.lock_while(confirmation)?;
        Ok(value)
    }

    /// Runs `callback` as a nested level. Its writes are undone if it fails.
    pub fn transaction_sync<T>(
        &self,
        callback: impl FnOnce(&SyncTransaction<'a>) -> Result<T, ActorError>,
    ) -> Result<T, ActorError> {
        let _depth = DepthGuard::enter(
            &self.ops.ctx.sync_depth,
            self.ops.config().max_transaction_sync_depth,
        )?;
        let savepoint = self.txn.lock().savepoint();
        let alarm = *self.alarm.lock();
        let result = callback(self);
        if result.is_err() {
            self.txn.lock().rollback_to(savepoint);
            *self.alarm.lock() = alarm;
        }
        result
    }

    pub fn get(&self, key: &str, options: GetOptions) -> Result<Option<Value>, ActorError> {
        let options = self.ops.admit(OpName::Get, options.into())?;
        self.ops.check_keys(OpName::Get, &[key.to_string()])?;
        let value = self.txn.lock().get(key, options.read())?;
        self.ops
            .record_read(options, value.as_ref().map_or(0, Vec::len));
        Ok(value)
    }

    pub fn get_multiple(
        &self,
        keys: impl Into<Keys>,
        options: GetOptions,
    ) -> Result<Fetched, ActorError> {
        let keys: Keys = keys.into();
        match keys {
            Keys::One(key) => self.get(&key, options).map(Fetched::One),
            Keys::Many(keys) => {
                let options = self.ops.admit(OpName::Get, options.into())?;
                self.ops.check_keys(OpName::Get, &keys)?;
                let values = self.txn.lock().get_multiple(&keys, options.read())?;
                self.ops
                    .record_read(options, values.values().map(Vec::len).sum());
                Ok(Fetched::Many(values))
            }
        }
    }

    pub fn list(&self, options: ListOptions) -> Result<BTreeMap<String, Value>, ActorError> {
        let resolved = self.ops.admit(OpName::List, (&options).into())?;
        let query = options.to_query()?;
        let entries = self.txn.lock().list(&query, resolved.read())?;
        self.ops.record_read(
            resolved,
            entries.iter().map(|(k, v)| k.len() + v.len()).sum(),
        );
        Ok(entries)
    }

    pub fn put(&self, entries: impl Into<Entries>, options: PutOptions) -> Result<(), ActorError> {
        let options = self.ops.admit(OpName::Put, options.into())?;
        let entries = Into::<Entries>::into(entries).into_entries();
        self.ops.check_entries(OpName::Put, &entries)?;
        self.ops.record_write(&entries);
        self.txn.lock().put_multiple(entries, options.write())
    }

    pub fn delete(&self, keys: impl Into<Keys>, options: PutOptions) -> Result<Deleted, ActorError> {
        let options = self.ops.admit(OpName::Delete, options.into())?;
        let keys: Keys = keys.into();
        let single = matches!(keys, Keys::One(_));
        let keys = keys.into_keys();
        self.ops.check_keys(OpName::Delete, &keys)?;
        self.ops.record_deletes(keys.len());
        let deleted = self
            .txn
            .lock()
            .delete_multiple(keys, options.write())?;
        Ok(if single {
            Deleted::One(deleted > 0)
        } else {
            Deleted::Many(deleted)
        })
    }

    pub fn get_alarm(&self, options: GetAlarmOptions) -> Result<Option<i64>, ActorError> {
        let options = self.ops.admit(OpName::GetAlarm, options.into())?;
        let stored = self.txn.lock().get_alarm(options.read())?;
        Ok(self.ops.ctx.alarms.visible(stored, self.pending_alarm_set()))
    }

    pub fn set_alarm(&self, scheduled_ms: i64, options: SetAlarmOptions) -> Result<(), ActorError> {
        let options = self.ops.admit(OpName::SetAlarm, options.into())?;
        self.txn
            .lock()
            .set_alarm(Some(scheduled_ms), options.write())?;
        *self.alarm.lock() = Some(Some(scheduled_ms));
        Ok(())
    }

    pub fn delete_alarm(&self, options: SetAlarmOptions) -> Result<(), ActorError> {
        let options = self.ops.admit(OpName::DeleteAlarm, options.into())?;
        if self.ops.ctx.alarms.delete_action(self.pending_alarm_set()) == DeleteAction::Skip {
            return Ok(());
        }
        self.txn.lock().set_alarm(None, options.write())?;
        *self.alarm.lock() = Some(None);
        Ok(())
    }

    fn pending_alarm_set(&self) -> bool {
        matches!(*self.alarm.lock(), Some(Some(_)))
    }

    pub fn use_direct_io(&self) -> bool {
        self.ops.use_direct_io()
    }
}
