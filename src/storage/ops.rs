//! Per-call option resolution and dispatch shared by every storage handle.

use super::StorageContext;
use super::transaction::TxnSlot;
use crate::alarm::DeleteAction;
use crate::cache::{ActorCache, ListQuery, ReadOptions, Value, WriteConfirmation, WriteOptions};
use crate::config::ActorConfig;
use crate::error::ActorError;
use crate::gate::SectionId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpName {
    Get,
    GetAlarm,
    List,
    Put,
    SetAlarm,
    Delete,
    DeleteAlarm,
    DeleteAll,
    Rollback,
}

impl OpName {
    pub fn as_str(self) -> &'static str {
        match self {
            OpName::Get => "get()",
            OpName::GetAlarm => "getAlarm()",
            OpName::List => "list()",
            OpName::Put => "put()",
            OpName::SetAlarm => "setAlarm()",
            OpName::Delete => "delete()",
            OpName::DeleteAlarm => "deleteAlarm()",
            OpName::DeleteAll => "deleteAll()",
            OpName::Rollback => "rollback()",
        }
    }
}

impl std::fmt::Display for OpName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options after the direct-I/O override has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub allow_concurrency: bool,
    pub no_cache: bool,
    pub allow_unconfirmed: bool,
}

impl ResolvedOptions {
    pub(crate) fn read(self) -> ReadOptions {
        ReadOptions {
            no_cache: self.no_cache,
        }
    }

    pub(crate) fn write(self) -> WriteOptions {
        WriteOptions {
            allow_unconfirmed: self.allow_unconfirmed,
            no_cache: self.no_cache,
        }
    }
}

/// Forces `allow_concurrency` and `no_cache` on when the handle uses direct I/O.
pub fn configure_options(requested: ResolvedOptions, direct_io: bool) -> ResolvedOptions {
    if !direct_io {
        return requested;
    }
    ResolvedOptions {
        allow_concurrency: true,
        no_cache: true,
        allow_unconfirmed: requested.allow_unconfirmed,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub allow_concurrency: bool,
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub allow_concurrency: bool,
    pub allow_unconfirmed: bool,
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAlarmOptions {
    pub allow_concurrency: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAlarmOptions {
    pub allow_concurrency: bool,
    pub allow_unconfirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Inclusive lower bound.
    pub start: Option<String>,
    /// Exclusive lower bound. Cannot be combined with `start`.
    pub start_after: Option<String>,
    /// Exclusive upper bound.
    pub end: Option<String>,
    pub prefix: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub allow_concurrency: bool,
    pub no_cache: bool,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub(crate) fn to_query(&self) -> Result<ListQuery, ActorError> {
        let start = match (&self.start, &self.start_after) {
            (Some(_), Some(_)) => {
                return Err(ActorError::InvalidArgument(
                    "list() cannot take both start and start_after".into(),
                ));
            }
            (Some(s), None) => Bound::Included(s.clone()),
            (None, Some(s)) => Bound::Excluded(s.clone()),
            (None, None) => Bound::Unbounded,
        };
        if self.limit == Some(0) {
            return Err(ActorError::InvalidArgument(
                "list() limit must be positive".into(),
            ));
        }
        Ok(ListQuery {
            start,
            end: self
                .end
                .clone()
                .map_or(Bound::Unbounded, Bound::Excluded),
            prefix: self.prefix.clone(),
            reverse: self.reverse,
            limit: self.limit,
        })
    }
}

impl From<GetOptions> for ResolvedOptions {
    fn from(o: GetOptions) -> Self {
        Self {
            allow_concurrency: o.allow_concurrency,
            no_cache: o.no_cache,
            allow_unconfirmed: false,
        }
    }
}

impl From<PutOptions> for ResolvedOptions {
    fn from(o: PutOptions) -> Self {
        Self {
            allow_concurrency: o.allow_concurrency,
            no_cache: o.no_cache,
            allow_unconfirmed: o.allow_unconfirmed,
        }
    }
}

impl From<GetAlarmOptions> for ResolvedOptions {
    fn from(o: GetAlarmOptions) -> Self {
        Self {
            allow_concurrency: o.allow_concurrency,
            ..Self::default()
        }
    }
}

impl From<SetAlarmOptions> for ResolvedOptions {
    fn from(o: SetAlarmOptions) -> Self {
        Self {
            allow_concurrency: o.allow_concurrency,
            allow_unconfirmed: o.allow_unconfirmed,
            ..Self::default()
        }
    }
}

impl From<&ListOptions> for ResolvedOptions {
    fn from(o: &ListOptions) -> Self {
        Self {
            allow_concurrency: o.allow_concurrency,
            no_cache: o.no_cache,
            allow_unconfirmed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    One(String),
    Many(Vec<String>),
}

impl Keys {
    pub(crate) fn into_keys(self) -> Vec<String> {
        match self {
            Keys::One(k) => vec![k],
            Keys::Many(ks) => ks,
        }
    }
}

impl From<&str> for Keys {
    fn from(k: &str) -> Self {
        Keys::One(k.to_string())
    }
}

impl From<String> for Keys {
    fn from(k: String) -> Self {
        Keys::One(k)
    }
}

impl From<Vec<String>> for Keys {
    fn from(ks: Vec<String>) -> Self {
        Keys::Many(ks)
    }
}

impl From<&[&str]> for Keys {
    fn from(ks: &[&str]) -> Self {
        Keys::Many(ks.iter().map(|k| k.to_string()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entries {
    One(String, Value),
    Many(Vec<(String, Value)>),
}

impl Entries {
    pub(crate) fn into_entries(self) -> Vec<(String, Value)> {
        match self {
            Entries::One(k, v) => vec![(k, v)],
            Entries::Many(es) => es,
        }
    }
}

impl<K: Into<String>, V: Into<Value>> From<(K, V)> for Entries {
    fn from((k, v): (K, V)) -> Self {
        Entries::One(k.into(), v.into())
    }
}

impl From<Vec<(String, Value)>> for Entries {
    fn from(es: Vec<(String, Value)>) -> Self {
        Entries::Many(es)
    }
}

impl From<BTreeMap<String, Value>> for Entries {
    fn from(es: BTreeMap<String, Value>) -> Self {
        Entries::Many(es.into_iter().collect())
    }
}

/// Result of `get`, shaped like the keys that were asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    One(Option<Value>),
    Many(BTreeMap<String, Value>),
}

impl Fetched {
    pub fn into_one(self) -> Option<Value> {
        match self {
            Fetched::One(v) => v,
            Fetched::Many(mut m) => m.pop_first().map(|(_, v)| v),
        }
    }

    pub fn into_many(self) -> BTreeMap<String, Value> {
        match self {
            Fetched::One(_) => BTreeMap::new(),
            Fetched::Many(m) => m,
        }
    }
}

/// Result of `delete`: whether the single key existed, or how many of several did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    One(bool),
    Many(usize),
}

/// Which cache a handle talks to.
#[derive(Clone)]
pub(crate) enum CacheScope {
    Root(Arc<dyn ActorCache>),
    Transaction(Arc<TxnSlot>),
}

#[derive(Clone)]
pub(crate) struct OpsCapability {
    pub(crate) scope: CacheScope,
    pub(crate) direct_io: bool,
}

/// The get/list/put/delete/alarm surface shared by [`super::Storage`] and
/// [`super::Transaction`].
///
/// Every call resolves its options against the handle's direct-I/O policy,
/// checks that the actor is alive and that no other exclusive section holds
/// the input gate, then dispatches to the handle's cache scope. Writes that are
/// not `allow_unconfirmed` lock the output gate until the cache confirms them.
#[derive(Clone)]
pub struct StorageOperations {
    pub(crate) capability: OpsCapability,
    pub(crate) section: Option<SectionId>,
    pub(crate) ctx: Arc<StorageContext>,
}

impl StorageOperations {
    pub fn use_direct_io(&self) -> bool {
        self.capability.direct_io
    }

    pub(crate) fn config(&self) -> &ActorConfig {
        &self.ctx.config
    }

    /// Common gatekeeping for every call. Returns the options the call must use.
    pub(crate) fn admit(
        &self,
        op: OpName,
        requested: ResolvedOptions,
    ) -> Result<ResolvedOptions, ActorError> {
        self.ctx.check_alive()?;
        if let CacheScope::Transaction(slot) = &self.capability.scope
            && slot.is_closed()
        {
            return Err(ActorError::TransactionClosed { op: op.as_str() });
        }
        let options = configure_options(requested, self.capability.direct_io);
        if !options.allow_concurrency
            && let Some(holder) = self.ctx.gates.input.locked_by()
            && self.section != Some(holder)
        {
            return Err(ActorError::ConcurrencyDenied { op: op.as_str() });
        }
        self.ctx.observer.storage_operation(op, &options);
        Ok(options)
    }

    pub(crate) fn check_keys(&self, op: OpName, keys: &[String]) -> Result<(), ActorError> {
        let config = self.config();
        if keys.len() > config.max_keys_per_op {
            return Err(ActorError::InvalidArgument(format!(
                "{op} accepts at most {} keys, got {}",
                config.max_keys_per_op,
                keys.len()
            )));
        }
        if let Some(key) = keys.iter().find(|k| k.len() > config.max_key_bytes) {
            return Err(ActorError::InvalidArgument(format!(
                "{op} key of {} bytes exceeds {} bytes",
                key.len(),
                config.max_key_bytes
            )));
        }
        Ok(())
    }

    pub(crate) fn check_entries(
        &self,
        op: OpName,
        entries: &[(String, Value)],
    ) -> Result<(), ActorError> {
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        self.check_keys(op, &keys)?;
        let max = self.config().max_value_bytes;
        if let Some((key, value)) = entries.iter().find(|(_, v)| v.len() > max) {
            return Err(ActorError::InvalidArgument(format!(
                "{op} value for {key:?} is {} bytes, limit is {max}",
                value.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn record_read(&self, options: ResolvedOptions, bytes: usize) {
        let units = self.config().storage_units(bytes);
        if options.no_cache {
            self.ctx.observer.add_uncached_storage_read_units(units);
        } else {
            self.ctx.observer.add_cached_storage_read_units(units);
        }
    }

    pub(crate) fn record_write(&self, entries: &[(String, Value)]) {
        let units = entries
            .iter()
            .map(|(k, v)| self.config().storage_units(k.len() + v.len()))
            .fold(0u32, u32::saturating_add);
        self.ctx.observer.add_storage_write_units(units);
    }

    pub(crate) fn record_deletes(&self, count: usize) {
        self.ctx
            .observer
            .add_storage_deletes(u32::try_from(count).unwrap_or(u32::MAX));
    }

    /// Holds the output gate until `confirmation` resolves, unless the write opted out.
    pub(crate) fn gate_write(
        &self,
        options: ResolvedOptions,
        confirmation: WriteConfirmation,
    ) -> Result<(), ActorError> {
        if options.allow_unconfirmed {
            return Ok(());
        }
        self.ctx.gates.output.lock_while(confirmation)
    }

    pub async fn get(
        &self,
        keys: impl Into<Keys>,
        options: GetOptions,
    ) -> Result<Fetched, ActorError> {
        let keys: Keys = keys.into();
        let options = self.admit(OpName::Get, options.into())?;
        match keys {
            Keys::One(key) => {
                self.check_keys(OpName::Get, std::slice::from_ref(&key))?;
                let value = match &self.capability.scope {
                    CacheScope::Root(cache) => cache.get(&key, options.read()).await?,
                    CacheScope::Transaction(slot) => {
                        slot.with(OpName::Get, |txn| txn.get(&key, options.read()))?
                    }
                };
                self.record_read(options, value.as_ref().map_or(0, Vec::len));
                Ok(Fetched::One(value))
            }
            Keys::Many(keys) => {
                self.check_keys(OpName::Get, &keys)?;
                let values = match &self.capability.scope {
                    CacheScope::Root(cache) => cache.get_multiple(&keys, options.read()).await?,
                    CacheScope::Transaction(slot) => slot
                        .with(OpName::Get, |txn| txn.get_multiple(&keys, options.read()))?,
                };
                self.record_read(options, values.values().map(Vec::len).sum());
                Ok(Fetched::Many(values))
            }
        }
    }

    /// Reads one key and decodes it from MessagePack.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<T>, ActorError> {
        match self.get(key, options).await?.into_one() {
            Some(bytes) => rmp_serde::from_slice(&bytes).map(Some).map_err(|e| {
                ActorError::InvalidArgument(format!("value for {key:?} does not decode: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub async fn list(&self, options: ListOptions) -> Result<BTreeMap<String, Value>, ActorError> {
        let resolved = self.admit(OpName::List, (&options).into())?;
        let query = options.to_query()?;
        let entries = match &self.capability.scope {
            CacheScope::Root(cache) => cache.list(&query, resolved.read()).await?,
            CacheScope::Transaction(slot) => {
                slot.with(OpName::List, |txn| txn.list(&query, resolved.read()))?
            }
        };
        self.record_read(
            resolved,
            entries.iter().map(|(k, v)| k.len() + v.len()).sum(),
        );
        Ok(entries)
    }

    pub async fn put(&self, entries: impl Into<Entries>, options: PutOptions) -> Result<(), ActorError> {
        let options = self.admit(OpName::Put, options.into())?;
        let entries = Into::<Entries>::into(entries).into_entries();
        self.check_entries(OpName::Put, &entries)?;
        self.record_write(&entries);
        match &self.capability.scope {
            CacheScope::Root(cache) => {
                let confirmation = cache.put_multiple(entries, options.write()).await?;
                self.gate_write(options, confirmation)
            }
            CacheScope::Transaction(slot) => {
                slot.with(OpName::Put, |txn| txn.put_multiple(entries, options.write()))
            }
        }
    }

    /// Encodes `value` with MessagePack and stores it under `key`.
    pub async fn put_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: PutOptions,
    ) -> Result<(), ActorError> {
        let bytes = rmp_serde::to_vec(value).map_err(|e| {
            ActorError::InvalidArgument(format!("value for {key:?} does not encode: {e}"))
        })?;
        self.put((key, bytes), options).await
    }

    pub async fn delete(
        &self,
        keys: impl Into<Keys>,
        options: PutOptions,
    ) -> Result<Deleted, ActorError> {
        let options = self.admit(OpName::Delete, options.into())?;
        let keys: Keys = keys.into();
        let single = matches!(keys, Keys::One(_));
        let keys = keys.into_keys();
        self.check_keys(OpName::Delete, &keys)?;
        self.record_deletes(keys.len());
        let deleted = match &self.capability.scope {
            CacheScope::Root(cache) => {
                let outcome = cache.delete_multiple(keys, options.write()).await?;
                self.gate_write(options, outcome.confirmation)?;
                outcome.deleted
            }
            CacheScope::Transaction(slot) => slot.with(OpName::Delete, |txn| {
                txn.delete_multiple(keys, options.write())
            })?,
        };
        Ok(if single {
            Deleted::One(deleted > 0)
        } else {
            Deleted::Many(deleted)
        })
    }

    /// Removes every key in one write. Only the root handle supports it.
    pub async fn delete_all(&self, options: PutOptions) -> Result<usize, ActorError> {
        let options = self.admit(OpName::DeleteAll, options.into())?;
        match &self.capability.scope {
            CacheScope::Root(cache) => {
                let outcome = cache.delete_all(options.write()).await?;
                self.record_deletes(outcome.deleted);
                self.gate_write(options, outcome.confirmation)?;
                Ok(outcome.deleted)
            }
            CacheScope::Transaction(_) => Err(ActorError::UnsupportedOperation(
                "deleteAll() cannot be called within a transaction".into(),
            )),
        }
    }

    pub async fn get_alarm(&self, options: GetAlarmOptions) -> Result<Option<i64>, ActorError> {
        let options = self.admit(OpName::GetAlarm, options.into())?;
        let (stored, pending_set) = match &self.capability.scope {
            CacheScope::Root(cache) => (cache.get_alarm(options.read()).await?, false),
            CacheScope::Transaction(slot) => (
                slot.with(OpName::GetAlarm, |txn| txn.get_alarm(options.read()))?,
                slot.pending_alarm_set(),
            ),
        };
        Ok(self.ctx.alarms.visible(stored, pending_set))
    }

    /// Schedules the alarm, replacing any pending one.
    pub async fn set_alarm(
        &self,
        scheduled_ms: i64,
        options: SetAlarmOptions,
    ) -> Result<(), ActorError> {
        let options = self.admit(OpName::SetAlarm, options.into())?;
        self.write_alarm(OpName::SetAlarm, Some(scheduled_ms), options)
            .await
    }

    pub async fn delete_alarm(&self, options: SetAlarmOptions) -> Result<(), ActorError> {
        let options = self.admit(OpName::DeleteAlarm, options.into())?;
        let pending_set = match &self.capability.scope {
            CacheScope::Root(_) => false,
            CacheScope::Transaction(slot) => slot.pending_alarm_set(),
        };
        if self.ctx.alarms.delete_action(pending_set) == DeleteAction::Skip {
            return Ok(());
        }
        self.write_alarm(OpName::DeleteAlarm, None, options).await
    }

    /// Root writes are recorded with the alarm manager once the cache accepts
    /// them. Transactional writes wait for the commit.
    async fn write_alarm(
        &self,
        op: OpName,
        scheduled_ms: Option<i64>,
        options: ResolvedOptions,
    ) -> Result<(), ActorError> {
        match &self.capability.scope {
            CacheScope::Root(cache) => {
                let confirmation = cache.set_alarm(scheduled_ms, options.write()).await?;
                self.ctx.alarms.written(scheduled_ms);
                self.gate_write(options, confirmation)
            }
            CacheScope::Transaction(slot) => {
                slot.with(op, |txn| txn.set_alarm(scheduled_ms, options.write()))?;
                slot.record_alarm(scheduled_ms);
                Ok(())
            }
        }
    }
}
