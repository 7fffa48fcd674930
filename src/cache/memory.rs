//! In-process storage collaborator.
//!
//! [`MemoryStore`] is the durable side: committed versions tagged with a
//! session and sequence number, kept for the bookmark retention window.
//! [`MemoryCache`] is one actor session over a store. Writes become visible
//! immediately and are queued into a batch that [`ActorCache::flush`] commits.

use crate::bookmark::{Bookmark, now_millis};
use crate::cache::{
    ActorCache, CacheTransaction, ConfirmationResolver, DeleteOutcome, ListQuery, ReadOptions,
    Value, WriteConfirmation, WriteOptions,
};
use crate::error::{ActorError, StorageErrorKind};
use async_trait::async_trait;
use im::OrdMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct VersionKey {
    session: u32,
    seq: u64,
}

impl VersionKey {
    fn bookmark(self) -> Bookmark {
        Bookmark(format!("{:08x}{:016x}", self.session, self.seq))
    }

    fn parse(bookmark: &Bookmark) -> Result<Self, ActorError> {
        let raw = bookmark.as_str();
        let invalid = || ActorError::InvalidBookmark(format!("malformed bookmark {raw:?}"));
        if raw.len() != 24 || !raw.is_ascii() {
            return Err(invalid());
        }
        let session = u32::from_str_radix(&raw[..8], 16).map_err(|_| invalid())?;
        let seq = u64::from_str_radix(&raw[8..], 16).map_err(|_| invalid())?;
        Ok(Self { session, seq })
    }
}

#[derive(Clone)]
struct Version {
    at_ms: i64,
    data: OrdMap<String, Value>,
}

struct StoreState {
    session: u32,
    seq: u64,
    data: OrdMap<String, Value>,
    alarm: Option<i64>,
    history: BTreeMap<VersionKey, Version>,
    pending_restore: Option<VersionKey>,
    fail_next_commit: Option<ActorError>,
}

/// Durable versioned key/value state for one actor id.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    retention_ms: i64,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new(retention_ms: u64) -> Arc<Self> {
        Self::build(retention_ms, None)
    }

    /// Store that rejects writes growing the data past `quota_bytes` (keys plus values).
    pub fn with_quota(retention_ms: u64, quota_bytes: usize) -> Arc<Self> {
        Self::build(retention_ms, Some(quota_bytes))
    }

    fn build(retention_ms: u64, quota_bytes: Option<usize>) -> Arc<Self> {
        let mut history = BTreeMap::new();
        history.insert(
            VersionKey { session: 0, seq: 0 },
            Version {
                at_ms: now_millis(),
                data: OrdMap::new(),
            },
        );
        Arc::new(Self {
            state: Mutex::new(StoreState {
                session: 0,
                seq: 0,
                data: OrdMap::new(),
                alarm: None,
                history,
                pending_restore: None,
                fail_next_commit: None,
            }),
            retention_ms: i64::try_from(retention_ms).unwrap_or(i64::MAX),
            quota_bytes,
        })
    }

    /// Opens a new session, applying any scheduled restore first.
    pub fn open_session(self: &Arc<Self>) -> MemoryCache {
        let (data, alarm, session) = {
            let mut state = self.state.lock();
            let now = now_millis();
            match state.pending_restore.take() {
                Some(target) if state.history.contains_key(&target) => {
                    let undo = VersionKey {
                        session: state.session,
                        seq: u64::MAX,
                    };
                    let current = state.data.clone();
                    state.history.insert(
                        undo,
                        Version {
                            at_ms: now,
                            data: current,
                        },
                    );
                    let restored = state
                        .history
                        .get(&target)
                        .map(|v| v.data.clone())
                        .unwrap_or_default();
                    state.session += 1;
                    state.seq = 0;
                    state.data = restored.clone();
                    let key = VersionKey {
                        session: state.session,
                        seq: 0,
                    };
                    state.history.insert(
                        key,
                        Version {
                            at_ms: now,
                            data: restored,
                        },
                    );
                    info!(
                        session = state.session,
                        restored_from = %target.bookmark(),
                        "storage restored at session start"
                    );
                }
                skipped => {
                    if let Some(target) = skipped {
                        warn!(
                            target = %target.bookmark(),
                            "scheduled restore names a version that was never committed or has expired, skipping"
                        );
                    }
                    state.session += 1;
                    state.seq = 0;
                    let key = VersionKey {
                        session: state.session,
                        seq: 0,
                    };
                    let data = state.data.clone();
                    state.history.insert(key, Version { at_ms: now, data });
                }
            }
            (state.data.clone(), state.alarm, state.session)
        };
        debug!(session, "memory cache session opened");
        MemoryCache {
            shared: Arc::new(CacheShared {
                store: Arc::clone(self),
                session,
                state: Mutex::new(CacheState {
                    view: View::new(data, alarm),
                    pending: Vec::new(),
                    dirty: false,
                    hold_confirmations: false,
                    closed: None,
                }),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    /// Durable contents, excluding unflushed writes.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.state
            .lock()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn durable_alarm(&self) -> Option<i64> {
        self.state.lock().alarm
    }

    pub fn session(&self) -> u32 {
        self.state.lock().session
    }

    /// Makes the next commit fail with `err`.
    pub fn fail_next_commit(&self, err: ActorError) {
        self.state.lock().fail_next_commit = Some(err);
    }

    fn commit(
        &self,
        session: u32,
        data: OrdMap<String, Value>,
        alarm: Option<i64>,
    ) -> Result<Bookmark, ActorError> {
        let mut state = self.state.lock();
        if session != state.session {
            return Err(ActorError::storage(
                StorageErrorKind::Closed,
                format!("session {session} was superseded by session {}", state.session),
            ));
        }
        if let Some(err) = state.fail_next_commit.take() {
            return Err(err);
        }
        let now = now_millis();
        state.seq += 1;
        state.data = data.clone();
        state.alarm = alarm;
        let key = VersionKey {
            session: state.session,
            seq: state.seq,
        };
        state.history.insert(key, Version { at_ms: now, data });
        self.prune(&mut state, now);
        Ok(key.bookmark())
    }

    fn prune(&self, state: &mut StoreState, now: i64) {
        let horizon = now.saturating_sub(self.retention_ms);
        let expired: Vec<VersionKey> = state
            .history
            .iter()
            .filter(|(_, v)| v.at_ms < horizon)
            .map(|(k, _)| *k)
            .collect();
        // The newest expired version still describes the state at the horizon.
        for key in expired.iter().rev().skip(1) {
            state.history.remove(key);
        }
    }

    fn durable_key(&self) -> VersionKey {
        let state = self.state.lock();
        VersionKey {
            session: state.session,
            seq: state.seq,
        }
    }

    fn bookmark_for_time(&self, timestamp_ms: i64) -> Bookmark {
        let state = self.state.lock();
        state
            .history
            .iter()
            .filter(|(_, v)| v.at_ms <= timestamp_ms)
            .max_by_key(|(k, v)| (v.at_ms, **k))
            .or_else(|| state.history.iter().next())
            .map(|(k, _)| k.bookmark())
            .unwrap_or_else(|| VersionKey { session: 0, seq: 0 }.bookmark())
    }

    /// Schedules a restore to `bookmark`, which must name a committed version
    /// or `pending`, the version the caller's unflushed writes will commit as.
    fn schedule_restore(
        &self,
        bookmark: &Bookmark,
        pending: Option<VersionKey>,
    ) -> Result<Bookmark, ActorError> {
        let target = VersionKey::parse(bookmark)?;
        let mut state = self.state.lock();
        if !state.history.contains_key(&target) && pending != Some(target) {
            return Err(ActorError::InvalidBookmark(format!(
                "bookmark {bookmark} does not name a retained state"
            )));
        }
        state.pending_restore = Some(target);
        info!(target = %bookmark, session = state.session, "restore scheduled for next session");
        Ok(VersionKey {
            session: state.session,
            seq: u64::MAX,
        }
        .bookmark())
    }
}

/// Counters for the reads and writes one session has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_reads: u64,
    pub uncached_reads: u64,
    pub writes: u64,
    pub flushes: u64,
}

#[derive(Debug, Clone)]
enum Mutation {
    Put(String, Value),
    Delete(String),
    DeleteAll,
    SetAlarm(Option<i64>),
}

#[derive(Clone)]
struct View {
    data: OrdMap<String, Value>,
    bytes: usize,
    alarm: Option<i64>,
}

impl View {
    fn new(data: OrdMap<String, Value>, alarm: Option<i64>) -> Self {
        let bytes = data.iter().map(|(k, v)| k.len() + v.len()).sum();
        Self { data, bytes, alarm }
    }

    /// Applies `m`, returning how many existing keys it removed.
    fn apply(&mut self, m: &Mutation) -> usize {
        match m {
            Mutation::Put(key, value) => {
                if let Some(old) = self.data.insert(key.clone(), value.clone()) {
                    self.bytes -= key.len() + old.len();
                }
                self.bytes += key.len() + value.len();
                0
            }
            Mutation::Delete(key) => match self.data.remove(key) {
                Some(old) => {
                    self.bytes -= key.len() + old.len();
                    1
                }
                None => 0,
            },
            Mutation::DeleteAll => {
                let removed = self.data.len();
                self.data = OrdMap::new();
                self.bytes = 0;
                removed
            }
            Mutation::SetAlarm(alarm) => {
                self.alarm = *alarm;
                0
            }
        }
    }

    fn list(&self, query: &ListQuery) -> BTreeMap<String, Value> {
        if query.is_empty_range() {
            return BTreeMap::new();
        }
        query.collect(self.data.range::<_, str>(query.bounds()))
    }
}

struct CacheState {
    view: View,
    pending: Vec<ConfirmationResolver>,
    dirty: bool,
    hold_confirmations: bool,
    closed: Option<String>,
}

struct CacheShared {
    store: Arc<MemoryStore>,
    session: u32,
    state: Mutex<CacheState>,
    stats: Mutex<CacheStats>,
}

impl CacheShared {
    /// Version the session's state will have once its queued writes commit.
    fn next_key(&self, state: &CacheState) -> VersionKey {
        let mut key = self.store.durable_key();
        if state.dirty {
            key.seq += 1;
        }
        key
    }

    fn check_open(&self, state: &CacheState) -> Result<(), ActorError> {
        match &state.closed {
            Some(reason) => Err(ActorError::storage(StorageErrorKind::Closed, reason.clone())),
            None => Ok(()),
        }
    }

    fn read<T>(
        &self,
        options: ReadOptions,
        f: impl FnOnce(&View) -> T,
    ) -> Result<T, ActorError> {
        let state = self.state.lock();
        self.check_open(&state)?;
        let out = f(&state.view);
        drop(state);
        let mut stats = self.stats.lock();
        if options.no_cache {
            stats.uncached_reads += 1;
        } else {
            stats.cached_reads += 1;
        }
        Ok(out)
    }

    /// Applies `mutations` as one unit and queues them for the next flush.
    fn write(&self, mutations: &[Mutation]) -> Result<(usize, WriteConfirmation), ActorError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let mut next = state.view.clone();
        let removed = mutations.iter().map(|m| next.apply(m)).sum();
        if let Some(quota) = self.store.quota_bytes
            && next.bytes > quota
            && next.bytes > state.view.bytes
        {
            return Err(ActorError::storage(
                StorageErrorKind::QuotaExceeded,
                format!("{} bytes exceeds the {quota} byte quota", next.bytes),
            ));
        }
        state.view = next;
        state.dirty = true;
        let (confirmation, resolver) = WriteConfirmation::pending();
        state.pending.push(resolver);
        drop(state);
        self.stats.lock().writes += mutations.len() as u64;
        Ok((removed, confirmation))
    }
}

/// One session over a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryCache {
    shared: Arc<CacheShared>,
}

impl MemoryCache {
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.shared.store
    }

    pub fn stats(&self) -> CacheStats {
        *self.shared.stats.lock()
    }

    /// While set, `flush` leaves queued writes unconfirmed.
    pub fn set_hold_confirmations(&self, hold: bool) {
        self.shared.state.lock().hold_confirmations = hold;
    }

    pub fn unconfirmed_writes(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }
}

#[async_trait]
impl ActorCache for MemoryCache {
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<Value>, ActorError> {
        self.shared.read(options, |view| view.data.get(key).cloned())
    }

    async fn get_multiple(
        &self,
        keys: &[String],
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError> {
        self.shared.read(options, |view| {
            keys.iter()
                .filter_map(|k| view.data.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        })
    }

    async fn list(
        &self,
        query: &ListQuery,
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError> {
        self.shared.read(options, |view| view.list(query))
    }

    async fn put_multiple(
        &self,
        entries: Vec<(String, Value)>,
        _options: WriteOptions,
    ) -> Result<WriteConfirmation, ActorError> {
        let mutations: Vec<Mutation> = entries
            .into_iter()
            .map(|(k, v)| Mutation::Put(k, v))
            .collect();
        self.shared.write(&mutations).map(|(_, c)| c)
    }

    async fn delete_multiple(
        &self,
        keys: Vec<String>,
        _options: WriteOptions,
    ) -> Result<DeleteOutcome, ActorError> {
        let mutations: Vec<Mutation> = keys.into_iter().map(Mutation::Delete).collect();
        let (deleted, confirmation) = self.shared.write(&mutations)?;
        Ok(DeleteOutcome {
            deleted,
            confirmation,
        })
    }

    async fn delete_all(&self, _options: WriteOptions) -> Result<DeleteOutcome, ActorError> {
        let (deleted, confirmation) = self.shared.write(&[Mutation::DeleteAll])?;
        Ok(DeleteOutcome {
            deleted,
            confirmation,
        })
    }

    async fn get_alarm(&self, options: ReadOptions) -> Result<Option<i64>, ActorError> {
        self.shared.read(options, |view| view.alarm)
    }

    async fn set_alarm(
        &self,
        scheduled_ms: Option<i64>,
        _options: WriteOptions,
    ) -> Result<WriteConfirmation, ActorError> {
        self.shared
            .write(&[Mutation::SetAlarm(scheduled_ms)])
            .map(|(_, c)| c)
    }

    fn begin_transaction(&self) -> Result<Box<dyn CacheTransaction>, ActorError> {
        let state = self.shared.state.lock();
        self.shared.check_open(&state)?;
        drop(state);
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            log: Vec::new(),
        }))
    }

    async fn flush(&self) -> Result<(), ActorError> {
        let (result, resolvers) = {
            let mut state = self.shared.state.lock();
            self.shared.check_open(&state)?;
            if state.hold_confirmations || !state.dirty {
                return Ok(());
            }
            let result = self
                .shared
                .store
                .commit(self.shared.session, state.view.data.clone(), state.view.alarm);
            state.dirty = false;
            if let Err(err) = &result {
                state.closed = Some(format!("flush failed: {err}"));
            }
            (result, std::mem::take(&mut state.pending))
        };
        self.shared.stats.lock().flushes += 1;
        let outcome = result.map(|bookmark| {
            debug!(bookmark = %bookmark, writes = resolvers.len(), "batch committed");
        });
        if let Err(err) = &outcome {
            warn!(error = %err, "memory cache flush failed");
        }
        for resolver in resolvers {
            resolver.resolve(outcome.clone());
        }
        outcome
    }

    fn reset(&self, reason: &str) {
        let resolvers = {
            let mut state = self.shared.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.to_string());
            state.dirty = false;
            std::mem::take(&mut state.pending)
        };
        if !resolvers.is_empty() {
            debug!(discarded = resolvers.len(), reason, "memory cache reset");
        }
        for resolver in resolvers {
            resolver.resolve(Err(ActorError::aborted(reason)));
        }
    }

    async fn current_bookmark(&self) -> Result<Bookmark, ActorError> {
        let state = self.shared.state.lock();
        self.shared.check_open(&state)?;
        Ok(self.shared.next_key(&state).bookmark())
    }

    async fn bookmark_for_time(&self, timestamp_ms: i64) -> Result<Bookmark, ActorError> {
        let state = self.shared.state.lock();
        self.shared.check_open(&state)?;
        Ok(self.shared.store.bookmark_for_time(timestamp_ms))
    }

    async fn restore_on_next_session(&self, bookmark: &Bookmark) -> Result<Bookmark, ActorError> {
        let pending = {
            let state = self.shared.state.lock();
            self.shared.check_open(&state)?;
            state.dirty.then(|| self.shared.next_key(&state))
        };
        self.shared.store.schedule_restore(bookmark, pending)
    }
}

/// Write log over a [`MemoryCache`]. Reads replay the log over the session's current view.
pub struct MemoryTransaction {
    shared: Arc<CacheShared>,
    log: Vec<Mutation>,
}

impl MemoryTransaction {
    fn view(&self, options: ReadOptions) -> Result<View, ActorError> {
        let mut view = self.shared.read(options, View::clone)?;
        for m in &self.log {
            view.apply(m);
        }
        Ok(view)
    }
}

impl CacheTransaction for MemoryTransaction {
    fn get(&self, key: &str, options: ReadOptions) -> Result<Option<Value>, ActorError> {
        Ok(self.view(options)?.data.get(key).cloned())
    }

    fn get_multiple(
        &self,
        keys: &[String],
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError> {
        let view = self.view(options)?;
        Ok(keys
            .iter()
            .filter_map(|k| view.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn list(
        &self,
        query: &ListQuery,
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError> {
        Ok(self.view(options)?.list(query))
    }

    fn put_multiple(
        &mut self,
        entries: Vec<(String, Value)>,
        _options: WriteOptions,
    ) -> Result<(), ActorError> {
        self.log
            .extend(entries.into_iter().map(|(k, v)| Mutation::Put(k, v)));
        Ok(())
    }

    fn delete_multiple(
        &mut self,
        keys: Vec<String>,
        options: WriteOptions,
    ) -> Result<usize, ActorError> {
        let mut view = self.view(ReadOptions {
            no_cache: options.no_cache,
        })?;
        let mut deleted = 0;
        for key in keys {
            let m = Mutation::Delete(key);
            deleted += view.apply(&m);
            self.log.push(m);
        }
        Ok(deleted)
    }

    fn get_alarm(&self, options: ReadOptions) -> Result<Option<i64>, ActorError> {
        Ok(self.view(options)?.alarm)
    }

    fn set_alarm(
        &mut self,
        scheduled_ms: Option<i64>,
        _options: WriteOptions,
    ) -> Result<(), ActorError> {
        self.log.push(Mutation::SetAlarm(scheduled_ms));
        Ok(())
    }

    fn savepoint(&mut self) -> usize {
        self.log.len()
    }

    fn rollback_to(&mut self, savepoint: usize) {
        self.log.truncate(savepoint);
    }

    fn commit(self: Box<Self>) -> Result<WriteConfirmation, ActorError> {
        if self.log.is_empty() {
            return Ok(WriteConfirmation::confirmed());
        }
        self.shared.write(&self.log).map(|(_, c)| c)
    }

    fn rollback(self: Box<Self>) {}
}
