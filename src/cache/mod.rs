//! Contract between the coordination layer and the storage collaborator.
//!
//! The coordination layer never touches storage except through [`ActorCache`]
//! (root scope) and [`CacheTransaction`] (explicit transactions).

pub mod memory;

use crate::bookmark::Bookmark;
use crate::error::ActorError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::oneshot;

pub type Value = Vec<u8>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub allow_unconfirmed: bool,
    pub no_cache: bool,
}

/// Key range handed to the cache for `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub start: Bound<String>,
    pub end: Bound<String>,
    pub prefix: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            prefix: None,
            reverse: false,
            limit: None,
        }
    }
}

impl ListQuery {
    /// Applies the query to an ordered iterator of entries.
    pub fn collect<'a, I>(&self, entries: I) -> BTreeMap<String, Value>
    where
        I: DoubleEndedIterator<Item = (&'a String, &'a Value)>,
    {
        let matching = |(k, _): &(&'a String, &'a Value)| {
            self.prefix.as_ref().is_none_or(|p| k.starts_with(p.as_str()))
        };
        let limit = self.limit.unwrap_or(usize::MAX);
        let picked: Vec<(&String, &Value)> = if self.reverse {
            entries.rev().filter(matching).take(limit).collect()
        } else {
            entries.filter(matching).take(limit).collect()
        };
        picked
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (as_str_bound(&self.start), as_str_bound(&self.end))
    }

    /// True when no key can satisfy both bounds. Ordered maps panic on such ranges.
    pub fn is_empty_range(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e))
                if s > e =>
            {
                true
            }
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => {
                s == e
            }
            _ => false,
        }
    }
}

fn as_str_bound(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_str()),
        Bound::Excluded(k) => Bound::Excluded(k.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[derive(Debug)]
enum ConfirmationState {
    Confirmed,
    Pending(oneshot::Receiver<Result<(), ActorError>>),
}

/// Resolves when the cache has made a write durable.
#[derive(Debug)]
pub struct WriteConfirmation {
    state: ConfirmationState,
}

/// Completes a pending [`WriteConfirmation`]. Dropping it unresolved fails the confirmation.
#[derive(Debug)]
pub struct ConfirmationResolver {
    tx: oneshot::Sender<Result<(), ActorError>>,
}

impl WriteConfirmation {
    pub fn confirmed() -> Self {
        Self {
            state: ConfirmationState::Confirmed,
        }
    }

    pub fn pending() -> (Self, ConfirmationResolver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: ConfirmationState::Pending(rx),
            },
            ConfirmationResolver { tx },
        )
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, ConfirmationState::Confirmed)
    }

    pub async fn wait(self) -> Result<(), ActorError> {
        match self.state {
            ConfirmationState::Confirmed => Ok(()),
            ConfirmationState::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ActorError::aborted("write discarded before confirmation"))),
        }
    }
}

impl ConfirmationResolver {
    pub fn resolve(self, result: Result<(), ActorError>) {
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub deleted: usize,
    pub confirmation: WriteConfirmation,
}

/// Root-scope cache handle for one actor session.
#[async_trait]
pub trait ActorCache: Send + Sync {
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<Value>, ActorError>;

    async fn get_multiple(
        &self,
        keys: &[String],
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError>;

    async fn list(
        &self,
        query: &ListQuery,
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError>;

    async fn put_multiple(
        &self,
        entries: Vec<(String, Value)>,
        options: WriteOptions,
    ) -> Result<WriteConfirmation, ActorError>;

    async fn delete_multiple(
        &self,
        keys: Vec<String>,
        options: WriteOptions,
    ) -> Result<DeleteOutcome, ActorError>;

    async fn delete_all(&self, options: WriteOptions) -> Result<DeleteOutcome, ActorError>;

    async fn get_alarm(&self, options: ReadOptions) -> Result<Option<i64>, ActorError>;

    async fn set_alarm(
        &self,
        scheduled_ms: Option<i64>,
        options: WriteOptions,
    ) -> Result<WriteConfirmation, ActorError>;

    fn begin_transaction(&self) -> Result<Box<dyn CacheTransaction>, ActorError>;

    /// Writes every queued batch durably and resolves their confirmations.
    async fn flush(&self) -> Result<(), ActorError>;

    /// Discards unflushed writes, failing their confirmations, and closes the session.
    fn reset(&self, reason: &str);

    async fn current_bookmark(&self) -> Result<Bookmark, ActorError>;

    async fn bookmark_for_time(&self, timestamp_ms: i64) -> Result<Bookmark, ActorError>;

    /// Schedules a restore to `bookmark` at the next session start and returns the undo bookmark.
    async fn restore_on_next_session(&self, bookmark: &Bookmark) -> Result<Bookmark, ActorError>;
}

/// Explicit transaction over a cache session. Reads see the transaction's own writes.
pub trait CacheTransaction: Send {
    fn get(&self, key: &str, options: ReadOptions) -> Result<Option<Value>, ActorError>;

    fn get_multiple(
        &self,
        keys: &[String],
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError>;

    fn list(
        &self,
        query: &ListQuery,
        options: ReadOptions,
    ) -> Result<BTreeMap<String, Value>, ActorError>;

    fn put_multiple(
        &mut self,
        entries: Vec<(String, Value)>,
        options: WriteOptions,
    ) -> Result<(), ActorError>;

    fn delete_multiple(&mut self, keys: Vec<String>, options: WriteOptions)
    -> Result<usize, ActorError>;

    fn get_alarm(&self, options: ReadOptions) -> Result<Option<i64>, ActorError>;

    fn set_alarm(&mut self, scheduled_ms: Option<i64>, options: WriteOptions)
    -> Result<(), ActorError>;

    /// Marks a point that [`CacheTransaction::rollback_to`] can return to.
    fn savepoint(&mut self) -> usize;

    fn rollback_to(&mut self, savepoint: usize);

    /// Applies every write as one atomic batch.
    fn commit(self: Box<Self>) -> Result<WriteConfirmation, ActorError>;

    fn rollback(self: Box<Self>);
}
