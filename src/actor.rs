use crate::alarm::AlarmManager;
use crate::cache::{ActorCache, ReadOptions, WriteOptions};
use crate::config::ActorConfig;
use crate::error::ActorError;
use crate::gate::GatePair;
use crate::observer::ActorObserver;
use crate::storage::{Storage, StorageContext};
use crate::tracker::RequestTracker;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What application code sees of its actor.
#[derive(Clone)]
pub struct ActorState {
    id: ActorId,
    storage: Storage,
    ctx: Arc<StorageContext>,
    tracker: Arc<RequestTracker>,
}

impl ActorState {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Runs `callback` while holding the input gate, so no other work for this
    /// actor starts until it settles.
    ///
    /// The callback gets a state whose storage may keep operating while the
    /// gate is held. Called again from inside that callback, it runs the nested
    /// callback within the section already held. If the callback fails the
    /// actor is aborted, discarding its unconfirmed writes, and the callback's
    /// error is returned.
    pub async fn block_concurrency_while<T, F, Fut>(&self, callback: F) -> Result<T, ActorError>
    where
        F: FnOnce(ActorState) -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let held = self
            .storage
            .section()
            .filter(|section| self.ctx.gates.input.locked_by() == Some(*section));
        let (scoped, lock) = match held {
            Some(_) => (self.clone(), None),
            None => {
                let lock = self.ctx.gates.input.lock().await?;
                let scoped = ActorState {
                    storage: self.storage.for_section(lock.section()),
                    ..self.clone()
                };
                (scoped, Some(lock))
            }
        };
        let result = callback(scoped).await;
        if let Err(err) = &result {
            self.abort(&format!("blockConcurrencyWhile() callback failed: {err}"));
        }
        drop(lock);
        result
    }

    /// Resets the actor: queued work fails with `ActorAborted` and unconfirmed writes are dropped.
    pub fn abort(&self, reason: &str) {
        abort_context(&self.ctx, &self.id, reason);
    }

    /// Keeps the actor active until `future` completes.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let request = self.tracker.start_request();
        tokio::spawn(async move {
            future.await;
            drop(request);
        });
    }
}

fn abort_context(ctx: &StorageContext, id: &ActorId, reason: &str) {
    let err = ActorError::aborted(reason);
    if !ctx.mark_aborted(err.clone()) {
        return;
    }
    warn!(actor = %id, reason, "actor aborted");
    ctx.gates.break_all(err);
    ctx.cache.reset(reason);
}

/// One live instance of an actor: its storage, gates and request accounting.
pub struct Actor {
    state: ActorState,
    ctx: Arc<StorageContext>,
}

impl Actor {
    pub fn new(
        id: ActorId,
        cache: Arc<dyn ActorCache>,
        config: ActorConfig,
        observer: Arc<dyn ActorObserver>,
        tracker: Arc<RequestTracker>,
    ) -> Result<Arc<Self>, ActorError> {
        config.validate()?;
        let gates = GatePair::new(Arc::clone(&observer));
        let ctx = StorageContext::new(cache, gates, AlarmManager::new(), observer, config);
        debug!(actor = %id, "actor constructed");
        Ok(Arc::new(Self {
            state: ActorState {
                id,
                storage: Storage::new(Arc::clone(&ctx)),
                ctx: Arc::clone(&ctx),
                tracker,
            },
            ctx,
        }))
    }

    pub fn id(&self) -> &ActorId {
        &self.state.id
    }

    pub fn state(&self) -> &ActorState {
        &self.state
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.state.tracker
    }

    pub fn gates(&self) -> &GatePair {
        &self.ctx.gates
    }

    pub fn is_aborted(&self) -> bool {
        self.ctx.aborted().is_some()
    }

    pub fn abort(&self, reason: &str) {
        abort_context(&self.ctx, &self.state.id, reason);
    }

    /// Runs one inbound unit of work through the gates.
    ///
    /// Waits for the input gate, runs `work`, then holds the result back until
    /// every write the turn made is confirmed.
    pub async fn run_turn<T, F, Fut>(&self, work: F) -> Result<T, ActorError>
    where
        F: FnOnce(ActorState) -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let _request = self.state.tracker.start_request();
        self.ctx.check_alive()?;
        self.ctx.gates.input.wait().await?;
        let result = work(self.state.clone()).await;
        self.finish_turn().await?;
        result
    }

    /// Delivers the pending alarm if it is due at `now_ms`. Returns whether `handler` ran.
    ///
    /// A successful run clears the alarm unless the handler scheduled a new
    /// one. A failed run leaves it pending so the next call retries it.
    pub async fn run_alarm<F, Fut>(&self, now_ms: i64, handler: F) -> Result<bool, ActorError>
    where
        F: FnOnce(ActorState) -> Fut,
        Fut: Future<Output = Result<(), ActorError>>,
    {
        let _request = self.state.tracker.start_request();
        self.ctx.check_alive()?;
        self.ctx.gates.input.wait().await?;
        let scheduled_ms = match self.ctx.cache.get_alarm(ReadOptions::default()).await? {
            Some(at) if at <= now_ms => at,
            _ => return Ok(false),
        };
        debug!(actor = %self.state.id, scheduled_ms, now_ms, "delivering alarm");
        let run = self.ctx.alarms.begin(scheduled_ms);
        let result = handler(self.state.clone()).await;
        if run.finish(result.is_ok()) {
            let confirmation = self
                .ctx
                .cache
                .set_alarm(None, WriteOptions::default())
                .await?;
            self.ctx.gates.output.lock_while(confirmation)?;
        }
        self.finish_turn().await?;
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                info!(actor = %self.state.id, scheduled_ms, error = %err, "alarm handler failed, will retry");
                Err(err)
            }
        }
    }

    async fn finish_turn(&self) -> Result<(), ActorError> {
        if self.ctx.config.flush_on_turn_end
            && self.ctx.aborted().is_none()
            && let Err(err) = self.ctx.cache.flush().await
        {
            self.abort(&format!("storage flush failed: {err}"));
            return Err(err);
        }
        self.ctx.gates.output.wait().await
    }
}
