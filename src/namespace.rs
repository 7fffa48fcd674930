//! Owns the live actors of one class, keyed by id, and their durable stores.

use crate::actor::{Actor, ActorId};
use crate::cache::ActorCache;
use crate::cache::memory::{MemoryCache, MemoryStore};
use crate::config::ActorConfig;
use crate::error::ActorError;
use crate::observer::{ActorObserver, NoopObserver};
use crate::tracker::{RequestHooks, RequestTracker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorLifecycleEvent {
    Created { id: ActorId },
    Restarted { id: ActorId },
    Evicted { id: ActorId },
}

pub trait ActorLifecycleHook: Send + Sync {
    fn on_event(&self, event: &ActorLifecycleEvent);
}

struct LiveActor {
    actor: Arc<Actor>,
    cache: MemoryCache,
    hooks: Arc<EvictionHooks>,
}

struct NamespaceInner {
    config: ActorConfig,
    observer: Arc<dyn ActorObserver>,
    actors: Mutex<HashMap<ActorId, LiveActor>>,
    stores: Mutex<HashMap<ActorId, Arc<MemoryStore>>>,
    lifecycle_hooks: Mutex<Vec<Arc<dyn ActorLifecycleHook>>>,
}

impl NamespaceInner {
    fn emit(&self, event: ActorLifecycleEvent) {
        let hooks = self.lifecycle_hooks.lock().clone();
        for hook in &hooks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook.on_event(&event)))
                .is_err()
            {
                warn!("actor lifecycle hook panicked while handling event");
            }
        }
    }

    fn evict(&self, id: &ActorId, hooks: &Arc<EvictionHooks>, generation: u64) {
        let evicted = {
            let mut actors = self.actors.lock();
            let idle = actors.get(id).is_some_and(|live| {
                Arc::ptr_eq(&live.hooks, hooks)
                    && live.actor.tracker().active_requests() == 0
                    && hooks.generation.load(Ordering::Acquire) == generation
            });
            if idle { actors.remove(id) } else { None }
        };
        let Some(live) = evicted else {
            return;
        };
        live.actor.tracker().shutdown();
        // Handles still held elsewhere must not keep writing through the old session.
        live.actor.abort("actor evicted after idle period");
        info!(actor = %id, "actor evicted after idle period");
        self.emit(ActorLifecycleEvent::Evicted { id: id.clone() });
    }
}

/// Tracker hooks for one actor instance: flush when idle, evict if still idle later.
struct EvictionHooks {
    id: ActorId,
    namespace: Weak<NamespaceInner>,
    cache: MemoryCache,
    idle_ms: u64,
    generation: AtomicU64,
    this: Weak<EvictionHooks>,
}

impl RequestHooks for EvictionHooks {
    fn active(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn inactive(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(actor = %self.id, "no runtime, skipping idle maintenance");
            return;
        };
        let id = self.id.clone();
        let cache = self.cache.clone();
        let namespace = self.namespace.clone();
        let this = self.this.clone();
        let idle_ms = self.idle_ms;
        runtime.spawn(async move {
            if !cache.is_closed()
                && let Err(err) = cache.flush().await
            {
                warn!(actor = %id, error = %err, "idle flush failed");
            }
            tokio::time::sleep(Duration::from_millis(idle_ms)).await;
            if let (Some(namespace), Some(hooks)) = (namespace.upgrade(), this.upgrade()) {
                if hooks.generation.load(Ordering::Acquire) == generation
                    && !cache.is_closed()
                    && let Err(err) = cache.flush().await
                {
                    warn!(actor = %id, error = %err, "flush before eviction failed");
                }
                namespace.evict(&id, &hooks, generation);
            }
        });
    }
}

/// Registry of live actors backed by in-memory stores.
///
/// An actor is created on first use of its id and reused while alive. After
/// an abort or an idle eviction the next lookup starts a fresh instance over
/// the same durable store.
#[derive(Clone)]
pub struct ActorNamespace {
    inner: Arc<NamespaceInner>,
}

impl ActorNamespace {
    pub fn new(config: ActorConfig) -> Result<Self, ActorError> {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: ActorConfig,
        observer: Arc<dyn ActorObserver>,
    ) -> Result<Self, ActorError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(NamespaceInner {
                config,
                observer,
                actors: Mutex::new(HashMap::new()),
                stores: Mutex::new(HashMap::new()),
                lifecycle_hooks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &ActorConfig {
        &self.inner.config
    }

    pub fn add_lifecycle_hook(&self, hook: Arc<dyn ActorLifecycleHook>) {
        self.inner.lifecycle_hooks.lock().push(hook);
    }

    /// Uses `store` as the durable state for `id`. Only valid before the actor first starts.
    pub fn install_store(&self, id: &ActorId, store: Arc<MemoryStore>) -> Result<(), ActorError> {
        let mut stores = self.inner.stores.lock();
        if stores.contains_key(id) {
            return Err(ActorError::InvalidArgument(format!(
                "actor {id} already has a store"
            )));
        }
        stores.insert(id.clone(), store);
        Ok(())
    }

    pub fn store(&self, id: &ActorId) -> Option<Arc<MemoryStore>> {
        self.inner.stores.lock().get(id).cloned()
    }

    /// The cache session of the live instance of `id`, if any.
    pub fn cache(&self, id: &ActorId) -> Option<MemoryCache> {
        self.inner
            .actors
            .lock()
            .get(id)
            .map(|live| live.cache.clone())
    }

    pub fn is_live(&self, id: &ActorId) -> bool {
        self.inner
            .actors
            .lock()
            .get(id)
            .is_some_and(|live| !live.actor.is_aborted())
    }

    pub fn live_count(&self) -> usize {
        self.inner.actors.lock().len()
    }

    pub fn get_or_create(&self, id: &ActorId) -> Result<Arc<Actor>, ActorError> {
        let mut actors = self.inner.actors.lock();
        let restarted = match actors.get(id) {
            Some(live) if !live.actor.is_aborted() => return Ok(Arc::clone(&live.actor)),
            Some(_) => true,
            None => false,
        };
        if let Some(previous) = actors.remove(id) {
            previous.actor.tracker().shutdown();
        }

        let store = {
            let mut stores = self.inner.stores.lock();
            Arc::clone(
                stores
                    .entry(id.clone())
                    .or_insert_with(|| MemoryStore::new(self.inner.config.bookmark_retention_ms)),
            )
        };
        let cache = store.open_session();
        let hooks = Arc::new_cyclic(|this| EvictionHooks {
            id: id.clone(),
            namespace: Arc::downgrade(&self.inner),
            cache: cache.clone(),
            idle_ms: self.inner.config.eviction_idle_ms,
            generation: AtomicU64::new(0),
            this: this.clone(),
        });
        let weak_hooks: Weak<EvictionHooks> = Arc::downgrade(&hooks);
        let tracker = RequestTracker::new(weak_hooks);
        let actor = Actor::new(
            id.clone(),
            Arc::new(cache.clone()) as Arc<dyn ActorCache>,
            self.inner.config.clone(),
            Arc::clone(&self.inner.observer),
            tracker,
        )?;
        actors.insert(
            id.clone(),
            LiveActor {
                actor: Arc::clone(&actor),
                cache,
                hooks,
            },
        );
        drop(actors);

        info!(actor = %id, session = store.session(), restarted, "actor started");
        self.inner.emit(if restarted {
            ActorLifecycleEvent::Restarted { id: id.clone() }
        } else {
            ActorLifecycleEvent::Created { id: id.clone() }
        });
        Ok(actor)
    }
}
