pub mod actor;
pub mod alarm;
pub mod bookmark;
pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod namespace;
pub mod observer;
pub mod storage;
pub mod tracker;

pub use actor::{Actor, ActorId, ActorState};
pub use bookmark::Bookmark;
pub use cache::memory::{CacheStats, MemoryCache, MemoryStore};
pub use cache::{ActorCache, CacheTransaction, WriteConfirmation};
pub use config::ActorConfig;
pub use error::{ActorError, ActorErrorCode, StorageErrorKind};
pub use gate::{GatePair, InputGate, OutputGate, SectionId};
pub use namespace::{ActorLifecycleEvent, ActorLifecycleHook, ActorNamespace};
pub use observer::{ActorObserver, NoopObserver};
pub use storage::{
    Deleted, Fetched, GetAlarmOptions, GetOptions, ListOptions, PutOptions, SetAlarmOptions,
    Storage, StorageOperations, SyncTransaction, Transaction,
};
pub use tracker::{ActiveRequest, RequestHooks, RequestTracker};
