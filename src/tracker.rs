use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Callbacks fired on idle/active edges of a [`RequestTracker`].
pub trait RequestHooks: Send + Sync {
    fn active(&self);
    fn inactive(&self);
}

struct TrackerState {
    active_requests: usize,
    hooks: Option<Weak<dyn RequestHooks>>,
}

/// Counts the requests associated with one actor.
///
/// The tracker only holds a weak reference to its hooks. The hook owner calls
/// [`RequestTracker::shutdown`] before it is dropped so that requests finishing
/// afterwards move the counter silently.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

/// Token for one live request. Dropping it releases the request.
pub struct ActiveRequest {
    parent: Arc<RequestTracker>,
}

impl RequestTracker {
    pub fn new(hooks: Weak<dyn RequestHooks>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                active_requests: 0,
                hooks: Some(hooks),
            }),
        })
    }

    /// A tracker that only counts.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                active_requests: 0,
                hooks: None,
            }),
        })
    }

    pub fn start_request(self: &Arc<Self>) -> ActiveRequest {
        let mut state = self.state.lock();
        state.active_requests += 1;
        if state.active_requests == 1 {
            fire(&state.hooks, |hooks| hooks.active());
        }
        drop(state);
        ActiveRequest {
            parent: Arc::clone(self),
        }
    }

    pub fn active_requests(&self) -> usize {
        self.state.lock().active_requests
    }

    pub fn shutdown(&self) {
        self.state.lock().hooks = None;
    }

    fn end_request(&self) {
        let mut state = self.state.lock();
        state.active_requests = state.active_requests.saturating_sub(1);
        if state.active_requests == 0 {
            fire(&state.hooks, |hooks| hooks.inactive());
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.parent.end_request();
    }
}

impl std::fmt::Debug for ActiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("active_requests", &self.parent.active_requests())
            .finish()
    }
}

// Hooks run under the tracker lock so that edges are delivered in the order they happen.
// A hook must not start or finish requests on the same tracker.
fn fire(hooks: &Option<Weak<dyn RequestHooks>>, call: impl FnOnce(&dyn RequestHooks)) {
    let Some(hooks) = hooks.as_ref().and_then(Weak::upgrade) else {
        return;
    };
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(hooks.as_ref()))).is_err() {
        warn!("request hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestHooks, RequestTracker};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        active: AtomicUsize,
        inactive: AtomicUsize,
    }

    impl RequestHooks for CountingHooks {
        fn active(&self) {
            self.active.fetch_add(1, Ordering::SeqCst);
        }

        fn inactive(&self) {
            self.inactive.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracker_with_hooks() -> (Arc<RequestTracker>, Arc<CountingHooks>) {
        let hooks = Arc::new(CountingHooks::default());
        let weak: std::sync::Weak<CountingHooks> = Arc::downgrade(&hooks);
        (RequestTracker::new(weak), hooks)
    }

    #[test]
    fn hooks_fire_on_edges_only() {
        let (tracker, hooks) = tracker_with_hooks();
        let a = tracker.start_request();
        assert_eq!(hooks.active.load(Ordering::SeqCst), 1);
        let b = tracker.start_request();
        drop(a);
        assert_eq!(hooks.inactive.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(hooks.active.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.inactive.load(Ordering::SeqCst), 1);

        let _c = tracker.start_request();
        assert_eq!(hooks.active.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_silences_hooks() {
        let (tracker, hooks) = tracker_with_hooks();
        let request = tracker.start_request();
        tracker.shutdown();
        drop(request);
        assert_eq!(hooks.inactive.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.active_requests(), 0);
    }

    #[test]
    fn request_outlives_tracker_owner_and_dropped_hooks() {
        let (tracker, hooks) = tracker_with_hooks();
        let request = tracker.start_request();
        drop(tracker);
        drop(hooks);
        drop(request);
    }

    #[test]
    fn panicking_hook_does_not_poison_tracker() {
        struct Exploding;
        impl RequestHooks for Exploding {
            fn active(&self) {
                panic!("boom");
            }
            fn inactive(&self) {}
        }
        let hooks = Arc::new(Exploding);
        let weak: std::sync::Weak<Exploding> = Arc::downgrade(&hooks);
        let tracker = RequestTracker::new(weak);
        let request = tracker.start_request();
        assert_eq!(tracker.active_requests(), 1);
        drop(request);
        assert_eq!(tracker.active_requests(), 0);
    }

    proptest! {
        #[test]
        fn overlapping_requests_produce_one_edge_pair(
            n in 1usize..64,
            release_order in prop::collection::vec(any::<usize>(), 64),
        ) {
            let (tracker, hooks) = tracker_with_hooks();
            let mut live: Vec<_> = (0..n).map(|_| tracker.start_request()).collect();
            for pick in release_order.iter().take(n) {
                let idx = pick % live.len();
                drop(live.swap_remove(idx));
            }
            drop(live);
            prop_assert_eq!(hooks.active.load(Ordering::SeqCst), 1);
            prop_assert_eq!(hooks.inactive.load(Ordering::SeqCst), 1);
            prop_assert_eq!(tracker.active_requests(), 0);
        }
    }
}
