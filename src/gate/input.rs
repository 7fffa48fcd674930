use crate::error::ActorError;
use crate::gate::SectionId;
use crate::observer::ActorObserver;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

enum WaiterKind {
    Turn,
    Exclusive(SectionId),
}

struct Waiter {
    kind: WaiterKind,
    tx: oneshot::Sender<Result<(), ActorError>>,
}

#[derive(Default)]
struct InputState {
    holder: Option<SectionId>,
    waiters: VecDeque<Waiter>,
    next_section: u64,
    broken: Option<ActorError>,
}

/// Admission control for new units of work.
///
/// A turn passes straight through while the gate is open and nobody is queued.
/// An exclusive section holds the gate until its [`InputGateLock`] drops; work
/// arriving meanwhile queues and is released strictly in arrival order.
pub struct InputGate {
    state: Mutex<InputState>,
    observer: Arc<dyn ActorObserver>,
}

/// Exclusive hold on an [`InputGate`]. Released on drop.
pub struct InputGateLock {
    gate: Arc<InputGate>,
    section: SectionId,
}

impl InputGate {
    pub fn new(observer: Arc<dyn ActorObserver>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(InputState::default()),
            observer,
        })
    }

    /// Waits until a new turn may start.
    pub async fn wait(&self) -> Result<(), ActorError> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(err) = &state.broken {
                return Err(err.clone());
            }
            if state.holder.is_none() && state.waiters.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                kind: WaiterKind::Turn,
                tx,
            });
            self.observer.input_gate_waiter_added();
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(ActorError::aborted("input gate discarded")))
    }

    /// Takes the gate exclusively, queueing behind earlier arrivals.
    pub async fn lock(self: &Arc<Self>) -> Result<InputGateLock, ActorError> {
        let (guard, rx) = {
            let mut state = self.state.lock();
            if let Some(err) = &state.broken {
                return Err(err.clone());
            }
            state.next_section += 1;
            let section = SectionId(state.next_section);
            let guard = InputGateLock {
                gate: Arc::clone(self),
                section,
            };
            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(section);
                self.observer.input_gate_locked();
                debug!(section = section.0, "input gate locked");
                return Ok(guard);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                kind: WaiterKind::Exclusive(section),
                tx,
            });
            self.observer.input_gate_waiter_added();
            (guard, rx)
        };
        // If this future is dropped while queued, `guard` drops with it and withdraws the waiter.
        match rx.await {
            Ok(Ok(())) => Ok(guard),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ActorError::aborted("input gate discarded")),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn locked_by(&self) -> Option<SectionId> {
        self.state.lock().holder
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken.is_some()
    }

    /// Fails every queued waiter with `err`; later arrivals fail the same way.
    pub fn break_gate(&self, err: ActorError) {
        let waiters = {
            let mut state = self.state.lock();
            if state.broken.is_some() {
                return;
            }
            state.broken = Some(err.clone());
            state.holder = None;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            self.observer.input_gate_waiter_removed();
            let _ = waiter.tx.send(Err(err.clone()));
        }
    }

    fn release(&self, section: SectionId) {
        let mut state = self.state.lock();
        if state.holder != Some(section) {
            // Never granted: withdraw the queued request instead.
            let before = state.waiters.len();
            state
                .waiters
                .retain(|w| !matches!(w.kind, WaiterKind::Exclusive(id) if id == section));
            if state.waiters.len() != before {
                self.observer.input_gate_waiter_removed();
            }
            if state.holder.is_none() {
                self.drain(&mut state);
            }
            return;
        }
        state.holder = None;
        self.observer.input_gate_released();
        debug!(section = section.0, "input gate released");
        self.drain(&mut state);
    }

    fn drain(&self, state: &mut InputState) {
        if state.broken.is_some() {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            self.observer.input_gate_waiter_removed();
            match waiter.kind {
                WaiterKind::Turn => {
                    let _ = waiter.tx.send(Ok(()));
                }
                WaiterKind::Exclusive(section) => {
                    if waiter.tx.send(Ok(())).is_ok() {
                        state.holder = Some(section);
                        self.observer.input_gate_locked();
                        debug!(section = section.0, "input gate locked");
                        return;
                    }
                }
            }
        }
    }
}

impl InputGateLock {
    pub fn section(&self) -> SectionId {
        self.section
    }
}

impl Drop for InputGateLock {
    fn drop(&mut self) {
        self.gate.release(self.section);
    }
}
