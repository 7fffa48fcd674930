use crate::cache::WriteConfirmation;
use crate::error::ActorError;
use crate::observer::ActorObserver;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct OutputWaiter {
    barrier: u64,
    tx: oneshot::Sender<Result<(), ActorError>>,
}

#[derive(Default)]
struct OutputState {
    next_lock: u64,
    pending: BTreeSet<u64>,
    waiters: VecDeque<OutputWaiter>,
    broken: Option<ActorError>,
}

/// Holds back delivery of results until the writes issued before them are confirmed.
///
/// Each unconfirmed write takes a numbered lock. A waiter registered after lock
/// `n` was taken is released once every lock up to `n` has been released, so
/// waiters drain in the order their writes were confirmed.
pub struct OutputGate {
    state: Mutex<OutputState>,
    observer: Arc<dyn ActorObserver>,
}

/// One outstanding write on an [`OutputGate`]. Released on drop.
pub struct OutputGateLock {
    gate: Arc<OutputGate>,
    id: u64,
}

impl OutputGate {
    pub fn new(observer: Arc<dyn ActorObserver>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OutputState::default()),
            observer,
        })
    }

    pub fn lock(self: &Arc<Self>) -> Result<OutputGateLock, ActorError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.broken {
            return Err(err.clone());
        }
        state.next_lock += 1;
        let id = state.next_lock;
        if state.pending.is_empty() {
            self.observer.output_gate_locked();
            debug!(lock = id, "output gate locked");
        }
        state.pending.insert(id);
        Ok(OutputGateLock {
            gate: Arc::clone(self),
            id,
        })
    }

    /// Keeps the gate locked until `confirmation` resolves. A failed confirmation breaks the gate.
    pub fn lock_while(self: &Arc<Self>, confirmation: WriteConfirmation) -> Result<(), ActorError> {
        if confirmation.is_confirmed() {
            return Ok(());
        }
        let lock = self.lock()?;
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            match confirmation.wait().await {
                Ok(()) => drop(lock),
                Err(err) => {
                    warn!(error = %err, "write confirmation failed, breaking output gate");
                    gate.break_gate(err);
                    drop(lock);
                }
            }
        });
        Ok(())
    }

    /// Resolves once every lock taken before this call has been released.
    pub async fn wait(&self) -> Result<(), ActorError> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(err) = &state.broken {
                return Err(err.clone());
            }
            let barrier = state.next_lock;
            if !blocks(&state.pending, barrier) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(OutputWaiter { barrier, tx });
            self.observer.output_gate_waiter_added();
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(ActorError::aborted("output gate discarded")))
    }

    pub fn is_locked(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub fn pending_locks(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken.is_some()
    }

    pub fn break_gate(&self, err: ActorError) {
        let waiters = {
            let mut state = self.state.lock();
            if state.broken.is_some() {
                return;
            }
            state.broken = Some(err.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            self.observer.output_gate_waiter_removed();
            let _ = waiter.tx.send(Err(err.clone()));
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if !state.pending.remove(&id) {
            return;
        }
        if state.pending.is_empty() {
            self.observer.output_gate_released();
            debug!(lock = id, "output gate released");
        }
        while let Some(front) = state.waiters.front() {
            if blocks(&state.pending, front.barrier) {
                break;
            }
            if let Some(waiter) = state.waiters.pop_front() {
                self.observer.output_gate_waiter_removed();
                let _ = waiter.tx.send(Ok(()));
            }
        }
    }
}

fn blocks(pending: &BTreeSet<u64>, barrier: u64) -> bool {
    pending.first().is_some_and(|oldest| *oldest <= barrier)
}

impl Drop for OutputGateLock {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}
