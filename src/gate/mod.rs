//! Ordering primitives around an actor's execution turns.

pub mod input;
pub mod output;

pub use input::{InputGate, InputGateLock};
pub use output::{OutputGate, OutputGateLock};

use crate::error::ActorError;
use crate::observer::ActorObserver;
use std::sync::Arc;

/// Identity of one exclusive section on an input gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub(crate) u64);

#[derive(Clone)]
pub struct GatePair {
    pub input: Arc<InputGate>,
    pub output: Arc<OutputGate>,
}

impl GatePair {
    pub fn new(observer: Arc<dyn ActorObserver>) -> Self {
        Self {
            input: InputGate::new(Arc::clone(&observer)),
            output: OutputGate::new(observer),
        }
    }

    /// Releases every waiter on both gates with `err`.
    pub fn break_all(&self, err: ActorError) {
        self.input.break_gate(err.clone());
        self.output.break_gate(err);
    }
}
