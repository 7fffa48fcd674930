use crate::storage::ops::{OpName, ResolvedOptions};

/// Per-actor instrumentation points. Every method defaults to a no-op.
pub trait ActorObserver: Send + Sync {
    fn input_gate_locked(&self) {}
    fn input_gate_released(&self) {}
    fn input_gate_waiter_added(&self) {}
    fn input_gate_waiter_removed(&self) {}
    fn output_gate_locked(&self) {}
    fn output_gate_released(&self) {}
    fn output_gate_waiter_added(&self) {}
    fn output_gate_waiter_removed(&self) {}

    fn add_cached_storage_read_units(&self, _units: u32) {}
    fn add_uncached_storage_read_units(&self, _units: u32) {}
    fn add_storage_write_units(&self, _units: u32) {}
    fn add_storage_deletes(&self, _count: u32) {}

    /// Called once per storage call with the options after direct-I/O overrides.
    fn storage_operation(&self, _op: OpName, _options: &ResolvedOptions) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ActorObserver for NoopObserver {}
