use crate::error::ActorError;

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Runtime configuration shared by every actor in a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorConfig {
    pub max_keys_per_op: usize,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
    /// How far back `get_bookmark_for_time` may reach.
    pub bookmark_retention_ms: u64,
    pub max_transaction_sync_depth: u32,
    /// Bypass caching and concurrency gating on every storage call.
    pub direct_io: bool,
    /// Flush the cache when a turn's code completes, before its result is delivered.
    pub flush_on_turn_end: bool,
    pub eviction_idle_ms: u64,
    /// Granularity of read/write billing units reported to the observer.
    pub storage_unit_bytes: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            max_keys_per_op: 128,
            max_key_bytes: 2048,
            max_value_bytes: 128 * 1024,
            bookmark_retention_ms: 30 * DAY_MS,
            max_transaction_sync_depth: 16,
            direct_io: false,
            flush_on_turn_end: true,
            eviction_idle_ms: 10_000,
            storage_unit_bytes: 4096,
        }
    }
}

impl ActorConfig {
    /// Short eviction window for local iteration and tests.
    pub fn development() -> Self {
        Self {
            eviction_idle_ms: 100,
            ..Self::default()
        }
    }

    /// Profile for storage backends that serve every read directly and have no cache to bypass.
    pub fn direct_io() -> Self {
        Self {
            direct_io: true,
            ..Self::default()
        }
    }

    pub fn with_eviction_idle_ms(mut self, ms: u64) -> Self {
        self.eviction_idle_ms = ms;
        self
    }

    pub fn with_bookmark_retention_ms(mut self, ms: u64) -> Self {
        self.bookmark_retention_ms = ms;
        self
    }

    pub fn with_flush_on_turn_end(mut self, enabled: bool) -> Self {
        self.flush_on_turn_end = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ActorError> {
        if self.max_keys_per_op == 0 {
            return Err(invalid("max_keys_per_op must be > 0"));
        }
        if self.max_key_bytes == 0 {
            return Err(invalid("max_key_bytes must be > 0"));
        }
        if self.max_value_bytes == 0 {
            return Err(invalid("max_value_bytes must be > 0"));
        }
        if self.max_transaction_sync_depth == 0 {
            return Err(invalid("max_transaction_sync_depth must be > 0"));
        }
        if self.storage_unit_bytes == 0 {
            return Err(invalid("storage_unit_bytes must be > 0"));
        }
        if i64::try_from(self.bookmark_retention_ms).is_err() {
            return Err(invalid("bookmark_retention_ms does not fit in i64"));
        }
        Ok(())
    }

    /// Billing units for a payload of `bytes`, rounded up with a minimum of one.
    pub fn storage_units(&self, bytes: usize) -> u32 {
        let units = bytes.div_ceil(self.storage_unit_bytes).max(1);
        u32::try_from(units).unwrap_or(u32::MAX)
    }
}

fn invalid(message: &str) -> ActorError {
    ActorError::InvalidConfig {
        message: message.into(),
    }
}
