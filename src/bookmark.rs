use crate::error::ActorError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque token naming a storage state. Tokens from one store order the same way
/// as the states they name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark(pub(crate) String);

impl Bookmark {
    pub fn new(token: impl Into<String>) -> Result<Self, ActorError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ActorError::InvalidBookmark("empty bookmark".into()));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Bookmark {
    type Err = ActorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Bounds how far back point-in-time bookmarks may reach.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetentionWindow {
    retention_ms: i64,
}

impl RetentionWindow {
    pub(crate) fn new(retention_ms: u64) -> Self {
        Self {
            retention_ms: i64::try_from(retention_ms).unwrap_or(i64::MAX),
        }
    }

    /// Returns the timestamp to look up. Future timestamps resolve to `now_ms`.
    pub(crate) fn resolve(&self, timestamp_ms: i64, now_ms: i64) -> Result<i64, ActorError> {
        let horizon_ms = now_ms.saturating_sub(self.retention_ms);
        if timestamp_ms < horizon_ms {
            return Err(ActorError::OutOfRetentionWindow {
                requested_ms: timestamp_ms,
                horizon_ms,
            });
        }
        Ok(timestamp_ms.min(now_ms))
    }
}
