use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct RunningAlarm {
    scheduled_ms: i64,
    /// A new alarm was set while the handler ran.
    requeued: bool,
}

/// Tracks the alarm handler currently running for an actor.
///
/// The stored alarm slot lives in the cache. This type only decides how
/// `get_alarm`, `set_alarm` and `delete_alarm` behave while that slot's alarm is
/// being delivered: the firing alarm reads as gone and deleting it is a no-op,
/// but an alarm set during the same invocation is real and may be deleted.
/// Writes are recorded only after they reach the cache, so a rolled-back or
/// failed set never keeps the fired alarm alive.
#[derive(Default)]
pub struct AlarmManager {
    running: Mutex<Option<RunningAlarm>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteAction {
    Skip,
    Apply,
}

impl AlarmManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn running(&self) -> Option<i64> {
        self.running.lock().map(|r| r.scheduled_ms)
    }

    /// Marks the alarm scheduled at `scheduled_ms` as being delivered.
    pub(crate) fn begin(self: &Arc<Self>, scheduled_ms: i64) -> AlarmRun {
        *self.running.lock() = Some(RunningAlarm {
            scheduled_ms,
            requeued: false,
        });
        debug!(scheduled_ms, "alarm handler started");
        AlarmRun {
            manager: Arc::clone(self),
            scheduled_ms,
            finished: false,
        }
    }

    /// Filters a stored alarm read during delivery. `pending_set` is true when
    /// the reading transaction has itself set an alarm that is not committed yet.
    pub(crate) fn visible(&self, stored: Option<i64>, pending_set: bool) -> Option<i64> {
        match *self.running.lock() {
            Some(RunningAlarm {
                requeued: false, ..
            }) if !pending_set => None,
            _ => stored,
        }
    }

    /// Decides whether a delete must reach the cache. A pending set in the
    /// same transaction is always deletable.
    pub(crate) fn delete_action(&self, pending_set: bool) -> DeleteAction {
        match *self.running.lock() {
            Some(RunningAlarm {
                requeued: false, ..
            }) if !pending_set => DeleteAction::Skip,
            _ => DeleteAction::Apply,
        }
    }

    /// Records an alarm write that reached the cache. Call only once the write
    /// has been applied (or its transaction committed).
    pub(crate) fn written(&self, scheduled_ms: Option<i64>) {
        if let Some(running) = self.running.lock().as_mut() {
            running.requeued = scheduled_ms.is_some();
        }
    }
}

/// One delivery of an alarm. Dropping it without [`AlarmRun::finish`] counts as a failure.
pub(crate) struct AlarmRun {
    manager: Arc<AlarmManager>,
    scheduled_ms: i64,
    finished: bool,
}

impl AlarmRun {
    /// Ends the delivery and reports whether the stored slot must be cleared.
    pub(crate) fn finish(mut self, succeeded: bool) -> bool {
        self.finished = true;
        let running = self.manager.running.lock().take();
        match running {
            Some(r) => {
                debug!(
                    scheduled_ms = r.scheduled_ms,
                    succeeded,
                    requeued = r.requeued,
                    "alarm handler finished"
                );
                succeeded && !r.requeued
            }
            None => false,
        }
    }
}

impl Drop for AlarmRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.manager.running.lock().take();
        debug!(scheduled_ms = self.scheduled_ms, "alarm handler abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::{AlarmManager, DeleteAction};

    #[test]
    fn firing_alarm_reads_as_absent_and_cannot_be_deleted() {
        let alarms = AlarmManager::new();
        let run = alarms.begin(500);
        assert_eq!(alarms.visible(Some(500), false), None);
        assert_eq!(alarms.delete_action(false), DeleteAction::Skip);
        assert!(run.finish(true), "slot cleared after success");
        assert_eq!(alarms.running(), None);
    }

    #[test]
    fn alarm_written_during_handler_is_deletable() {
        let alarms = AlarmManager::new();
        let run = alarms.begin(500);
        alarms.written(Some(550));
        assert_eq!(alarms.visible(Some(550), false), Some(550));
        assert_eq!(alarms.delete_action(false), DeleteAction::Apply);
        alarms.written(None);
        assert_eq!(alarms.delete_action(false), DeleteAction::Skip);
        assert!(run.finish(true));
    }

    #[test]
    fn uncommitted_set_is_visible_only_to_its_transaction() {
        let alarms = AlarmManager::new();
        let run = alarms.begin(500);
        assert_eq!(alarms.visible(Some(900), true), Some(900));
        assert_eq!(alarms.delete_action(true), DeleteAction::Apply);
        assert_eq!(alarms.visible(Some(500), false), None);
        assert!(run.finish(true), "nothing was written, slot is cleared");
    }

    #[test]
    fn requeued_alarm_survives_completion() {
        let alarms = AlarmManager::new();
        let run = alarms.begin(500);
        alarms.written(Some(900));
        assert!(!run.finish(true));
    }

    #[test]
    fn failed_or_abandoned_run_keeps_slot() {
        let alarms = AlarmManager::new();
        assert!(!alarms.begin(500).finish(false));
        drop(alarms.begin(500));
        assert_eq!(alarms.running(), None);
        assert_eq!(alarms.delete_action(false), DeleteAction::Apply);
    }
}
