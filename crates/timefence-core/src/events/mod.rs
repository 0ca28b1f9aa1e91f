//! Event surface the keeper exposes to its adapters.
//!
//! Subscribers register callbacks once at startup; callbacks are invoked
//! synchronously on whichever thread performed the triggering operation
//! (the caller's thread for `initialize`, the heartbeat thread for
//! periodic saves). No unsubscription is supported.

use serde::{Deserialize, Serialize};

/// Emitted at most once per keeper instance, at the moment the locked
/// state is entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperDetected {
    /// Monotonic time elapsed since the prior persist, clamped to zero.
    pub mono_elapsed_ms: u64,

    /// Wall-clock time elapsed since the prior persist. Negative when the
    /// wall clock moved backwards.
    pub wall_elapsed_ms: i64,

    /// Absolute difference between the wall and monotonic elapsed times.
    pub discrepancy_ms: u64,

    /// Populated when the lock was triggered by an unreadable or
    /// unauthentic state blob rather than a clock discrepancy.
    pub corruption_cause: Option<String>,
}

impl TamperDetected {
    /// Event for a prior blob that failed decryption or parsing.
    #[must_use]
    pub fn corruption(cause: impl Into<String>) -> Self {
        Self {
            mono_elapsed_ms: 0,
            wall_elapsed_ms: 0,
            discrepancy_ms: 0,
            corruption_cause: Some(cause.into()),
        }
    }

    /// Event for a clock discrepancy beyond tolerance.
    #[must_use]
    pub const fn clock_jump(mono_elapsed_ms: u64, wall_elapsed_ms: i64, discrepancy_ms: u64) -> Self {
        Self {
            mono_elapsed_ms,
            wall_elapsed_ms,
            discrepancy_ms,
            corruption_cause: None,
        }
    }
}

/// Emitted after every successful persist performed by the heartbeat.
///
/// Persists performed by `initialize` or `dispose` do not emit this
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSaved {
    /// Milliseconds still owed at the moment of persist.
    pub remaining_ms: u64,

    /// Persist counter value that was written.
    pub heartbeat_count: u64,
}

/// Callback invoked when the locked state is entered.
pub type TamperCallback = Box<dyn Fn(&TamperDetected) + Send + Sync>;

/// Callback invoked after each successful heartbeat persist.
pub type HeartbeatCallback = Box<dyn Fn(&HeartbeatSaved) + Send + Sync>;

/// Registry of subscriber callbacks.
#[derive(Default)]
pub(crate) struct EventSubscribers {
    tamper: Vec<TamperCallback>,
    heartbeat: Vec<HeartbeatCallback>,
}

impl EventSubscribers {
    pub(crate) fn subscribe_tamper(&mut self, callback: TamperCallback) {
        self.tamper.push(callback);
    }

    pub(crate) fn subscribe_heartbeat(&mut self, callback: HeartbeatCallback) {
        self.heartbeat.push(callback);
    }

    pub(crate) fn notify_tamper(&self, event: &TamperDetected) {
        for callback in &self.tamper {
            callback(event);
        }
    }

    pub(crate) fn notify_heartbeat(&self, event: &HeartbeatSaved) {
        for callback in &self.heartbeat {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EventSubscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscribers")
            .field("tamper", &self.tamper.len())
            .field("heartbeat", &self.heartbeat.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_notify_reaches_all_subscribers() {
        let mut subscribers = EventSubscribers::default();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            subscribers.subscribe_tamper(Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        subscribers.notify_tamper(&TamperDetected::corruption("bad blob"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_corruption_event_shape() {
        let event = TamperDetected::corruption("authentication failed");
        assert_eq!(event.discrepancy_ms, 0);
        assert_eq!(
            event.corruption_cause.as_deref(),
            Some("authentication failed")
        );
    }

    #[test]
    fn test_clock_jump_event_shape() {
        let event = TamperDetected::clock_jump(1_000, -86_400_000, 86_401_000);
        assert!(event.corruption_cause.is_none());
        assert_eq!(event.wall_elapsed_ms, -86_400_000);
    }
}
