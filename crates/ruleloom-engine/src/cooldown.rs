//! Per-subject cooldown ledger
//!
//! One ledger is shared by the whole engine. Entries are created the first
//! time a `(subject, key)` pair is checked and dropped when the subject's
//! session ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::time::{Clock, SystemClock};

/// Last-use timestamps keyed by subject id, then by cooldown key
pub struct CooldownLedger {
    entries: Mutex<HashMap<String, HashMap<String, u64>>>,
    clock: Arc<dyn Clock>,
}

impl CooldownLedger {
    /// Create a ledger backed by the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a ledger backed by a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Check whether `key` was used by `subject_id` less than `window` ago.
    ///
    /// A pair that is not in cooldown is marked as used now. A pair that is
    /// in cooldown keeps its original timestamp, so repeated checks never
    /// extend the window. The clock is read under the same lock that guards
    /// the update, so a recorded timestamp never moves backwards.
    pub fn is_in_cooldown(&self, subject_id: &str, key: &str, window: Duration) -> bool {
        let window = window.as_millis() as u64;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_millis();
        let keys = entries.entry(subject_id.to_string()).or_default();

        match keys.get_mut(key) {
            Some(last) if now.saturating_sub(*last) < window => {
                debug!(
                    target: "cooldown",
                    "{} is cooling down on '{}' ({}ms left)",
                    subject_id,
                    key,
                    window - now.saturating_sub(*last)
                );
                true
            }
            Some(last) => {
                *last = now;
                false
            }
            None => {
                keys.insert(key.to_string(), now);
                false
            }
        }
    }

    /// Milliseconds left on a cooldown without recording a use
    pub fn remaining(&self, subject_id: &str, key: &str, window: Duration) -> Duration {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries
            .get(subject_id)
            .and_then(|keys| keys.get(key))
            .map(|last| {
                let elapsed = now.saturating_sub(*last);
                Duration::from_millis((window.as_millis() as u64).saturating_sub(elapsed))
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Drop every entry of a subject whose session ended
    pub fn end_session(&self, subject_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(subject_id).map(|keys| keys.len()).unwrap_or(0);

        if removed > 0 {
            debug!(target: "cooldown", "Pruned {} cooldown(s) for {}", removed, subject_id);
        }

        removed
    }

    /// Number of subjects with at least one entry
    pub fn subject_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self::new()
    }
}
