//! HF-credit gate — a single process-wide instant suppressing the
//! `free-hf` tier when HuggingFace credits are known to be exhausted.
//!
//! Modeled as a single atomic timestamp rather than a mutex-protected
//! singleton: the value is monotonically updated by at most one path
//! (a 429/quota response from the `hf` upstream) and read on every plan.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_BLOCK_SECS: i64 = 24 * 60 * 60;

/// Process-wide gate. `0` means "not blocked".
pub struct HfGate {
    blocked_until_unix: AtomicI64,
}

impl HfGate {
    pub fn new() -> Self {
        HfGate {
            blocked_until_unix: AtomicI64::new(0),
        }
    }

    /// Suppress the `free-hf` tier for `duration`, starting now.
    pub fn mark_hf_credits_exhausted(&self, duration: std::time::Duration) {
        let until = now_unix() + duration.as_secs() as i64;
        self.blocked_until_unix.store(until, Ordering::Relaxed);
    }

    /// Convenience: suppress for the default 24h window.
    pub fn mark_hf_credits_exhausted_default(&self) {
        self.mark_hf_credits_exhausted(std::time::Duration::from_secs(DEFAULT_BLOCK_SECS as u64));
    }

    /// True while `now < blocked_until`.
    pub fn is_active(&self) -> bool {
        now_unix() < self.blocked_until_unix.load(Ordering::Relaxed)
    }
}

impl Default for HfGate {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn gate_starts_inactive() {
        let gate = HfGate::new();
        assert!(!gate.is_active());
    }

    #[test]
    fn gate_becomes_active_after_marking() {
        let gate = HfGate::new();
        gate.mark_hf_credits_exhausted(Duration::from_secs(3600));
        assert!(gate.is_active());
    }

    #[test]
    fn gate_is_inactive_once_duration_is_zero() {
        let gate = HfGate::new();
        gate.mark_hf_credits_exhausted(Duration::from_secs(0));
        assert!(!gate.is_active());
    }
}
