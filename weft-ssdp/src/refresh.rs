//! Encapsulating the SSDP retransmit process
//!
//! Notifications and searches are unreliable datagrams, so they are
//! re-sent: every 15 minutes or so, a few repeated salvos about a second
//! apart. The gaps are jittered (from a caller-supplied seed, so tests
//! stay deterministic) to avoid synchronised network congestion.

use std::time::{Duration, Instant};

const SALVO_COUNT: u8 = 4;
const LONG_GAP_MS: u64 = 800_000;
const SHORT_GAP_MS: u64 = 1_000;

/// Tracks when the next retransmit salvo is due
pub struct RefreshTimer {
    seed: u32,
    next_salvo: Instant,
    phase: u8,
}

impl RefreshTimer {
    /// Create a new `RefreshTimer`; the first salvo is due immediately
    #[must_use]
    pub fn new(seed: u32, now: Instant) -> Self {
        Self {
            seed,
            next_salvo: now,
            phase: 0,
        }
    }

    /// Start over (e.g. the network went away and came back)
    pub fn reset(&mut self, now: Instant) {
        self.next_salvo = now;
        self.phase = 0;
    }

    /// When the next salvo is due
    #[must_use]
    pub fn next_salvo(&self) -> Instant {
        self.next_salvo
    }

    /// Account for a salvo being sent now
    ///
    /// A no-op unless the salvo was actually due, so calling on a stray
    /// wakeup is harmless.
    pub fn update(&mut self, now: Instant) {
        if now < self.next_salvo {
            return;
        }
        // jitter 0-2550ms, a different byte of the seed each phase
        let jitter = u64::from((self.seed >> (self.phase * 8)) & 255) * 10;
        let gap = if self.phase == 0 {
            LONG_GAP_MS
        } else {
            SHORT_GAP_MS
        } + jitter;
        self.next_salvo += Duration::from_millis(gap);
        self.phase = (self.phase + 1) % SALVO_COUNT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_salvo_due_immediately() {
        let now = Instant::now();
        let t = RefreshTimer::new(0, now);
        assert_eq!(t.next_salvo(), now);
    }

    #[test]
    fn one_long_gap_then_three_short() {
        let mut now = Instant::now();
        let mut t = RefreshTimer::new(0x0102_0304, now);

        t.update(now);
        let gap = t.next_salvo() - now;
        assert!(gap > Duration::from_secs(780) && gap < Duration::from_secs(820));
        now += gap;

        for _ in 0..3 {
            t.update(now);
            let gap = t.next_salvo() - now;
            assert!(gap < Duration::from_secs(20));
            now += gap;
        }

        // back to the long gap
        t.update(now);
        let gap = t.next_salvo() - now;
        assert!(gap > Duration::from_secs(780) && gap < Duration::from_secs(820));
    }

    #[test]
    fn early_update_is_ignored() {
        let now = Instant::now();
        let mut t = RefreshTimer::new(0, now);
        t.update(now);
        let due = t.next_salvo();
        t.update(now); // not due yet
        assert_eq!(t.next_salvo(), due);
    }

    #[test]
    fn reset_makes_salvo_due() {
        let now = Instant::now();
        let mut t = RefreshTimer::new(0, now);
        t.update(now);
        assert_ne!(t.next_salvo(), now);
        t.reset(now);
        assert_eq!(t.next_salvo(), now);
    }
}
