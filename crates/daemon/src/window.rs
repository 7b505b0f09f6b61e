//! Replay-protection sliding window over per-session message counters.
//!
//! Each established session tracks the last `length` counters it accepted
//! in a ring of bits. `check` is a read-only admissibility probe used
//! before any expensive work; `update` is the authoritative admission and
//! must only run after the datagram has authenticated. Counters are
//! monotonic on the sender but arrive reordered, so the window admits
//! late packets as long as their slot has not been reused.

use std::sync::Arc;

use log::debug;

use crate::metrics::Metrics;

/// Default number of counters tracked per session.
pub const DEFAULT_WINDOW: u64 = 1024;

pub struct ReplayWindow {
    length: u64,
    /// Highest admitted counter. Zero until the first admission.
    current: u64,
    bits: Vec<bool>,
    /// Counter zero is admissible exactly once, during the first window.
    first_seen: bool,
    metrics: Arc<Metrics>,
}

impl ReplayWindow {
    pub fn new(length: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            length,
            current: 0,
            bits: vec![false; length as usize],
            first_seen: false,
            metrics,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    fn bit(&self, counter: u64) -> bool {
        self.bits[(counter % self.length) as usize]
    }

    fn set_bit(&mut self, counter: u64, value: bool) {
        let slot = (counter % self.length) as usize;
        self.bits[slot] = value;
    }

    /// Read-only admissibility test.
    ///
    /// Safe to call on unauthenticated input; a pass here is advisory and
    /// `update` remains the authoritative admission.
    pub fn check(&self, counter: u64) -> bool {
        // Ahead of the window, or the one-shot zero during the first window.
        if counter > self.current
            || (counter == 0 && !self.first_seen && self.current < self.length)
        {
            return true;
        }

        // Within the live window: admissible if the slot is still empty.
        if self.current >= self.length && counter > self.current - self.length {
            return !self.bit(counter);
        }

        // The window has not shifted yet; every slot below length is live.
        if self.current < self.length && counter < self.length {
            return !self.bit(counter);
        }

        debug!(
            "rejected a packet in check, current {} incoming {}",
            self.current, counter
        );
        false
    }

    /// Commit an admission. Mutates state; call only after the datagram
    /// has passed AEAD verification.
    pub fn update(&mut self, counter: u64) -> bool {
        // The next expected counter: advance one slot.
        if counter == self.current + 1 {
            // Once past the first window, an empty slot being reused means
            // its previous generation never arrived.
            if counter > self.length && !self.bit(counter) {
                self.metrics.inc_lost(1);
            }
            self.set_bit(counter, true);
            self.current = counter;
            return true;
        }

        // Ahead of current but within one window: the slots in between may
        // still arrive later, so clear them before the window slides over.
        if counter > self.current && counter < self.current + self.length {
            for n in (self.current + 1)..counter {
                self.set_bit(n, false);
            }
            self.set_bit(counter, true);
            self.current = counter;
            return true;
        }

        // Jumped past the entire window: everything in flight is gone.
        if counter >= self.current + self.length {
            // The slots still inside the old window are not counted here;
            // their loss surfaces when (if) they arrive out of window.
            let mut lost = counter.saturating_sub(self.current + self.length);
            if self.current == 0 {
                // Streams start at counter 1; the absent packet 0 is a loss
                // nothing else accounts for.
                lost += 1;
            }
            for slot in self.bits.iter_mut() {
                *slot = false;
            }
            self.metrics.inc_lost(lost);
            debug!(
                "receive window shifting, current {} incoming {} lost {}",
                self.current, counter, lost
            );
            self.set_bit(counter, true);
            self.current = counter;
            return true;
        }

        // The one-shot zero: admitted without advancing current.
        if counter == 0 && !self.first_seen && self.current < self.length {
            self.first_seen = true;
            self.set_bit(0, true);
            return true;
        }

        // At or behind current but still inside the window: a late arrival.
        // This must come after the zero case above or a first-seen zero with
        // a non-trivial current would land here as a duplicate.
        if ((self.current >= self.length && counter > self.current - self.length)
            || (self.current < self.length && counter < self.length))
            && counter <= self.current
        {
            if counter == self.current || self.bit(counter) {
                debug!(
                    "rejected duplicate, current {} incoming {}",
                    self.current, counter
                );
                self.metrics.inc_duplicate();
                return false;
            }

            self.set_bit(counter, true);
            return true;
        }

        self.metrics.inc_out_of_window();
        debug!(
            "rejected out of window packet, current {} incoming {}",
            self.current, counter
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn window(length: u64) -> (ReplayWindow, Arc<Metrics>) {
        let metrics = Metrics::new();
        (ReplayWindow::new(length, Arc::clone(&metrics)), metrics)
    }

    fn lost(m: &Metrics) -> u64 {
        m.packets_lost.load(Ordering::Relaxed)
    }

    fn dupes(m: &Metrics) -> u64 {
        m.packets_duplicate.load(Ordering::Relaxed)
    }

    fn out_of_window(m: &Metrics) -> u64 {
        m.packets_out_of_window.load(Ordering::Relaxed)
    }

    #[test]
    fn test_in_order_stream() {
        let (mut w, m) = window(16);

        for c in 1..=16 {
            assert!(w.check(c));
            assert!(w.update(c), "counter {} should admit", c);
        }

        assert_eq!(w.current(), 16);
        assert_eq!(lost(&m), 0);
        assert_eq!(dupes(&m), 0);
    }

    #[test]
    fn test_reorder_within_window() {
        let (mut w, m) = window(16);

        assert!(w.update(5));
        assert!(w.update(3));
        assert!(!w.update(5), "replayed 5 must reject");
        assert_eq!(dupes(&m), 1);
        assert!(w.update(4));
        assert_eq!(w.current(), 5);
    }

    #[test]
    fn test_gap_leaves_slots_open() {
        let (mut w, m) = window(16);

        assert!(w.update(1));
        assert!(w.update(10));
        assert_eq!(w.current(), 10);
        assert_eq!(dupes(&m), 0);

        // The skipped slots stay admissible until the window slides over.
        for c in 2..=9 {
            assert!(w.check(c), "counter {} should still be open", c);
        }

        assert!(w.update(7));
        assert_eq!(w.current(), 10, "late arrival must not advance current");
    }

    #[test]
    fn test_far_jump_accounts_loss() {
        let (mut w, m) = window(16);

        assert!(w.update(1));
        assert!(w.update(100));
        assert_eq!(w.current(), 100);
        assert_eq!(lost(&m), 83, "100 - 1 - 16 counters are unrecoverable");

        // The ring was wiped apart from the landing slot.
        for c in 85..100 {
            assert!(w.check(c), "counter {} should be open after the jump", c);
        }
        assert!(!w.check(100));
    }

    #[test]
    fn test_far_jump_from_zero_counts_the_missing_first_packet() {
        let (mut w, m) = window(16);

        assert!(w.update(100));
        assert_eq!(lost(&m), 100 - 16 + 1);
    }

    #[test]
    fn test_out_of_window_rejected() {
        let (mut w, m) = window(16);

        assert!(w.update(1));
        assert!(w.update(100));
        assert!(!w.check(50));
        assert!(!w.update(50));
        assert_eq!(out_of_window(&m), 1);
    }

    #[test]
    fn test_first_window_zero() {
        let (mut w, m) = window(128);

        assert!(w.check(0));
        assert!(w.update(0));
        assert_eq!(w.current(), 0, "the zero admission must not advance current");

        assert!(!w.check(0));
        assert!(!w.update(0));
        assert_eq!(dupes(&m), 1);
    }

    #[test]
    fn test_zero_after_progress_still_admits_once() {
        let (mut w, _m) = window(16);

        assert!(w.update(1));
        assert!(w.update(2));
        assert!(w.update(0), "zero is admissible while inside the first window");
        assert!(!w.update(0));
        assert_eq!(w.current(), 2);
    }

    #[test]
    fn test_current_is_monotonic() {
        let (mut w, _m) = window(16);
        let mut previous = 0;

        for c in [1u64, 5, 3, 2, 20, 18, 100, 99, 101] {
            w.update(c);
            assert!(w.current() >= previous);
            previous = w.current();
        }
    }

    #[test]
    fn test_no_counter_admits_twice() {
        let (mut w, _m) = window(16);
        let stream = [1u64, 3, 2, 2, 7, 3, 10, 7, 1];
        let mut admitted = std::collections::HashSet::new();

        for c in stream {
            if w.update(c) {
                assert!(admitted.insert(c), "counter {} admitted twice", c);
            }
        }
    }

    #[test]
    fn test_check_reject_implies_update_reject() {
        let (mut w, _m) = window(16);

        for c in [5u64, 3, 20, 40] {
            w.update(c);
        }

        for c in 0..=45 {
            if !w.check(c) {
                assert!(!w.update(c), "check rejected {} but update admitted", c);
            }
        }
    }

    #[test]
    fn test_freshness_gap() {
        let (mut w, _m) = window(16);

        assert!(w.update(1));
        assert!(w.update(50));
        // Anything at or below current - length is permanently gone.
        for c in 1..=(50 - 16) {
            assert!(!w.update(c), "counter {} is below the window", c);
        }
    }

    #[test]
    fn test_slot_reuse_after_generation_wrap() {
        let (mut w, m) = window(16);

        // Fill the first window completely, then advance one by one. Each
        // advance reuses a filled slot, so no loss is recorded.
        for c in 1..=32 {
            assert!(w.update(c));
        }
        assert_eq!(lost(&m), 0);

        // Skip one counter; when its slot comes around again the gap is
        // recorded as lost.
        assert!(w.update(34));
        for c in 35..=49 {
            assert!(w.update(c));
        }
        assert!(w.update(50));
        assert_eq!(lost(&m), 1);
    }
}
