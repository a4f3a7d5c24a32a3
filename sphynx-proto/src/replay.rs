//! Receive-side anti-replay tracking for one direction's IV counter. Kept as a small
//! ordered set of recently-seen IVs rather than a packed bitmap, the same tradeoff
//! `reorder.rs` makes for its buffers: a worker owns exactly one `Connexion`, so there's
//! no contention to optimize for, just a bounded memory footprint for the tolerance
//! window.

use std::collections::BTreeSet;

use crate::constants::IV_WINDOW;

pub struct ReplayWindow {
    highest: Option<u64>,
    seen: BTreeSet<u64>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self { highest: None, seen: BTreeSet::new() }
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Returns `true` and records `iv` if it's new and within tolerance; `false` (no
    /// state change) if it's a replay or too far behind the window to trust.
    pub fn accept(&mut self, iv: u64) -> bool {
        let highest = match self.highest {
            None => {
                self.highest = Some(iv);
                self.seen.insert(iv);
                return true;
            }
            Some(h) => h,
        };

        if iv > highest {
            self.highest = Some(iv);
            self.seen.insert(iv);
            let floor = iv.saturating_sub(IV_WINDOW as u64);
            self.seen.retain(|&v| v > floor);
            true
        } else {
            let floor = highest.saturating_sub(IV_WINDOW as u64);
            if iv <= floor || self.seen.contains(&iv) {
                false
            } else {
                self.seen.insert(iv);
                true
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ivs_all_accepted() {
        let mut w = ReplayWindow::new();
        for iv in 1..=10u64 {
            assert!(w.accept(iv));
        }
    }

    #[test]
    fn exact_replay_rejected() {
        let mut w = ReplayWindow::new();
        assert!(w.accept(5));
        assert!(!w.accept(5));
    }

    #[test]
    fn mild_reordering_within_window_accepted_once() {
        let mut w = ReplayWindow::new();
        assert!(w.accept(10));
        assert!(w.accept(8));
        assert!(!w.accept(8));
    }

    #[test]
    fn far_behind_window_rejected() {
        let mut w = ReplayWindow::new();
        assert!(w.accept(IV_WINDOW as u64 * 2));
        assert!(!w.accept(1));
    }
}
