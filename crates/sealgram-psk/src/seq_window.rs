//! Replay window for data record sequence numbers.
//!
//! Tracks the highest sequence number accepted so far and a 128-bit bitmap
//! of the numbers just below it. Anything older than the window, or already
//! marked, is a replay.

/// Sliding replay window. Not thread-safe; lives inside a peer session.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// Highest accepted sequence number, `None` before the first record.
    highest: Option<u64>,
    /// Bit `n` set means `highest - n` was accepted.
    seen: u128,
}

impl ReplayWindow {
    /// Number of sequence numbers tracked below the highest.
    pub const SIZE: u64 = 128;

    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seq` would be accepted. Does not record it.
    pub fn check(&self, seq: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if seq > highest {
            return true;
        }
        let offset = highest - seq;
        offset < Self::SIZE && self.seen & (1u128 << offset) == 0
    }

    /// Record `seq` as accepted. Call only after the record authenticated.
    pub fn mark(&mut self, seq: u64) {
        match self.highest {
            None => {
                self.highest = Some(seq);
                self.seen = 1;
            }
            Some(highest) if seq > highest => {
                let shift = seq - highest;
                self.seen = if shift >= Self::SIZE {
                    1
                } else {
                    (self.seen << shift) | 1
                };
                self.highest = Some(seq);
            }
            Some(highest) => {
                let offset = highest - seq;
                if offset < Self::SIZE {
                    self.seen |= 1u128 << offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(window: &mut ReplayWindow, seq: u64) -> bool {
        if !window.check(seq) {
            return false;
        }
        window.mark(seq);
        true
    }

    #[test]
    fn test_in_order() {
        let mut window = ReplayWindow::new();
        for seq in 0..300 {
            assert!(accept(&mut window, seq), "seq {seq} should be fresh");
        }
        assert!(!window.check(299));
        assert!(window.check(300));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 0));
        assert!(accept(&mut window, 1));
        assert!(!accept(&mut window, 0));
        assert!(!accept(&mut window, 1));
    }

    #[test]
    fn test_reordering_within_window() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 10));
        assert!(accept(&mut window, 7));
        assert!(accept(&mut window, 9));
        assert!(!accept(&mut window, 7));
        assert!(accept(&mut window, 8));
        assert!(!accept(&mut window, 10));
    }

    #[test]
    fn test_too_old() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 500));
        assert!(!window.check(500 - ReplayWindow::SIZE));
        assert!(window.check(500 - ReplayWindow::SIZE + 1));
    }

    #[test]
    fn test_large_jump_resets_bitmap() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 1));
        assert!(accept(&mut window, 10_000));
        assert!(!accept(&mut window, 1));
        assert!(accept(&mut window, 9_999));
    }

    #[test]
    fn test_check_is_pure() {
        let mut window = ReplayWindow::new();
        window.mark(3);
        assert!(window.check(4));
        assert!(window.check(4));
        window.mark(4);
        assert!(!window.check(4));
    }
}
