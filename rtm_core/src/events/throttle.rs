/// Decides whether a progress delta is large enough to emit.
///
/// Works on whole-percent floors: an update goes out when the floored
/// percentage moved by at least `interval_pct` since the last emitted value.
/// With `interval_pct == 0` every byte-count change is emitted. Updates with
/// an unknown total are skipped entirely.
#[derive(Debug, Clone, Copy)]
pub struct ProgressThrottle {
    interval_pct: f64,
}

impl ProgressThrottle {
    /// Default emission interval, in percent.
    pub const DEFAULT_INTERVAL: f64 = 1.0;

    pub fn new(interval_pct: f64) -> Self {
        Self {
            interval_pct: interval_pct.max(0.0),
        }
    }

    pub fn should_emit(&self, prev: u64, current: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        if self.interval_pct == 0.0 {
            return current != prev;
        }
        let before = (prev as f64 * 100.0 / total as f64).floor();
        let after = (current as f64 * 100.0 / total as f64).floor();
        (after - before).abs() >= self.interval_pct
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_on_whole_percent_steps() {
        let t = ProgressThrottle::new(1.0);
        assert!(!t.should_emit(0, 5, 1000)); // 0% -> 0%
        assert!(t.should_emit(0, 10, 1000)); // 0% -> 1%
        assert!(!t.should_emit(10, 19, 1000)); // 1% -> 1%
        assert!(t.should_emit(10, 20, 1000)); // 1% -> 2%
    }

    #[test]
    fn first_update_measures_from_zero() {
        let t = ProgressThrottle::new(1.0);
        assert!(t.should_emit(0, 10, 1000));
        assert!(t.should_emit(0, 1000, 1000));
    }

    #[test]
    fn coarse_interval_swallows_small_steps() {
        let t = ProgressThrottle::new(10.0);
        assert!(!t.should_emit(0, 99, 1000)); // 9%
        assert!(t.should_emit(0, 100, 1000)); // 10%
    }

    #[test]
    fn zero_interval_emits_on_every_change() {
        let t = ProgressThrottle::new(0.0);
        assert!(t.should_emit(0, 1, 1_000_000));
        assert!(!t.should_emit(1, 1, 1_000_000));
    }

    #[test]
    fn unknown_total_is_skipped() {
        let t = ProgressThrottle::new(0.0);
        assert!(!t.should_emit(0, 100, 0));
    }

    #[test]
    fn negative_interval_clamps_to_zero() {
        let t = ProgressThrottle::new(-5.0);
        assert!(t.should_emit(0, 1, 100));
    }
}
