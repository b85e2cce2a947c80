use chrono::{DateTime, Duration, Utc};

/// Debounce gate that converts a noisy desired value into a stable one by
/// enforcing minimum dwell times.
///
/// Pure state machine: callers pass `now` explicitly, the gate never reads
/// a clock. A flip out of ON requires `min_on` elapsed since the last flip,
/// a flip out of OFF requires `min_off`. The very first call after
/// construction or [`reset`](Self::reset) adopts the desired value
/// unconditionally and starts the dwell clock there.
#[derive(Debug, Clone)]
pub struct HysteresisGate {
    min_on: Duration,
    min_off: Duration,
    state: bool,
    last_flip: Option<DateTime<Utc>>,
}

impl HysteresisGate {
    /// Negative dwell times are clamped to zero.
    pub fn new(min_on: Duration, min_off: Duration) -> Self {
        Self {
            min_on: min_on.max(Duration::zero()),
            min_off: min_off.max(Duration::zero()),
            state: false,
            last_flip: None,
        }
    }

    pub fn current(&self) -> bool {
        self.state
    }

    /// Feed the desired value; returns the (possibly unchanged) stable value.
    ///
    /// A rejected flip is dropped, not queued: the caller is expected to
    /// re-derive the desired value on its next cycle.
    pub fn update(&mut self, desired: bool, now: DateTime<Utc>) -> bool {
        let Some(last_flip) = self.last_flip else {
            // Bootstrap: snap to the desired value and start the clock.
            self.state = desired;
            self.last_flip = Some(now);
            return self.state;
        };

        if desired == self.state {
            return self.state;
        }

        let dwell = if self.state { self.min_on } else { self.min_off };
        if now - last_flip >= dwell {
            self.state = desired;
            self.last_flip = Some(now);
        }

        self.state
    }

    /// Force the state and clear the dwell clock so that the next `update`
    /// is treated as a fresh bootstrap. Used after manual toggles and when
    /// an override expires.
    pub fn reset(&mut self, initial: bool) {
        self.state = initial;
        self.last_flip = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn gate(min_on_s: i64, min_off_s: i64) -> HysteresisGate {
        HysteresisGate::new(Duration::seconds(min_on_s), Duration::seconds(min_off_s))
    }

    #[test]
    fn first_call_adopts_desired_regardless_of_dwell() {
        let mut g = gate(600, 600);
        assert!(g.update(true, t(0)));
        assert!(g.current());
    }

    #[test]
    fn flip_rejected_before_dwell_elapses() {
        let mut g = gate(300, 60);
        g.update(true, t(0));
        // min_on is 300s; attempts to drop out earlier are ignored.
        assert!(g.update(false, t(100)));
        assert!(g.update(false, t(299)));
        assert!(!g.update(false, t(300)));
    }

    #[test]
    fn dwell_is_chosen_by_state_being_exited() {
        let mut g = gate(60, 300);
        g.update(false, t(0));
        // Leaving OFF needs min_off (300s).
        assert!(!g.update(true, t(100)));
        assert!(g.update(true, t(300)));
        // Leaving ON needs min_on (60s), counted from the last flip.
        assert!(g.update(false, t(330)));
        assert!(!g.update(false, t(360)));
    }

    #[test]
    fn equal_desired_is_a_noop_and_keeps_the_clock() {
        let mut g = gate(0, 300);
        g.update(false, t(0));
        g.update(false, t(290));
        // The no-op at 290 must not have restarted the dwell clock.
        assert!(g.update(true, t(300)));
    }

    #[test]
    fn reset_restores_bootstrap_semantics() {
        let mut g = gate(600, 600);
        g.update(true, t(0));
        g.reset(true);
        // Immediately after reset any flip is accepted, at any time.
        assert!(!g.update(false, t(1)));
    }

    #[test]
    fn negative_dwell_clamps_to_zero() {
        let mut g = HysteresisGate::new(Duration::seconds(-5), Duration::seconds(-5));
        g.update(true, t(0));
        assert!(!g.update(false, t(0)));
        assert!(g.update(true, t(0)));
    }
}
