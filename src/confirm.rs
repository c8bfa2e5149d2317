//! Detection confirmation.
//!
//! Turns the raw per-frame detection set into the set of *confirmed*
//! violation classes. "sleeping" must be seen continuously for the debounce
//! interval before it counts; every other class counts on sight.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::detect::DetectionSet;
use crate::{elapsed_between, ClassSet, SLEEPING};

/// Filter state carried between sampled frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfirmationState {
    /// Set while "sleeping" has been present in every sampled frame since
    /// this instant. Cleared by the first sampled frame without it.
    pub sleep_started_at: Option<DateTime<Utc>>,
}

/// Output of one [`ConfirmationFilter::confirm`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Confirmation {
    pub confirmed: ClassSet,
    /// `Some(now)` when at least one class was confirmed on this call.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Confirmation {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ConfirmationFilter {
    sleep_debounce: Duration,
    state: ConfirmationState,
}

impl ConfirmationFilter {
    pub fn new(sleep_debounce: Duration) -> Self {
        Self {
            sleep_debounce,
            state: ConfirmationState::default(),
        }
    }

    pub fn state(&self) -> &ConfirmationState {
        &self.state
    }

    pub fn sleep_debounce(&self) -> Duration {
        self.sleep_debounce
    }

    /// Forget any running debounce timer.
    pub fn reset(&mut self) {
        self.state = ConfirmationState::default();
    }

    /// Confirm the classes of one sampled frame.
    ///
    /// The debounce boundary is inclusive: "sleeping" is confirmed on the
    /// first frame where `now - sleep_started_at >= sleep_debounce`.
    pub fn confirm(&mut self, now: DateTime<Utc>, raw: &DetectionSet) -> Confirmation {
        let mut out = Confirmation::default();

        if raw.contains(SLEEPING) {
            let started = *self.state.sleep_started_at.get_or_insert(now);
            if elapsed_between(started, now) >= self.sleep_debounce {
                out.confirmed.insert(SLEEPING.to_string());
                out.confirmed_at = Some(now);
            }
        } else {
            self.state.sleep_started_at = None;
        }

        for class in raw.classes().filter(|class| *class != SLEEPING) {
            out.confirmed.insert(class.to_string());
            out.confirmed_at = Some(now);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn raw(classes: &[&str]) -> DetectionSet {
        let mut set = DetectionSet::new();
        for class in classes {
            set.insert(*class, vec![Detection::new(0.1, 0.1, 0.2, 0.2, 0.8)]);
        }
        set
    }

    #[test]
    fn sleeping_confirms_at_debounce_not_before() {
        let mut filter = ConfirmationFilter::new(Duration::from_secs(10));
        for s in 0..10 {
            let out = filter.confirm(t(s), &raw(&["sleeping"]));
            assert!(out.is_empty(), "confirmed early at t={s}");
            assert_eq!(out.confirmed_at, None);
        }
        assert_eq!(filter.state().sleep_started_at, Some(t(0)));
        let out = filter.confirm(t(10), &raw(&["sleeping"]));
        assert!(out.confirmed.contains(SLEEPING));
        assert_eq!(out.confirmed_at, Some(t(10)));
    }

    #[test]
    fn single_gap_restarts_debounce() {
        let mut filter = ConfirmationFilter::new(Duration::from_secs(5));
        for s in 0..4 {
            filter.confirm(t(s), &raw(&["sleeping"]));
        }
        assert!(filter.confirm(t(4), &raw(&[])).is_empty());
        assert_eq!(filter.state().sleep_started_at, None);
        for s in 5..10 {
            assert!(filter.confirm(t(s), &raw(&["sleeping"])).is_empty());
        }
        assert!(!filter.confirm(t(10), &raw(&["sleeping"])).is_empty());
    }

    #[test]
    fn zero_debounce_confirms_immediately() {
        let mut filter = ConfirmationFilter::new(Duration::ZERO);
        let out = filter.confirm(t(0), &raw(&["sleeping"]));
        assert!(out.confirmed.contains(SLEEPING));
    }

    #[test]
    fn other_classes_confirm_on_sight() {
        let mut filter = ConfirmationFilter::new(Duration::from_secs(10));
        let out = filter.confirm(t(3), &raw(&["phone", "sleeping", "bottle"]));
        let expected: ClassSet = ["bottle", "phone"].iter().map(|c| c.to_string()).collect();
        assert_eq!(out.confirmed, expected);
        assert_eq!(out.confirmed_at, Some(t(3)));
        assert_eq!(filter.state().sleep_started_at, Some(t(3)));
    }

    #[test]
    fn empty_frame_confirms_nothing() {
        let mut filter = ConfirmationFilter::new(Duration::from_secs(10));
        let out = filter.confirm(t(0), &DetectionSet::new());
        assert!(out.is_empty());
        assert_eq!(out.confirmed_at, None);
    }
}
