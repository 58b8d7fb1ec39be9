use crate::entities::Metric;
use std::collections::BTreeMap;

/// Fields that decide which observation of a `(run, key)` pair is the latest one.
///
/// Implementors must report the *stored* value, i.e. after [`sanitize_value`], so that
/// comparisons made before and after a write agree.
pub trait MetricOrdering {
    fn metric_key(&self) -> &str;
    fn ordering_key(&self) -> (i64, i64, f64);
}

impl MetricOrdering for Metric {
    fn metric_key(&self) -> &str {
        &self.key
    }

    fn ordering_key(&self) -> (i64, i64, f64) {
        (self.step, self.timestamp, sanitize_value(self.value).0)
    }
}

/// Maps a client value onto something the database can hold.
///
/// NaN becomes `0.0` (flagged so it can be read back as NaN), infinities clamp to the
/// largest finite magnitudes.
pub fn sanitize_value(value: f64) -> (f64, bool) {
    if value.is_nan() {
        (0.0, true)
    } else if value == f64::INFINITY {
        (f64::MAX, false)
    } else if value == f64::NEG_INFINITY {
        (f64::MIN, false)
    } else {
        (value, false)
    }
}

/// Returns true when `a` should replace `b`: higher step, then later timestamp, then larger value.
pub fn supersedes(a: &impl MetricOrdering, b: &impl MetricOrdering) -> bool {
    let (a_step, a_timestamp, a_value) = a.ordering_key();
    let (b_step, b_timestamp, b_value) = b.ordering_key();

    a_step > b_step
        || (a_step == b_step && a_timestamp > b_timestamp)
        || (a_step == b_step && a_timestamp == b_timestamp && a_value > b_value)
}

/// Picks one winner per key. On an exact tie the earlier candidate is kept.
pub fn select_latest<T: MetricOrdering>(candidates: &[T]) -> BTreeMap<&str, &T> {
    let mut winners: BTreeMap<&str, &T> = BTreeMap::new();
    for candidate in candidates {
        match winners.get(candidate.metric_key()) {
            Some(current) if !supersedes(candidate, *current) => {}
            _ => {
                winners.insert(candidate.metric_key(), candidate);
            }
        }
    }
    winners
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(step: i64, timestamp: i64, value: f64) -> Metric {
        Metric::new("loss", value, timestamp, step)
    }

    #[test]
    fn step_outranks_timestamp_and_value() {
        let batch = vec![point(1, 10, 1.0), point(1, 10, 5.0), point(2, 5, 0.0)];
        let winners = select_latest(&batch);
        let winner = winners.get("loss").expect("winner");
        assert_eq!(winner.ordering_key(), (2, 5, 0.0));
    }

    #[test]
    fn timestamp_breaks_equal_steps() {
        let batch = vec![point(1, 10, 1.0), point(1, 20, 0.0)];
        let winners = select_latest(&batch);
        assert_eq!(winners["loss"].ordering_key(), (1, 20, 0.0));
    }

    #[test]
    fn value_breaks_equal_step_and_timestamp() {
        assert!(supersedes(&point(1, 10, 2.0), &point(1, 10, 1.0)));
        assert!(!supersedes(&point(1, 10, 1.0), &point(1, 10, 1.0)));
        assert!(!supersedes(&point(0, 99, 9.0), &point(1, 0, 0.0)));
    }

    #[test]
    fn winners_are_tracked_per_key() {
        let batch = vec![
            Metric::new("acc", 0.5, 1, 1),
            Metric::new("loss", 0.9, 1, 1),
            Metric::new("acc", 0.7, 2, 1),
        ];
        let winners = select_latest(&batch);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners["acc"].value, 0.7);
        assert_eq!(winners["loss"].value, 0.9);
    }

    #[test]
    fn non_finite_values_are_clamped() {
        assert_eq!(sanitize_value(f64::NAN), (0.0, true));
        assert_eq!(sanitize_value(f64::INFINITY), (f64::MAX, false));
        assert_eq!(sanitize_value(f64::NEG_INFINITY), (f64::MIN, false));
        assert_eq!(sanitize_value(-3.5), (-3.5, false));
    }

    #[test]
    fn ordering_compares_sanitized_values() {
        // +inf is stored as f64::MAX, so a logged f64::MAX does not supersede it.
        assert!(!supersedes(&point(0, 0, f64::MAX), &point(0, 0, f64::INFINITY)));
        assert!(supersedes(&point(0, 0, 0.5), &point(0, 0, f64::NAN)));
    }
}
