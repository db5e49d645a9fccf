//! Context-window threshold tracking.
//!
//! The worker reports remaining-context percentage on `/claude-state`. The
//! controller records one `context_warning` per 10% bucket crossed
//! *downward*, starting from an initial threshold of 70% (the first warning
//! fires when remaining drops to 60% or below). Compactions and resets
//! restart the ladder.

/// Given the last threshold and the freshly reported remaining percentage,
/// return the new threshold if a 10% boundary was crossed downward.
///
/// A drop spanning several buckets advances the threshold to the lowest
/// crossed bucket and still yields a single warning.
pub(crate) fn crossed_threshold(last_threshold: f64, remaining: f64) -> Option<f64> {
    let mut threshold = last_threshold;
    let mut crossed = false;
    while threshold > 0.0 && remaining <= threshold - 10.0 {
        threshold -= 10.0;
        crossed = true;
    }
    crossed.then_some(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_warning_at_sixty_percent_remaining() {
        assert_eq!(crossed_threshold(70.0, 62.0), None);
        assert_eq!(crossed_threshold(70.0, 60.0), Some(60.0));
        assert_eq!(crossed_threshold(70.0, 58.0), Some(60.0));
    }

    #[test]
    fn no_repeat_within_the_same_bucket() {
        // 62 -> 58 fired and moved the threshold to 60.
        assert_eq!(crossed_threshold(60.0, 55.0), None);
        // 48 crosses the next boundary.
        assert_eq!(crossed_threshold(60.0, 48.0), Some(50.0));
    }

    #[test]
    fn multi_bucket_drop_fires_once_at_lowest_bucket() {
        assert_eq!(crossed_threshold(70.0, 35.0), Some(40.0));
        // The next poll at the same level stays quiet.
        assert_eq!(crossed_threshold(40.0, 35.0), None);
    }

    #[test]
    fn upward_movement_never_fires() {
        assert_eq!(crossed_threshold(60.0, 75.0), None);
    }

    #[test]
    fn ladder_bottoms_out_at_zero() {
        assert_eq!(crossed_threshold(10.0, 0.0), Some(0.0));
        assert_eq!(crossed_threshold(0.0, 0.0), None);
    }
}
