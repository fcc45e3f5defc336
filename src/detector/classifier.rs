use chrono::Duration;

use crate::config::{confidence_ratios, cooldowns};
use crate::types::Confidence;

/// Tier a deviation by how many thresholds it spans.
/// Caller guarantees `threshold > 0`.
pub fn classify(abs_difference: f64, threshold: f64) -> Confidence {
    let ratio = abs_difference / threshold;
    if ratio >= confidence_ratios::HIGH_MIN {
        Confidence::High
    } else if ratio >= confidence_ratios::MEDIUM_MIN {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Minimum re-alert interval. Stronger signals re-fire sooner.
pub fn cooldown_for(confidence: Confidence) -> Duration {
    let secs = match confidence {
        Confidence::High => cooldowns::HIGH_SECS,
        Confidence::Medium => cooldowns::MEDIUM_SECS,
        Confidence::Low => cooldowns::LOW_SECS,
    };
    Duration::seconds(secs)
}
