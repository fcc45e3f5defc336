use crate::detector::classifier;
use crate::types::{Confidence, Direction};

/// Outcome of comparing one observed line against its baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueSignal {
    pub difference: f64,
    pub abs_difference: f64,
    pub direction: Direction,
    pub confidence: Confidence,
}

/// `None` when the line sits within `threshold` of the baseline.
/// A line below baseline favors the over.
pub fn detect_value(observed: f64, baseline: f64, threshold: f64) -> Option<ValueSignal> {
    if threshold.is_nan() || threshold <= 0.0 || !observed.is_finite() || !baseline.is_finite() {
        return None;
    }

    let difference = observed - baseline;
    let abs_difference = difference.abs();
    if abs_difference < threshold {
        return None;
    }

    let direction = if difference < 0.0 { Direction::Over } else { Direction::Under };

    Some(ValueSignal {
        difference,
        abs_difference,
        direction,
        confidence: classifier::classify(abs_difference, threshold),
    })
}
