use crate::types::{Direction, ValueAlert};

/// One-line summary, e.g. `Player 1 over Points 22.5 (avg 25.5 ↓3.0)`.
pub fn format_alert(alert: &ValueAlert) -> String {
    let arrow = match alert.direction {
        Direction::Over => '↓',
        Direction::Under => '↑',
    };
    format!(
        "{} {} {} {:.1} (avg {:.1} {}{:.1})",
        alert.player, alert.direction, alert.category, alert.line, alert.average, arrow, alert.abs_difference
    )
}
