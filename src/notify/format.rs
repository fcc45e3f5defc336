use serde::Serialize;

use crate::types::{Confidence, Direction, ValueAlert};

/// Alerts named individually in a multi-alert body.
const BODY_MAX_ITEMS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub icon: &'static str,
    pub badge: &'static str,
    pub tag: &'static str,
    pub data: PushData,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushData {
    pub url: &'static str,
    pub alerts: Vec<ValueAlert>,
    pub count: usize,
}

pub fn push_payload(batch: Vec<ValueAlert>) -> PushPayload {
    PushPayload {
        title: title(&batch),
        body: body(&batch),
        icon: "/icon-192.png",
        badge: "/badge-72.png",
        tag: "value-alerts",
        data: PushData { url: "/", count: batch.len(), alerts: batch },
    }
}

pub fn title(batch: &[ValueAlert]) -> String {
    if let [a] = batch {
        return format!("Value Alert: {} {}", a.player, a.category);
    }
    match batch.iter().filter(|a| a.confidence == Confidence::High).count() {
        0 => format!("{} Value Alerts", batch.len()),
        high => format!("{} Value Alerts ({high} High Confidence)", batch.len()),
    }
}

pub fn body(batch: &[ValueAlert]) -> String {
    if let [a] = batch {
        let side = match a.direction {
            Direction::Over => "OVER",
            Direction::Under => "UNDER",
        };
        return format!(
            "{side} {:.1} (avg {:.1}, diff {:.1}). Best: {:+.0} @ {}",
            a.line, a.average, a.abs_difference, a.best_price, a.bookmaker
        );
    }

    let mut body = batch
        .iter()
        .take(BODY_MAX_ITEMS)
        .map(|a| {
            let side = match a.direction {
                Direction::Over => 'O',
                Direction::Under => 'U',
            };
            format!("{} {} {:.1} ({side})", a.player, a.category, a.line)
        })
        .collect::<Vec<_>>()
        .join(" | ");

    if batch.len() > BODY_MAX_ITEMS {
        body.push_str(&format!(" +{} more", batch.len() - BODY_MAX_ITEMS));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::format::fixtures::alert;

    #[test]
    fn single_alert_is_verbatim() {
        let a = alert("Player 1", "Points", 22.5, 25.5, Confidence::Medium);
        assert_eq!(title(std::slice::from_ref(&a)), "Value Alert: Player 1 Points");
        assert_eq!(
            body(std::slice::from_ref(&a)),
            "OVER 22.5 (avg 25.5, diff 3.0). Best: -110 @ DraftKings"
        );
    }

    #[test]
    fn large_batch_lists_three_then_overflow() {
        let batch = vec![
            alert("Player 1", "Points", 20.5, 25.5, Confidence::High),
            alert("Player 2", "Rebounds", 9.5, 7.5, Confidence::Low),
            alert("Player 3", "Assists", 4.5, 6.0, Confidence::Medium),
            alert("Player 4", "Threes", 1.5, 2.5, Confidence::High),
            alert("Player 5", "Points", 30.5, 27.0, Confidence::Low),
        ];
        assert_eq!(title(&batch), "5 Value Alerts (2 High Confidence)");
        assert_eq!(
            body(&batch),
            "Player 1 Points 20.5 (O) | Player 2 Rebounds 9.5 (U) | Player 3 Assists 4.5 (O) +2 more"
        );

        let payload = push_payload(batch);
        assert_eq!(payload.data.count, 5);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tag"], "value-alerts");
        assert_eq!(json["data"]["alerts"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn batch_without_high_confidence_has_plain_title() {
        let batch = vec![
            alert("Player 1", "Points", 22.5, 25.5, Confidence::Medium),
            alert("Player 2", "Rebounds", 9.5, 7.5, Confidence::Low),
        ];
        assert_eq!(title(&batch), "2 Value Alerts");
    }
}
