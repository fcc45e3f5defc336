use std::cmp::Ordering;

use sha2::{Digest, Sha256};

use crate::types::{Game, Outcome};

/// SHA-256 hex digest of a snapshot, normalized so that ordering and
/// bookmaker update timestamps never change the result.
pub fn fingerprint(games: &[Game]) -> String {
    let mut games = games.to_vec();
    games.sort_by(|a, b| a.id.cmp(&b.id));
    for game in &mut games {
        game.bookmakers.sort_by(|a, b| a.key.cmp(&b.key));
        for book in &mut game.bookmakers {
            book.last_update = None;
            book.markets.sort_by(|a, b| a.key.cmp(&b.key));
            for market in &mut book.markets {
                market.outcomes.sort_by(cmp_outcome);
            }
        }
    }

    // plain structs and strings, serialization cannot fail
    let bytes = serde_json::to_vec(&games).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

fn cmp_outcome(a: &Outcome, b: &Outcome) -> Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| {
            let pa = a.point.unwrap_or(f64::NEG_INFINITY);
            let pb = b.point.unwrap_or(f64::NEG_INFINITY);
            pa.total_cmp(&pb)
        })
}
