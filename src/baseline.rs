//! Reference values the detector compares lines against.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::types::Topic;

/// subject → category → baseline value, per topic.
pub trait BaselineLookup: Send + Sync {
    fn baseline(&self, topic: Topic, player: &str, category: &str) -> Option<f64>;
}

/// Baselines loaded once from a JSON document shaped
/// `{"nba": {"Player Name": {"Points": 25.5}}}`.
#[derive(Debug, Default, Clone)]
pub struct StaticBaselines {
    // keyed by lowercased player name
    by_topic: HashMap<Topic, HashMap<String, HashMap<String, f64>>>,
}

#[derive(Deserialize)]
#[serde(transparent)]
struct RawBaselines(HashMap<String, HashMap<String, HashMap<String, f64>>>);

impl StaticBaselines {
    pub fn from_json(text: &str) -> Result<Self> {
        let RawBaselines(raw) = serde_json::from_str(text)?;
        let mut by_topic = HashMap::new();
        for (topic_name, players) in raw {
            let topic: Topic = topic_name.parse()?;
            let players: HashMap<String, HashMap<String, f64>> = players
                .into_iter()
                .map(|(name, cats)| (name.trim().to_lowercase(), cats))
                .collect();
            by_topic.insert(topic, players);
        }
        Ok(Self { by_topic })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let baselines = Self::from_json(&text)?;
        info!(path = %path.display(), players = baselines.player_count(), "baselines loaded");
        Ok(baselines)
    }

    pub fn player_count(&self) -> usize {
        self.by_topic.values().map(HashMap::len).sum()
    }
}

impl BaselineLookup for StaticBaselines {
    fn baseline(&self, topic: Topic, player: &str, category: &str) -> Option<f64> {
        self.by_topic
            .get(&topic)?
            .get(&player.trim().to_lowercase())?
            .get(category)
            .copied()
    }
}
