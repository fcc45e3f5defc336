use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Game, Topic, ValueAlert};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Server → client frame. Tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    OddsUpdate {
        topic: Topic,
        payload: Vec<Game>,
        timestamp: DateTime<Utc>,
    },
    Status {
        payload: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        payload: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    ValueAlert {
        payload: ValueAlert,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn odds_update(topic: Topic, games: Vec<Game>) -> Self {
        ServerMessage::OddsUpdate { topic, payload: games, timestamp: Utc::now() }
    }

    pub fn status(text: impl Into<String>) -> Self {
        ServerMessage::Status { payload: text.into(), timestamp: Utc::now() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        ServerMessage::Error { payload: text.into(), timestamp: Utc::now() }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: Utc::now() }
    }

    pub fn value_alert(alert: ValueAlert) -> Self {
        ServerMessage::ValueAlert { payload: alert, timestamp: Utc::now() }
    }

    /// Serialized form. Serializing these shapes cannot fail in practice;
    /// a failure degrades to an error frame rather than a panic.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!("server message serialization failed: {e}");
            r#"{"type":"error","payload":"internal serialization error"}"#.to_string()
        })
    }
}

/// Raw client frame. `topic` also accepts the legacy `sport` key.
#[derive(Debug, Deserialize)]
struct RawClientMsg {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "sport")]
    topic: Option<String>,
}

/// Parsed client → server control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(Topic),
    /// `None` drops whatever topic the client holds.
    Unsubscribe(Option<Topic>),
    Ping,
}

/// Parse one inbound text frame. The error string is sent back verbatim.
pub fn parse_client_message(text: &str) -> Result<ClientCommand, String> {
    let raw: RawClientMsg = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            let n = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
            if n <= 10 || n % 100 == 0 {
                warn!(total_failures = n, "client message parse failed: {e}");
            }
            return Err("invalid message format".to_string());
        }
    };

    match raw.kind.as_str() {
        "subscribe" => {
            let Some(name) = raw.topic else {
                return Err("subscribe requires a topic: use 'nba' or 'nfl'".to_string());
            };
            name.parse::<Topic>()
                .map(ClientCommand::Subscribe)
                .map_err(|_| format!("invalid topic '{name}': use 'nba' or 'nfl'"))
        }
        "unsubscribe" => match raw.topic {
            None => Ok(ClientCommand::Unsubscribe(None)),
            Some(name) => name
                .parse::<Topic>()
                .map(|t| ClientCommand::Unsubscribe(Some(t)))
                .map_err(|_| format!("invalid topic '{name}': use 'nba' or 'nfl'")),
        },
        "ping" => Ok(ClientCommand::Ping),
        other => Err(format!("unknown message type '{other}'")),
    }
}
