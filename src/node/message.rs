use serde::{Deserialize, Deserializer};
use serde_json::Value;
use serenity::model::id::GuildId;

use crate::error::NodeError;

/// Mensajes que el nodo empuja por su canal de eventos.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeMessage {
    Ready { resumed: bool, session_id: String },
    PlayerUpdate { guild_id: GuildId, state: PlayerUpdateState },
    Stats(NodeStats),
    Event { guild_id: GuildId, event: TrackEvent },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PlayerUpdateState {
    pub time: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ping: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    #[serde(default)]
    pub memory: MemoryStats,
    #[serde(default)]
    pub cpu: CpuStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TrackEndReason {
    #[serde(rename = "finished", alias = "FINISHED")]
    Finished,
    #[serde(rename = "loadFailed", alias = "LOAD_FAILED")]
    LoadFailed,
    #[serde(rename = "stopped", alias = "STOPPED")]
    Stopped,
    #[serde(rename = "replaced", alias = "REPLACED")]
    Replaced,
    #[serde(rename = "cleanup", alias = "CLEANUP")]
    Cleanup,
}

impl TrackEndReason {
    /// Un track reemplazado o limpiado no avanza la cola.
    pub fn may_start_next(self) -> bool {
        !matches!(self, TrackEndReason::Replaced | TrackEndReason::Cleanup)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum TrackEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart {},
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        /// Track codificado que terminó, si el nodo lo informa.
        #[serde(rename = "track", default, deserialize_with = "encoded_track")]
        encoded: Option<String>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException { exception: TrackException },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        code: u16,
        reason: String,
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
}

/// v3 manda el track como string; v4 como objeto con `encoded`.
fn encoded_track<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = match Value::deserialize(deserializer)? {
        Value::String(encoded) => Some(encoded),
        Value::Object(track) => track.get("encoded").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    Ok(encoded)
}

fn guild_id(payload: &Value) -> Result<Option<GuildId>, NodeError> {
    let id = match &payload["guildId"] {
        Value::String(raw) => raw.parse::<u64>().ok(),
        Value::Number(raw) => raw.as_u64(),
        _ => None,
    };
    Ok(id.filter(|id| *id != 0).map(GuildId::new))
}

impl NodeMessage {
    /// Decodifica un mensaje crudo; `Ok(None)` para ops desconocidos o sin guild.
    pub fn parse(raw: &str) -> Result<Option<Self>, NodeError> {
        let payload: Value = serde_json::from_str(raw)?;

        let message = match payload["op"].as_str() {
            Some("ready") => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Ready {
                    #[serde(default)]
                    resumed: bool,
                    session_id: String,
                }
                let ready: Ready = serde_json::from_value(payload)?;
                Some(NodeMessage::Ready {
                    resumed: ready.resumed,
                    session_id: ready.session_id,
                })
            }
            Some("playerUpdate") => match guild_id(&payload)? {
                Some(guild_id) => Some(NodeMessage::PlayerUpdate {
                    guild_id,
                    state: serde_json::from_value(payload["state"].clone())?,
                }),
                None => None,
            },
            Some("stats") => Some(NodeMessage::Stats(serde_json::from_value(payload)?)),
            Some("event") => match guild_id(&payload)? {
                Some(guild_id) => Some(NodeMessage::Event {
                    guild_id,
                    event: serde_json::from_value(payload)?,
                }),
                None => None,
            },
            _ => None,
        };

        Ok(message)
    }
}
