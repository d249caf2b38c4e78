//! Protocol adapters between player intents and a node's REST surface.
//!
//! A [`Driver`] only *builds* requests and *parses* responses; the
//! [`Rest`](super::rest::Rest) client executes them through a transport.
//! Built-in adapters cover the Lavalink v3 and v4 REST APIs, selected by
//! [`DriverVersion`].

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use serenity::model::id::GuildId;
use std::{fmt, time::Duration};
use tracing::warn;

use crate::{
    audio::effects::Filters,
    error::NodeError,
    sources::{LoadType, SearchResult, Track},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverVersion {
    V3,
    V4,
}

impl DriverVersion {
    pub fn prefix(self) -> &'static str {
        match self {
            DriverVersion::V3 => "/v3",
            DriverVersion::V4 => "/v4",
        }
    }
}

/// Petición HTTP construida por un driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackUpdate {
    Encoded(String),
    /// Detiene el track actual en el nodo.
    Clear,
}

/// Datos de voz que el nodo necesita para unirse al canal.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceServer {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Actualización parcial de un player remoto; los campos `None` no se envían.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerUpdate {
    pub track: Option<TrackUpdate>,
    pub position: Option<u64>,
    pub end_time: Option<u64>,
    pub volume: Option<u16>,
    pub paused: Option<bool>,
    pub filters: Option<Filters>,
    pub voice: Option<VoiceServer>,
    pub no_replace: bool,
}

impl PlayerUpdate {
    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }

    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn position(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn clear_track() -> Self {
        Self {
            track: Some(TrackUpdate::Clear),
            ..Default::default()
        }
    }

    pub fn filters(filters: Filters) -> Self {
        Self {
            filters: Some(filters),
            ..Default::default()
        }
    }

    pub fn voice(voice: VoiceServer) -> Self {
        Self {
            voice: Some(voice),
            ..Default::default()
        }
    }
}

/// Adaptador versionado del protocolo de un nodo.
///
/// One method per remote operation a player may invoke. The adapter assigned
/// to a node never changes for the node's lifetime.
pub trait Driver: Send + Sync {
    /// Identificador usado en `NodeOptions::driver` (ej. `"lavalink/v4"`).
    fn id(&self) -> &str;

    fn version(&self) -> DriverVersion;

    fn update_player(&self, session_id: &str, guild_id: GuildId, update: &PlayerUpdate) -> RestRequest;

    fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> RestRequest;

    fn update_session(&self, session_id: &str, timeout: Duration) -> RestRequest;

    fn load_tracks(&self, identifier: &str) -> RestRequest;

    fn parse_load_result(&self, payload: Value) -> Result<SearchResult, NodeError>;
}

impl fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.id())
            .field("version", &self.version())
            .finish()
    }
}

fn player_path(version: DriverVersion, session_id: &str, guild_id: GuildId) -> String {
    format!("{}/sessions/{}/players/{}", version.prefix(), session_id, guild_id)
}

/// Campos comunes a v3 y v4; el track lo agrega cada driver.
fn common_update_body(update: &PlayerUpdate) -> Map<String, Value> {
    let mut body = Map::new();

    if let Some(position) = update.position {
        body.insert("position".into(), json!(position));
    }
    if let Some(end_time) = update.end_time {
        body.insert("endTime".into(), json!(end_time));
    }
    if let Some(volume) = update.volume {
        body.insert("volume".into(), json!(volume));
    }
    if let Some(paused) = update.paused {
        body.insert("paused".into(), json!(paused));
    }
    if let Some(filters) = &update.filters {
        body.insert("filters".into(), json!(filters));
    }
    if let Some(voice) = &update.voice {
        body.insert(
            "voice".into(),
            json!({
                "token": voice.token,
                "endpoint": voice.endpoint,
                "sessionId": voice.session_id,
            }),
        );
    }

    body
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lavalink4Driver;

impl Driver for Lavalink4Driver {
    fn id(&self) -> &str {
        "lavalink/v4"
    }

    fn version(&self) -> DriverVersion {
        DriverVersion::V4
    }

    fn update_player(&self, session_id: &str, guild_id: GuildId, update: &PlayerUpdate) -> RestRequest {
        let mut body = common_update_body(update);
        match &update.track {
            Some(TrackUpdate::Encoded(encoded)) => {
                body.insert("track".into(), json!({ "encoded": encoded }));
            }
            Some(TrackUpdate::Clear) => {
                body.insert("track".into(), json!({ "encoded": null }));
            }
            None => {}
        }

        RestRequest::new(Method::PATCH, player_path(self.version(), session_id, guild_id))
            .query("noReplace", update.no_replace)
            .body(Value::Object(body))
    }

    fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> RestRequest {
        RestRequest::new(Method::DELETE, player_path(self.version(), session_id, guild_id))
    }

    fn update_session(&self, session_id: &str, timeout: Duration) -> RestRequest {
        RestRequest::new(Method::PATCH, format!("/v4/sessions/{}", session_id)).body(json!({
            "resuming": true,
            "timeout": timeout.as_secs(),
        }))
    }

    fn load_tracks(&self, identifier: &str) -> RestRequest {
        RestRequest::new(Method::GET, "/v4/loadtracks".to_string()).query("identifier", identifier)
    }

    fn parse_load_result(&self, payload: Value) -> Result<SearchResult, NodeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            load_type: String,
            #[serde(default)]
            data: Value,
        }

        #[derive(Deserialize)]
        struct Playlist {
            info: PlaylistInfo,
            tracks: Vec<Track>,
        }

        #[derive(Deserialize)]
        struct PlaylistInfo {
            name: String,
        }

        let raw: Raw = serde_json::from_value(payload)?;
        let result = match raw.load_type.as_str() {
            "track" => SearchResult {
                load_type: LoadType::Track,
                playlist_name: None,
                tracks: vec![serde_json::from_value(raw.data)?],
            },
            "playlist" => {
                let playlist: Playlist = serde_json::from_value(raw.data)?;
                SearchResult {
                    load_type: LoadType::Playlist,
                    playlist_name: Some(playlist.info.name),
                    tracks: playlist.tracks,
                }
            }
            "search" => SearchResult {
                load_type: LoadType::Search,
                playlist_name: None,
                tracks: serde_json::from_value(raw.data)?,
            },
            "error" => {
                warn!("❌ Error al cargar track: {}", raw.data["message"]);
                SearchResult {
                    load_type: LoadType::Error,
                    ..SearchResult::empty()
                }
            }
            _ => SearchResult::empty(),
        };

        Ok(result)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lavalink3Driver;

impl Driver for Lavalink3Driver {
    fn id(&self) -> &str {
        "lavalink/v3"
    }

    fn version(&self) -> DriverVersion {
        DriverVersion::V3
    }

    fn update_player(&self, session_id: &str, guild_id: GuildId, update: &PlayerUpdate) -> RestRequest {
        let mut body = common_update_body(update);
        match &update.track {
            Some(TrackUpdate::Encoded(encoded)) => {
                body.insert("encodedTrack".into(), json!(encoded));
            }
            Some(TrackUpdate::Clear) => {
                body.insert("encodedTrack".into(), Value::Null);
            }
            None => {}
        }

        RestRequest::new(Method::PATCH, player_path(self.version(), session_id, guild_id))
            .query("noReplace", update.no_replace)
            .body(Value::Object(body))
    }

    fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> RestRequest {
        RestRequest::new(Method::DELETE, player_path(self.version(), session_id, guild_id))
    }

    fn update_session(&self, session_id: &str, timeout: Duration) -> RestRequest {
        RestRequest::new(Method::PATCH, format!("/v3/sessions/{}", session_id)).body(json!({
            "resumingKey": session_id,
            "timeout": timeout.as_secs(),
        }))
    }

    fn load_tracks(&self, identifier: &str) -> RestRequest {
        RestRequest::new(Method::GET, "/v3/loadtracks".to_string()).query("identifier", identifier)
    }

    fn parse_load_result(&self, payload: Value) -> Result<SearchResult, NodeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            load_type: String,
            #[serde(default)]
            playlist_info: Option<PlaylistInfo>,
            #[serde(default)]
            tracks: Vec<Track>,
            #[serde(default)]
            exception: Option<Value>,
        }

        #[derive(Deserialize)]
        struct PlaylistInfo {
            name: Option<String>,
        }

        let raw: Raw = serde_json::from_value(payload)?;
        let load_type = match raw.load_type.as_str() {
            "TRACK_LOADED" => LoadType::Track,
            "PLAYLIST_LOADED" => LoadType::Playlist,
            "SEARCH_RESULT" => LoadType::Search,
            "LOAD_FAILED" => {
                warn!("❌ Error al cargar track: {:?}", raw.exception);
                LoadType::Error
            }
            _ => LoadType::Empty,
        };

        Ok(SearchResult {
            load_type,
            playlist_name: raw
                .playlist_info
                .and_then(|info| info.name)
                .filter(|_| load_type == LoadType::Playlist),
            tracks: raw.tracks,
        })
    }
}
