//! # Sources Module
//!
//! Track model and the resolver-plugin seam.
//!
//! Tracks are produced by a node (`loadtracks`) or by a source-resolver
//! plugin, and are stored in a player's queue until they are played.
//! Plugins are registered by the [`Core`](crate::core::Core) at startup;
//! resolver plugins additionally claim a search engine name so that
//! [`Core::search`](crate::core::Core::search) can dispatch to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    core::Core,
    error::{OpenLinkError, Result},
};

/// Motores de búsqueda incorporados: nombre → prefijo de búsqueda del nodo.
pub const SEARCH_ENGINES: &[(&str, &str)] = &[
    ("youtube", "ytsearch"),
    ("youtube_music", "ytmsearch"),
    ("soundcloud", "scsearch"),
];

/// Marca de identidad que todo plugin debe devolver en [`Plugin::marker`].
pub const PLUGIN_MARKER: &str = "open-link/plugin";

/// Metadatos de un track tal como los describe el nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duración en milisegundos.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

/// Track reproducible por un nodo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(alias = "track")]
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: serde_json::Value,
    #[serde(skip)]
    requester: Option<UserId>,
    #[serde(skip, default = "Utc::now")]
    added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(encoded: impl Into<String>, info: TrackInfo) -> Self {
        Self {
            encoded: encoded.into(),
            info,
            plugin_info: serde_json::Value::Null,
            requester: None,
            added_at: Utc::now(),
        }
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.length)
    }

    pub fn is_seekable(&self) -> bool {
        self.info.is_seekable && !self.info.is_stream
    }

    /// Posición registrada dentro del track, en ms.
    pub fn position(&self) -> u64 {
        self.info.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.info.position = position.min(self.info.length);
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn with_requester(mut self, requester: Option<UserId>) -> Self {
        self.requester = requester;
        self
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

/// Resultado normalizado de una búsqueda, independiente de la versión del nodo.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub load_type: LoadType,
    pub playlist_name: Option<String>,
    pub tracks: Vec<Track>,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self {
            load_type: LoadType::Empty,
            playlist_name: None,
            tracks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub(crate) fn with_requester(mut self, requester: Option<UserId>) -> Self {
        for track in &mut self.tracks {
            track.requester = requester;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Motor a usar; `None` usa el motor por defecto de la configuración.
    pub engine: Option<String>,
    pub requester: Option<UserId>,
    /// Nodo concreto para cargar; `None` deja elegir al resolvedor de nodos.
    pub node: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Generic,
    SourceResolver,
}

/// Fuente que declara un plugin resolvedor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    /// Nombre del motor que se registra (ej. `"spotify"`).
    pub source_name: String,
    /// Prefijo de búsqueda del backend (ej. `"spsearch"`).
    pub source_identify: String,
}

/// Plugin cargado por el [`Core`] durante la inicialización.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Debe devolver [`PLUGIN_MARKER`].
    fn marker(&self) -> Option<&str>;

    fn name(&self) -> String;

    fn kind(&self) -> PluginKind {
        PluginKind::Generic
    }

    /// Fuente declarada; obligatoria para [`PluginKind::SourceResolver`].
    fn source(&self) -> Option<SourceIdentity> {
        None
    }

    async fn load(&self, _core: Arc<Core>) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &str, _options: &SearchOptions) -> Result<SearchResult> {
        Err(OpenLinkError::NoResolver(self.name()))
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Verifica si la consulta es una URL cargable directamente.
pub fn is_url(query: &str) -> bool {
    url::Url::parse(query)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}
