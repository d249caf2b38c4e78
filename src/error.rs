use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Errores de la capa de sesiones.
///
/// Every precondition failure is raised synchronously at the call that
/// violates it and leaves the player's previous state untouched.
#[derive(Debug, Error)]
pub enum OpenLinkError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("plugin '{0}' does not carry a valid identity marker")]
    PluginType(String),

    #[error("player for guild {0} has been destroyed")]
    DestroyedPlayer(GuildId),

    #[error("player for guild {0} has no current track")]
    NoCurrentTrack(GuildId),

    #[error("current track '{0}' is not seekable")]
    NotSeekable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no resolver registered for search engine '{0}'")]
    NoResolver(String),

    #[error("no connected node available")]
    NoNodeAvailable,

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("voice connection for guild {guild_id} timed out after {timeout:?}")]
    VoiceConnectionTimeout { guild_id: GuildId, timeout: Duration },

    #[error("voice connection error: {0}")]
    Voice(String),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Errores del transporte hacia un nodo de audio.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node '{0}' has no session yet")]
    NoSession(String),

    #[error("node answered {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid node url: {0}")]
    Url(#[from] url::ParseError),

    #[error("could not decode node payload: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T, E = OpenLinkError> = std::result::Result<T, E>;
