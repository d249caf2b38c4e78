//! Boundary with the chat-platform gateway.
//!
//! The connector owns the raw gateway and voice sockets as well as the node
//! event sockets. It reports back to the [`Core`] it was bound to through
//! [`Core::handle_node_message`], [`Core::handle_voice_state`] and
//! [`Core::handle_voice_server`].

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::{Arc, Weak};

use crate::{core::Core, error::Result, node::NodeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Datos de `VOICE_SERVER_UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdate {
    pub token: String,
    pub endpoint: String,
}

/// Parámetros para unirse a un canal de voz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceJoin {
    pub guild_id: GuildId,
    pub voice_id: ChannelId,
    pub text_id: ChannelId,
    pub shard_id: u32,
    pub mute: bool,
    pub deaf: bool,
    /// Volumen inicial que reemplaza al de la configuración.
    pub volume: Option<u16>,
}

/// Conexión de voz de un guild.
#[async_trait]
pub trait VoiceHandle: Send + Sync {
    fn guild_id(&self) -> GuildId;
    fn voice_id(&self) -> Option<ChannelId>;
    fn text_id(&self) -> ChannelId;
    fn shard_id(&self) -> u32;
    fn mute(&self) -> bool;
    fn deaf(&self) -> bool;
    fn volume(&self) -> Option<u16>;
    fn state(&self) -> VoiceConnectionState;
    fn server_update(&self) -> Option<ServerUpdate>;
    fn session_id(&self) -> Option<String>;

    async fn disconnect(&self) -> Result<()>;

    /// Envía un voice state update con los flags indicados.
    async fn send_voice_update(&self, mute: bool, deaf: bool) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn bind_owner(&self, owner: Weak<Core>);

    /// Abre los canales de eventos de los nodos.
    async fn listen(&self, nodes: &[NodeOptions]) -> Result<()>;

    async fn join(&self, options: VoiceJoin) -> Result<Arc<dyn VoiceHandle>>;
}
