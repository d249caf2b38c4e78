use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::player::Player;
use crate::{
    config::{CoreSettings, Structures},
    connector::{Connector, VoiceJoin},
    error::{OpenLinkError, Result},
    events::{CoreEvent, EventBus},
    node::NodeManager,
};

/// Parámetros para crear la sesión de un guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePlayerOptions {
    pub guild_id: GuildId,
    pub voice_id: ChannelId,
    pub text_id: ChannelId,
    pub shard_id: u32,
    pub mute: bool,
    pub deaf: bool,
    /// Reemplaza `default_volume` para esta sesión.
    pub volume: Option<u16>,
    /// Nodo concreto; `None` deja elegir al resolvedor.
    pub node: Option<String>,
}

impl CreatePlayerOptions {
    pub fn new(guild_id: GuildId, voice_id: ChannelId, text_id: ChannelId) -> Self {
        Self {
            guild_id,
            voice_id,
            text_id,
            shard_id: 0,
            mute: false,
            deaf: true,
            volume: None,
            node: None,
        }
    }

    pub fn shard(mut self, shard_id: u32) -> Self {
        self.shard_id = shard_id;
        self
    }

    pub fn volume(mut self, volume: u16) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Registro de sesiones: a lo sumo un player por guild.
pub struct PlayerManager {
    players: DashMap<GuildId, Arc<Player>>,
    guild_locks: DashMap<GuildId, Arc<Mutex<()>>>,
    connector: Arc<dyn Connector>,
    nodes: Arc<NodeManager>,
    settings: CoreSettings,
    structures: Structures,
    events: EventBus,
}

impl PlayerManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        nodes: Arc<NodeManager>,
        settings: CoreSettings,
        structures: Structures,
        events: EventBus,
    ) -> Self {
        Self {
            players: DashMap::new(),
            guild_locks: DashMap::new(),
            connector,
            nodes,
            settings,
            structures,
            events,
        }
    }

    /// Serializa creación y destrucción dentro de un mismo guild.
    pub(crate) async fn lock_guild(&self, guild_id: GuildId) -> OwnedMutexGuard<()> {
        let lock = self.guild_locks.entry(guild_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Libera el lock del guild si nadie lo tiene ni lo espera.
    pub(crate) fn release_guild(&self, guild_id: GuildId) {
        self.guild_locks
            .remove_if(&guild_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Devuelve la sesión existente o crea una nueva.
    pub async fn create(self: &Arc<Self>, options: CreatePlayerOptions) -> Result<Arc<Player>> {
        let guild_id = options.guild_id;
        let result = {
            let _guard = self.lock_guild(guild_id).await;
            self.create_locked(options).await
        };

        if result.is_err() {
            self.release_guild(guild_id);
        }
        result
    }

    async fn create_locked(self: &Arc<Self>, options: CreatePlayerOptions) -> Result<Arc<Player>> {
        let guild_id = options.guild_id;

        if let Some(existing) = self.get(guild_id) {
            debug!("Player ya existente para guild {}", guild_id);
            return Ok(existing);
        }

        let node = match &options.node {
            Some(name) => self
                .nodes
                .get(name)
                .ok_or_else(|| OpenLinkError::NodeNotFound(name.clone()))?,
            None => self.nodes.select()?,
        };

        let join = VoiceJoin {
            guild_id,
            voice_id: options.voice_id,
            text_id: options.text_id,
            shard_id: options.shard_id,
            mute: options.mute,
            deaf: options.deaf,
            volume: options.volume,
        };

        let timeout = self.settings.voice_connection_timeout;
        let voice = tokio::time::timeout(timeout, self.connector.join(join))
            .await
            .map_err(|_| OpenLinkError::VoiceConnectionTimeout { guild_id, timeout })??;

        let player = Arc::new(Player::new(
            voice.clone(),
            node.clone(),
            self.events.clone(),
            Arc::downgrade(self),
            &self.settings,
            &self.structures,
        ));

        node.attach_player();
        self.players.insert(guild_id, player.clone());

        if let Err(e) = player.sync_voice().await {
            warn!("❌ No se pudo enviar la voz al nodo {} para guild {}: {}", node.name(), guild_id, e);
            self.players.remove(&guild_id);
            node.detach_player();
            if let Err(e) = voice.disconnect().await {
                warn!("⚠️ Error al liberar la conexión de voz: {}", e);
            }
            return Err(e);
        }

        info!("🎵 Player creado para guild {} en {}", guild_id, node.name());
        self.events.emit(CoreEvent::PlayerCreate {
            player: player.clone(),
        });
        Ok(player)
    }

    /// Destruye la sesión del guild; no-op si no existe.
    pub async fn destroy(&self, guild_id: GuildId) -> Result<()> {
        match self.get(guild_id) {
            Some(player) => player.destroy().await,
            None => Ok(()),
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn guild_lock_count(&self) -> usize {
        self.guild_locks.len()
    }

    /// Quita la sesión solo si sigue siendo la registrada para el guild.
    pub(crate) fn remove(&self, guild_id: GuildId, player: &Arc<Player>) {
        if self
            .players
            .remove_if(&guild_id, |_, registered| Arc::ptr_eq(registered, player))
            .is_some()
        {
            debug!("Player de guild {} eliminado del registro", guild_id);
        }
    }
}
