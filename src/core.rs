//! # Core
//!
//! Composition root of the library. [`Core::initialize`] validates the
//! options, registers the protocol drivers, builds the node and player
//! registries, loads plugins and finally binds itself to the connector.
//!
//! ```no_run
//! use open_link::{Core, CoreOptions, CoreSettings, CreatePlayerOptions};
//! use serenity::model::id::{ChannelId, GuildId};
//!
//! # async fn example(connector: std::sync::Arc<dyn open_link::Connector>) -> anyhow::Result<()> {
//! let core = Core::initialize(CoreOptions::new(connector, CoreSettings::from_env()?)).await?;
//!
//! let options = CreatePlayerOptions::new(GuildId::new(1), ChannelId::new(2), ChannelId::new(3));
//! let player = core.create(options).await?;
//! let result = core.search("never gonna give you up", Default::default()).await?;
//! if let Some(track) = result.tracks.first() {
//!     player.play(Some(track.clone()), Default::default()).await?;
//! }
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        manager::{CreatePlayerOptions, PlayerManager},
        player::Player,
    },
    config::{CoreOptions, CoreSettings},
    connector::Connector,
    error::{OpenLinkError, Result},
    events::{CoreEvent, EventBus, Receiver},
    node::{
        driver::{Driver, Lavalink3Driver, Lavalink4Driver},
        message::NodeMessage,
        Node, NodeManager,
    },
    sources::{is_url, Plugin, PluginKind, SearchOptions, SearchResult, PLUGIN_MARKER, SEARCH_ENGINES},
};

pub struct Core {
    settings: CoreSettings,
    connector: Arc<dyn Connector>,
    drivers: Vec<Arc<dyn Driver>>,
    nodes: Arc<NodeManager>,
    players: Arc<PlayerManager>,
    /// Nombre del motor → prefijo de búsqueda del nodo.
    search_engines: HashMap<String, String>,
    /// Nombre del motor → plugin que lo resuelve.
    search_plugins: HashMap<String, Arc<dyn Plugin>>,
    plugins: HashMap<String, Arc<dyn Plugin>>,
    events: EventBus,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("nodes", &self.nodes.all().len())
            .field("players", &self.players.len())
            .field("drivers", &self.drivers.len())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl Core {
    pub async fn initialize(options: CoreOptions) -> Result<Arc<Self>> {
        let CoreOptions {
            connector,
            settings,
            additional_drivers,
            node_resolver,
            structures,
            plugins: plugin_list,
        } = options;

        let connector = connector
            .ok_or_else(|| OpenLinkError::Configuration("a chat-platform connector is required".into()))?;
        settings.validate()?;
        debug!("{}", settings.summary());

        let events = EventBus::new(settings.event_buffer);

        let mut drivers: Vec<Arc<dyn Driver>> = vec![Arc::new(Lavalink4Driver), Arc::new(Lavalink3Driver)];
        drivers.extend(additional_drivers);
        for driver in &drivers {
            debug!("🎼 Driver registrado: {}", driver.id());
        }

        let nodes = Arc::new(NodeManager::new(
            &settings,
            &drivers,
            structures.rest.as_ref(),
            node_resolver,
        )?);

        let players = Arc::new(PlayerManager::new(
            connector.clone(),
            nodes.clone(),
            settings.clone(),
            structures,
            events.clone(),
        ));

        let mut search_engines: HashMap<String, String> = SEARCH_ENGINES
            .iter()
            .map(|(name, prefix)| (name.to_string(), prefix.to_string()))
            .collect();
        let mut search_plugins = HashMap::new();
        let mut plugins = HashMap::new();

        for plugin in &plugin_list {
            let name = plugin.name();
            if plugin.marker() != Some(PLUGIN_MARKER) || name.trim().is_empty() {
                return Err(OpenLinkError::PluginType(name));
            }

            if plugin.kind() == PluginKind::SourceResolver {
                let source = plugin.source().ok_or_else(|| OpenLinkError::PluginType(name.clone()))?;
                debug!("🔍 Motor {} resuelto por el plugin {}", source.source_name, name);
                search_engines.insert(source.source_name.clone(), source.source_identify);
                search_plugins.insert(source.source_name, plugin.clone());
            }

            plugins.insert(name, plugin.clone());
        }

        let core = Arc::new(Self {
            settings,
            connector,
            drivers,
            nodes,
            players,
            search_engines,
            search_plugins,
            plugins,
            events,
        });

        for plugin in &plugin_list {
            plugin.load(core.clone()).await?;
            core.events.debug(format!("Plugin cargado: {}", plugin.name()));
        }

        core.connector.bind_owner(Arc::downgrade(&core));
        core.connector.listen(&core.settings.nodes).await?;

        info!(
            "🚀 Core listo con {} nodo(s) y {} plugin(s)",
            core.settings.nodes.len(),
            core.plugins.len()
        );
        Ok(core)
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn drivers(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.all()
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name)
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Prefijo registrado para un motor de búsqueda.
    pub fn search_engine(&self, name: &str) -> Option<&str> {
        self.search_engines.get(name).map(String::as_str)
    }

    pub async fn create(&self, options: CreatePlayerOptions) -> Result<Arc<Player>> {
        self.players.create(options).await
    }

    pub async fn destroy(&self, guild_id: GuildId) -> Result<()> {
        self.players.destroy(guild_id).await
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(guild_id)
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.all()
    }

    #[cfg(test)]
    pub(crate) fn player_manager(&self) -> &Arc<PlayerManager> {
        &self.players
    }

    /// Busca tracks con el motor indicado, cayendo al motor de respaldo si no hay resultados.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<SearchResult> {
        let engine = options
            .engine
            .clone()
            .unwrap_or_else(|| self.settings.default_search_engine.clone());

        let mut result = self.search_with(query, &engine, &options).await?;

        let fallback = &self.settings.search_fallback;
        if result.is_empty() && fallback.enable && fallback.engine != engine && !is_url(query) {
            debug!("🔄 Sin resultados en {}, probando {}", engine, fallback.engine);
            result = self.search_with(query, &fallback.engine, &options).await?;
        }

        Ok(result.with_requester(options.requester))
    }

    async fn search_with(&self, query: &str, engine: &str, options: &SearchOptions) -> Result<SearchResult> {
        if !is_url(query) {
            if let Some(plugin) = self.search_plugins.get(engine) {
                return plugin.search(query, options).await;
            }
        }

        let identifier = if is_url(query) {
            query.to_string()
        } else {
            let prefix = self
                .search_engines
                .get(engine)
                .ok_or_else(|| OpenLinkError::NoResolver(engine.to_string()))?;
            format!("{}:{}", prefix, query)
        };

        let node = match &options.node {
            Some(name) => self
                .nodes
                .get(name)
                .ok_or_else(|| OpenLinkError::NodeNotFound(name.clone()))?,
            None => self.nodes.select()?,
        };

        debug!("🔍 {} → {}", identifier, node.name());
        Ok(node.rest().load_tracks(&identifier).await?)
    }

    /// Mensaje crudo recibido por el canal de eventos de un nodo.
    pub async fn handle_node_message(&self, node_name: &str, raw: &str) -> Result<()> {
        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| OpenLinkError::NodeNotFound(node_name.to_string()))?;

        let Some(message) = NodeMessage::parse(raw)? else {
            return Ok(());
        };

        match message {
            NodeMessage::Ready { resumed, session_id } => {
                let resume_timeout = self.settings.resume.then_some(self.settings.resume_timeout);
                node.handle_ready(session_id, resumed, resume_timeout).await?;
                self.events.emit(CoreEvent::NodeReady {
                    node: node.name().to_string(),
                    resumed,
                });
            }
            NodeMessage::Stats(stats) => node.update_stats(stats),
            NodeMessage::PlayerUpdate { guild_id, state } => {
                if let Some(player) = self.player_on(&node, guild_id) {
                    player.handle_player_update(state);
                }
            }
            NodeMessage::Event { guild_id, event } => {
                if let Some(player) = self.player_on(&node, guild_id) {
                    player.handle_track_event(event).await?;
                }
            }
        }

        Ok(())
    }

    /// El conector perdió el canal de eventos del nodo.
    pub fn handle_node_close(&self, node_name: &str) {
        if let Some(node) = self.nodes.get(node_name) {
            node.on_close();
            self.events.emit(CoreEvent::NodeDisconnect {
                node: node_name.to_string(),
            });
        }
    }

    /// `VOICE_STATE_UPDATE` del bot; `None` significa que salió del canal.
    pub async fn handle_voice_state(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> Result<()> {
        let Some(player) = self.players.get(guild_id) else {
            return Ok(());
        };

        match channel_id {
            Some(channel_id) => player.set_voice_channel(channel_id),
            None => player.disconnect().await,
        }
    }

    /// `VOICE_SERVER_UPDATE`: reenvía los datos de voz al nodo.
    pub async fn handle_voice_server(&self, guild_id: GuildId) -> Result<()> {
        if let Some(player) = self.players.get(guild_id) {
            player.sync_voice().await?;
        }
        Ok(())
    }

    /// Destruye todas las sesiones y desconecta los nodos.
    pub async fn shutdown(&self) {
        let players = self.players.all();
        info!("🛑 Cerrando {} player(s)", players.len());

        for result in join_all(players.iter().map(|player| player.destroy())).await {
            if let Err(e) = result {
                warn!("⚠️ Error al destruir un player: {}", e);
            }
        }

        for node in self.nodes.all() {
            node.disconnect();
        }
    }

    fn player_on(&self, node: &Arc<Node>, guild_id: GuildId) -> Option<Arc<Player>> {
        let player = self.players.get(guild_id)?;
        if Arc::ptr_eq(player.node(), node) {
            Some(player)
        } else {
            warn!("⚠️ Evento del nodo {} para un player de otro nodo ({})", node.name(), guild_id);
            None
        }
    }
}
