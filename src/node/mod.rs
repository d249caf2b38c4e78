//! # Node Module
//!
//! Remote audio nodes and the registry that hands them out to players.
//!
//! A [`Node`] is one configured backend process. It owns a [`Rest`] client
//! bound to a [`Driver`] picked at construction time; every player assigned
//! to the node shares that driver. The [`NodeManager`] builds the nodes from
//! configuration and selects one for each new player session.

pub mod driver;
pub mod message;
pub mod rest;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    config::{CoreSettings, RestFactory},
    error::{OpenLinkError, Result},
};
use driver::Driver;
use message::NodeStats;
use rest::{HttpTransport, Rest, RestTransport};

/// Función de selección de nodo; recibe los nodos conectados.
pub type NodeResolver = Arc<dyn Fn(&[Arc<Node>]) -> Option<Arc<Node>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    pub name: String,
    /// `host:port` del nodo.
    pub url: String,
    pub auth: String,
    #[serde(default)]
    pub secure: bool,
    /// Id del driver (ej. `"lavalink/v3"`); `None` usa el primero registrado.
    #[serde(default)]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Closed,
}

pub struct Node {
    options: NodeOptions,
    rest: Rest,
    state: RwLock<NodeState>,
    stats: RwLock<Option<NodeStats>>,
    players: AtomicUsize,
    reconnect_attempts: AtomicU32,
    retry_count: u32,
    retry_timeout: Duration,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.options.name)
            .field("driver", &self.rest.driver().id())
            .field("state", &self.state())
            .field("players", &self.player_count())
            .finish()
    }
}

impl Node {
    pub fn new(
        options: NodeOptions,
        driver: Arc<dyn Driver>,
        transport: Arc<dyn RestTransport>,
        settings: &CoreSettings,
    ) -> Self {
        let rest = Rest::new(options.name.clone(), driver, transport);

        Self {
            options,
            rest,
            state: RwLock::new(NodeState::Connecting),
            stats: RwLock::new(None),
            players: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            retry_count: settings.retry_count,
            retry_timeout: settings.retry_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.rest.driver()
    }

    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    pub fn stats(&self) -> Option<NodeStats> {
        *self.stats.read()
    }

    pub fn player_count(&self) -> usize {
        self.players.load(Ordering::Acquire)
    }

    pub(crate) fn attach_player(&self) {
        self.players.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_player(&self) {
        let _ = self
            .players
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    /// Sesión lista: guarda el id y, si corresponde, activa la reanudación.
    pub async fn handle_ready(&self, session_id: String, resumed: bool, resume_timeout: Option<Duration>) -> Result<()> {
        self.rest.set_session_id(Some(session_id.clone()));
        *self.state.write() = NodeState::Connected;
        self.reconnect_attempts.store(0, Ordering::Release);

        info!(
            "✅ Nodo {} listo (sesión {}, reanudada: {})",
            self.name(),
            session_id,
            resumed
        );

        if let Some(timeout) = resume_timeout {
            self.rest.update_session(timeout).await?;
            debug!("⏱️ Reanudación configurada en {} por {:?}", self.name(), timeout);
        }

        Ok(())
    }

    pub(crate) fn update_stats(&self, stats: NodeStats) {
        *self.stats.write() = Some(stats);
    }

    /// El canal de eventos se cerró; el conector decide si reconectar.
    pub fn on_close(&self) {
        let mut state = self.state.write();
        if *state != NodeState::Closed {
            *state = NodeState::Reconnecting;
        }
        warn!("⚠️ Conexión con el nodo {} cerrada", self.options.name);
    }

    /// Espera antes del próximo intento, o `None` si se agotaron los intentos.
    pub fn next_reconnect_delay(&self) -> Option<Duration> {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);

        if attempt < self.retry_count {
            debug!(
                "🔄 Reintento {}/{} para el nodo {}",
                attempt + 1,
                self.retry_count,
                self.name()
            );
            Some(self.retry_timeout)
        } else {
            *self.state.write() = NodeState::Closed;
            warn!("❌ Nodo {} sin más reintentos", self.name());
            None
        }
    }

    pub fn disconnect(&self) {
        *self.state.write() = NodeState::Disconnected;
        self.rest.set_session_id(None);
    }
}

/// Registro de nodos configurados.
pub struct NodeManager {
    nodes: HashMap<String, Arc<Node>>,
    resolver: Option<NodeResolver>,
}

impl NodeManager {
    pub fn new(
        settings: &CoreSettings,
        drivers: &[Arc<dyn Driver>],
        rest_factory: Option<&RestFactory>,
        resolver: Option<NodeResolver>,
    ) -> Result<Self> {
        let mut nodes = HashMap::new();

        for options in &settings.nodes {
            let driver = match &options.driver {
                Some(id) => drivers.iter().find(|driver| driver.id() == id.as_str()).cloned(),
                None => drivers.first().cloned(),
            }
            .ok_or_else(|| {
                OpenLinkError::Configuration(format!(
                    "no driver '{}' registered for node '{}'",
                    options.driver.as_deref().unwrap_or("<default>"),
                    options.name
                ))
            })?;

            let transport: Arc<dyn RestTransport> = match rest_factory {
                Some(factory) => factory(options),
                None => Arc::new(HttpTransport::new(options, &settings.user_agent)?),
            };

            debug!("🎼 Nodo {} usa el driver {}", options.name, driver.id());
            let node = Node::new(options.clone(), driver, transport, settings);
            nodes.insert(options.name.clone(), Arc::new(node));
        }

        Ok(Self { nodes, resolver })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Elige un nodo conectado para una sesión nueva.
    pub fn select(&self) -> Result<Arc<Node>> {
        let connected: Vec<_> = self.all().into_iter().filter(|node| node.is_connected()).collect();

        let selected = match &self.resolver {
            Some(resolver) => resolver(&connected),
            None => connected.iter().min_by_key(|node| node.player_count()).cloned(),
        };

        selected.ok_or(OpenLinkError::NoNodeAvailable)
    }
}
