use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    audio::{effects::Filters, queue::Queue},
    connector::Connector,
    error::OpenLinkError,
    node::{driver::Driver, rest::RestTransport, NodeOptions, NodeResolver},
    sources::Plugin,
};

/// Fábrica del transporte REST de cada nodo.
pub type RestFactory = Arc<dyn Fn(&NodeOptions) -> Arc<dyn RestTransport> + Send + Sync>;
/// Fábrica de la cola de cada player.
pub type QueueFactory = Arc<dyn Fn(GuildId) -> Queue + Send + Sync>;
/// Fábrica de los filtros iniciales de cada player.
pub type FilterFactory = Arc<dyn Fn(GuildId) -> Filters + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFallback {
    pub enable: bool,
    pub engine: String,
}

impl Default for SearchFallback {
    fn default() -> Self {
        Self {
            enable: true,
            engine: "soundcloud".to_string(),
        }
    }
}

/// Data options of the [`Core`](crate::core::Core).
///
/// Every field has a default, so a partial document (or an empty environment)
/// merges over [`CoreSettings::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub nodes: Vec<NodeOptions>,
    #[serde(with = "duration_ms")]
    pub retry_timeout: Duration,
    pub retry_count: u32,
    #[serde(with = "duration_ms")]
    pub voice_connection_timeout: Duration,
    pub default_search_engine: String,
    pub default_volume: u16,
    pub search_fallback: SearchFallback,
    pub resume: bool,
    #[serde(with = "duration_ms")]
    pub resume_timeout: Duration,
    pub user_agent: String,
    /// Capacidad del canal de eventos.
    pub event_buffer: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            retry_timeout: Duration::from_millis(3000),
            retry_count: 15,
            voice_connection_timeout: Duration::from_millis(15000),
            default_search_engine: "youtube".to_string(),
            default_volume: 100,
            search_fallback: SearchFallback::default(),
            resume: false,
            resume_timeout: Duration::from_secs(300),
            user_agent: default_user_agent(),
            event_buffer: 256,
        }
    }
}

pub fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

impl CoreSettings {
    /// Carga la configuración desde variables de entorno (`.env` incluido).
    ///
    /// Durations accept humantime syntax (`3s`, `5m`); the node list is a JSON
    /// array of [`NodeOptions`] in `OPEN_LINK_NODES`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let nodes = match std::env::var("OPEN_LINK_NODES") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).context("OPEN_LINK_NODES must be a JSON array of nodes")?
            }
            _ => Vec::new(),
        };

        let settings = Self {
            nodes,
            retry_timeout: env_duration("OPEN_LINK_RETRY_TIMEOUT", defaults.retry_timeout)?,
            retry_count: std::env::var("OPEN_LINK_RETRY_COUNT")
                .unwrap_or_else(|_| defaults.retry_count.to_string())
                .parse()?,
            voice_connection_timeout: env_duration(
                "OPEN_LINK_VOICE_CONNECTION_TIMEOUT",
                defaults.voice_connection_timeout,
            )?,
            default_search_engine: std::env::var("OPEN_LINK_DEFAULT_SEARCH_ENGINE")
                .unwrap_or(defaults.default_search_engine),
            default_volume: std::env::var("OPEN_LINK_DEFAULT_VOLUME")
                .unwrap_or_else(|_| defaults.default_volume.to_string())
                .parse()?,
            search_fallback: SearchFallback {
                enable: std::env::var("OPEN_LINK_SEARCH_FALLBACK")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()?,
                engine: std::env::var("OPEN_LINK_SEARCH_FALLBACK_ENGINE")
                    .unwrap_or(defaults.search_fallback.engine),
            },
            resume: std::env::var("OPEN_LINK_RESUME")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            resume_timeout: env_duration("OPEN_LINK_RESUME_TIMEOUT", defaults.resume_timeout)?,
            user_agent: std::env::var("OPEN_LINK_USER_AGENT").unwrap_or(defaults.user_agent),
            event_buffer: defaults.event_buffer,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node, with unique names
    /// - Default volume between 0 and 1000
    /// - Event buffer greater than 0
    pub fn validate(&self) -> Result<(), OpenLinkError> {
        if self.nodes.is_empty() {
            return Err(OpenLinkError::Configuration("at least one node is required".into()));
        }

        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(OpenLinkError::Configuration(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        if self.default_volume > 1000 {
            return Err(OpenLinkError::Configuration(format!(
                "default volume must be between 0 and 1000, got: {}",
                self.default_volume
            )));
        }

        if self.event_buffer == 0 {
            return Err(OpenLinkError::Configuration("event buffer must be greater than 0".into()));
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords are never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Retry: {} x {}\n  \
            Voice timeout: {}\n  \
            Search: {} (fallback {}: {})\n  \
            Volume: {}%\n  \
            Resume: {} ({})",
            self.nodes
                .iter()
                .map(|node| format!("{}@{}", node.name, node.url))
                .collect::<Vec<_>>()
                .join(", "),
            self.retry_count,
            humantime::format_duration(self.retry_timeout),
            humantime::format_duration(self.voice_connection_timeout),
            self.default_search_engine,
            self.search_fallback.engine,
            self.search_fallback.enable,
            self.default_volume,
            self.resume,
            humantime::format_duration(self.resume_timeout),
        )
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => humantime::parse_duration(raw.trim()).with_context(|| format!("invalid duration in {}", key)),
        Err(_) => Ok(default),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Fábricas opcionales que reemplazan estructuras por defecto.
#[derive(Clone, Default)]
pub struct Structures {
    pub rest: Option<RestFactory>,
    pub queue: Option<QueueFactory>,
    pub filter: Option<FilterFactory>,
}

/// Everything the [`Core`](crate::core::Core) needs to start.
#[derive(Clone, Default)]
pub struct CoreOptions {
    pub connector: Option<Arc<dyn Connector>>,
    pub settings: CoreSettings,
    pub additional_drivers: Vec<Arc<dyn Driver>>,
    pub node_resolver: Option<NodeResolver>,
    pub structures: Structures,
    pub plugins: Vec<Arc<dyn Plugin>>,
}

impl CoreOptions {
    pub fn new(connector: Arc<dyn Connector>, settings: CoreSettings) -> Self {
        Self {
            connector: Some(connector),
            settings,
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.additional_drivers.push(driver);
        self
    }

    pub fn with_node_resolver(mut self, resolver: NodeResolver) -> Self {
        self.node_resolver = Some(resolver);
        self
    }

    pub fn with_structures(mut self, structures: Structures) -> Self {
        self.structures = structures;
        self
    }
}

impl fmt::Debug for CoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreOptions")
            .field("connector", &self.connector.is_some())
            .field("settings", &self.settings)
            .field("additional_drivers", &self.additional_drivers.len())
            .field("node_resolver", &self.node_resolver.is_some())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}
