//! # Event Bus
//!
//! Normalized event stream re-exposed by the [`Core`](crate::core::Core).
//!
//! Built on `tokio::sync::broadcast`: every subscriber gets its own copy of
//! each event, slow subscribers receive `RecvError::Lagged` instead of
//! blocking the players, and emitting with no subscribers is not an error.
//!
//! ```no_run
//! use open_link::events::{CoreEvent, RecvError};
//!
//! # async fn example(core: std::sync::Arc<open_link::Core>) {
//! let mut events = core.subscribe();
//! loop {
//!     match events.recv().await {
//!         Ok(CoreEvent::QueueEmpty { player }) => println!("queue empty in {}", player.guild_id()),
//!         Ok(_) => {}
//!         Err(RecvError::Lagged(n)) => eprintln!("missed {} events", n),
//!         Err(RecvError::Closed) => break,
//!     }
//! }
//! # }
//! ```

use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub use tokio::sync::broadcast::error::RecvError;
pub use tokio::sync::broadcast::Receiver;

use crate::{audio::player::Player, node::message::TrackEndReason, sources::Track};

#[derive(Debug, Clone)]
pub enum CoreEvent {
    Debug(String),
    NodeReady {
        node: String,
        resumed: bool,
    },
    NodeDisconnect {
        node: String,
    },
    PlayerCreate {
        player: Arc<Player>,
    },
    PlayerDestroy {
        player: Arc<Player>,
    },
    PlayerPause {
        player: Arc<Player>,
        track: Option<Track>,
    },
    PlayerResume {
        player: Arc<Player>,
        track: Option<Track>,
    },
    PlayerStop {
        player: Arc<Player>,
        track: Option<Track>,
    },
    PlayerClosed {
        player: Arc<Player>,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    TrackStart {
        player: Arc<Player>,
        track: Option<Track>,
    },
    TrackEnd {
        player: Arc<Player>,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackStuck {
        player: Arc<Player>,
        track: Option<Track>,
        threshold_ms: u64,
    },
    TrackException {
        player: Arc<Player>,
        track: Option<Track>,
        message: String,
    },
    QueueEmpty {
        player: Arc<Player>,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::Debug(_) => "Debug",
            CoreEvent::NodeReady { .. } => "NodeReady",
            CoreEvent::NodeDisconnect { .. } => "NodeDisconnect",
            CoreEvent::PlayerCreate { .. } => "PlayerCreate",
            CoreEvent::PlayerDestroy { .. } => "PlayerDestroy",
            CoreEvent::PlayerPause { .. } => "PlayerPause",
            CoreEvent::PlayerResume { .. } => "PlayerResume",
            CoreEvent::PlayerStop { .. } => "PlayerStop",
            CoreEvent::PlayerClosed { .. } => "PlayerClosed",
            CoreEvent::TrackStart { .. } => "TrackStart",
            CoreEvent::TrackEnd { .. } => "TrackEnd",
            CoreEvent::TrackStuck { .. } => "TrackStuck",
            CoreEvent::TrackException { .. } => "TrackException",
            CoreEvent::QueueEmpty { .. } => "QueueEmpty",
        }
    }

    pub fn player(&self) -> Option<&Arc<Player>> {
        match self {
            CoreEvent::Debug(_) | CoreEvent::NodeReady { .. } | CoreEvent::NodeDisconnect { .. } => None,
            CoreEvent::PlayerCreate { player }
            | CoreEvent::PlayerDestroy { player }
            | CoreEvent::PlayerPause { player, .. }
            | CoreEvent::PlayerResume { player, .. }
            | CoreEvent::PlayerStop { player, .. }
            | CoreEvent::PlayerClosed { player, .. }
            | CoreEvent::TrackStart { player, .. }
            | CoreEvent::TrackEnd { player, .. }
            | CoreEvent::TrackStuck { player, .. }
            | CoreEvent::TrackException { player, .. }
            | CoreEvent::QueueEmpty { player } => Some(player),
        }
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        self.player().map(|player| player.guild_id())
    }
}

/// Canal de difusión compartido por el core, los nodos y los players.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: CoreEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!("Evento {} sin suscriptores", name);
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.emit(CoreEvent::Debug(message));
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
