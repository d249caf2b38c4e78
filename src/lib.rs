//! # Open Link
//!
//! Per-guild player sessions for Discord music bots on top of Lavalink-style
//! audio nodes.
//!
//! The [`Core`] is the composition root: it owns the node registry, the
//! player registry, the protocol drivers and the plugins. A [`Connector`]
//! supplied by the embedding bot bridges the Discord gateway (voice joins
//! and voice updates) and the node event sockets.
//!
//! ## Modules
//!
//! - [`audio`] - player sessions, queues and filters
//! - [`node`] - nodes, versioned drivers and the REST client
//! - [`sources`] - track model and resolver plugins
//! - [`events`] - broadcast event stream
//! - [`config`] - settings and construction options

pub mod audio;
pub mod config;
pub mod connector;
pub mod core;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod sources;

#[cfg(test)]
mod testing;

pub use crate::audio::{
    manager::CreatePlayerOptions,
    player::{PlayOptions, Player, PlayerState},
    queue::LoopMode,
};
pub use crate::config::{CoreOptions, CoreSettings, Structures};
pub use crate::connector::{Connector, VoiceHandle};
pub use crate::core::Core;
pub use crate::error::{NodeError, OpenLinkError, Result};
pub use crate::events::CoreEvent;
pub use crate::sources::{Plugin, SearchOptions, SearchResult, Track};
