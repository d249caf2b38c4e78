//! # Audio Module
//!
//! Player sessions and the state they carry.
//!
//! ### [`player`] - Player
//! - One session per guild, bound to one node for its whole lifetime
//! - Every remote command goes through the node's driver
//! - Destroy is latched: concurrent calls tear down once
//!
//! ### [`manager`] - Player Registry
//! - At most one player per guild; create and destroy are serialized per guild
//! - Picks the node and waits for the voice connection
//!
//! ### [`queue`] - Queue Management
//! - Upcoming tracks, current track and bounded history
//! - Shuffle and loop modes
//!
//! ### [`effects`] - Filters
//! - Equalizer presets and node-side audio filters

pub mod effects;
pub mod manager;
pub mod player;
pub mod queue;
