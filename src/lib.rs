//! # Crossplay Gateway
//!
//! This file is part of the crossplay-gateway project.
//!
//! It provides the main entry point for a multi-version game server and
//! intercepting proxy: per-version stream ciphers, framed command
//! channels, cross-version item and player-state transcoding, a
//! table-driven subcommand router, lobby state, and the proxy session
//! machine.
//!
//! The main components include:
//! - Core: version tags, command framing, codecs, wire cursors
//! - Crypto: the per-version keystream ciphers and the v4 key detector
//! - Channel: the framed, optionally-encrypted command stream
//! - Items: item codec, definition table, player-state snapshots
//! - Protocol: subcommand table, router, handlers
//! - Lobby: participants, floor items, item-ID progressions
//! - Proxy: the intercepting man-in-the-middle server
//! - Service: the game-server daemon and client sessions
//! - Persist: save files and the files manager
pub mod config;
pub mod error;

pub mod core {
    pub mod codec;
    pub mod packet;
    pub mod text;
    pub mod types;
    pub mod wire;
}

pub mod channel;
pub mod crypto;
pub mod items;
pub mod lobby;
pub mod persist;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod utils;

pub use crate::channel::Channel;
pub use crate::config::GatewayConfig;
pub use crate::core::packet::Command;
pub use crate::core::types::Version;
pub use crate::error::{ProtocolError, Result};
pub use crate::items::data::ItemData;
pub use crate::lobby::{Lobby, Participant};

/// Initialize the library with default logging configuration.
/// This should be called early in your application setup.
pub fn init() {
    utils::logging::setup_default_logging();
}

/// Initialize the library with custom logging configuration.
pub fn init_with_config(log_config: &utils::logging::LogConfig) {
    utils::logging::init_logging(log_config);
}
