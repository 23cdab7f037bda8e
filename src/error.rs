//! # Error
//!
//! This file is part of the crossplay-gateway project.
//!
//! It defines the error types used throughout the gateway.
//!
//! Errors are split along the lines the router cares about: protocol
//! violations are fatal to the offending channel, semantic failures are
//! recovered locally (logged, message suppressed), and transcoding failures
//! are recovered per recipient. The `is_fatal` helper encodes that split so
//! handlers never have to guess.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no command available")]
    NoCommandAvailable,

    #[error("invalid command header")]
    InvalidHeader,

    #[error("outbound command too large: {0} bytes")]
    OversizedCommand(usize),

    #[error("command size mismatch: got {got}, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },

    #[error("invalid field value: {0}")]
    InvalidField(&'static str),

    #[error("unknown encryption commitment")]
    CipherDetectionFailed,

    #[error("invalid login opcode: {0:02X}")]
    InvalidLoginOpcode(u16),

    #[error("target slot empty: {0}")]
    TargetSlotEmpty(u8),

    #[error("item not found: {0:08X}")]
    ItemNotFound(u32),

    #[error("item not visible to requester")]
    ItemNotVisible,

    #[error("inventory full")]
    InventoryFull,

    #[error("no free slot in lobby")]
    NoFreeSlot,

    #[error("not in any lobby")]
    NotInLobby,

    #[error("subcommand has no counterpart for recipient version")]
    Untranslatable,

    #[error("decompression failed: {0}")]
    DecompressionFailure(&'static str),

    #[error("upstream connection lost")]
    UpstreamLost,

    #[error("no upstream destination available")]
    NoUpstreamDestination,

    #[error("session is gone")]
    SessionGone,

    #[error("lobby is gone")]
    LobbyGone,

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("save file error: {0}")]
    SaveFileError(String),

    #[error("handshake failed: {0}")]
    HandshakeError(String),

    #[error("timeout occurred")]
    Timeout,
}

impl ProtocolError {
    /// True for errors that must tear down the channel. Semantic and
    /// transcoding failures are recoverable; the router logs and drops.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::InvalidHeader
            | ProtocolError::OversizedCommand(_)
            | ProtocolError::SizeMismatch { .. }
            | ProtocolError::InvalidField(_)
            | ProtocolError::CipherDetectionFailed
            | ProtocolError::InvalidLoginOpcode(_)
            | ProtocolError::DecompressionFailure(_)
            | ProtocolError::HandshakeError(_) => true,
            ProtocolError::NoCommandAvailable
            | ProtocolError::TargetSlotEmpty(_)
            | ProtocolError::ItemNotFound(_)
            | ProtocolError::ItemNotVisible
            | ProtocolError::InventoryFull
            | ProtocolError::NoFreeSlot
            | ProtocolError::NotInLobby
            | ProtocolError::Untranslatable
            | ProtocolError::UpstreamLost
            | ProtocolError::NoUpstreamDestination
            | ProtocolError::SessionGone
            | ProtocolError::LobbyGone
            | ProtocolError::ConfigError(_)
            | ProtocolError::SaveFileError(_)
            | ProtocolError::Timeout => false,
        }
    }
}
