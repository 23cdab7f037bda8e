//! # Client Sessions
//!
//! This file is part of the crossplay-gateway project.
//!
//! A session is the server-side identity of one connected client: its
//! refined version tag, its participant handle (the thing lobbies and the
//! router see), a weak link to its current lobby, and its timers. Sessions
//! are owned exclusively by the server's session registry; the lobby link
//! is weak and may dangle during teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::info;

use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::lobby::{Lobby, Participant, SharedLobby};
use crate::persist::files::CharacterSaveFile;

pub struct ClientSession {
    pub id: u64,
    pub version: Version,
    pub guild_card_number: u32,
    pub participant: Arc<Participant>,
    pub lobby: Mutex<Weak<Mutex<Lobby>>>,
    pub slot: Mutex<u8>,
    pub cheats_enabled: AtomicBool,
    timeouts_suspended: AtomicBool,
    pub save_file: Mutex<Option<Arc<Mutex<CharacterSaveFile>>>>,
}

impl ClientSession {
    pub fn new(
        id: u64,
        version: Version,
        guild_card_number: u32,
        participant: Arc<Participant>,
        cheats_enabled: bool,
    ) -> Arc<ClientSession> {
        Arc::new(ClientSession {
            id,
            version,
            guild_card_number,
            participant,
            lobby: Mutex::new(Weak::new()),
            slot: Mutex::new(0),
            cheats_enabled: AtomicBool::new(cheats_enabled),
            timeouts_suspended: AtomicBool::new(false),
            save_file: Mutex::new(None),
        })
    }

    /// Upgrade the weak lobby link; a failed upgrade means the lobby is
    /// gone and surfaces as a recoverable error.
    pub fn current_lobby(&self) -> Result<SharedLobby> {
        self.lobby
            .lock()
            .map_err(|_| ProtocolError::SessionGone)?
            .upgrade()
            .ok_or(ProtocolError::LobbyGone)
    }

    pub fn set_lobby(&self, lobby: &SharedLobby, slot: u8) {
        if let Ok(mut link) = self.lobby.lock() {
            *link = Arc::downgrade(lobby);
        }
        if let Ok(mut s) = self.slot.lock() {
            *s = slot;
        }
    }

    pub fn clear_lobby(&self) {
        if let Ok(mut link) = self.lobby.lock() {
            *link = Weak::new();
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot.lock().map(|s| *s).unwrap_or(0)
    }

    /// Arm the join queue: subcommands flagged for queueing are buffered
    /// until the client signals join completion.
    pub fn begin_game_join(&self) {
        if let Ok(mut state) = self.participant.state.lock() {
            state.join_queue = Some(Vec::new());
        }
        info!(session = self.id, "join command queue armed");
    }

    /// The client finished loading; flush the queue in order.
    pub fn finish_game_join(&self) {
        self.participant.flush_join_queue();
    }

    /// Dismount the periodic ping/idle/save events for this session.
    pub fn suspend_timeouts(&self) {
        self.timeouts_suspended.store(true, Ordering::Relaxed);
        info!(session = self.id, "timeouts suspended");
    }

    pub fn timeouts_suspended(&self) -> bool {
        self.timeouts_suspended.load(Ordering::Relaxed)
    }

    /// Flush the character file if one is attached and dirty.
    pub fn save_character(&self) -> Result<()> {
        let file = self
            .save_file
            .lock()
            .map_err(|_| ProtocolError::SessionGone)?
            .clone();
        if let Some(file) = file {
            file.lock()
                .map_err(|_| ProtocolError::SaveFileError("save file lock poisoned".into()))?
                .save()?;
        }
        Ok(())
    }
}
