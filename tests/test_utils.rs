//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crossplay_gateway::core::packet::Command;
use crossplay_gateway::core::types::Version;
use crossplay_gateway::items::table::ItemDefinitionTable;
use crossplay_gateway::lobby::{Lobby, LobbyRegistry, Participant, SharedLobby};
use crossplay_gateway::protocol::router::RouterEnv;

/// Build one subcommand unit: 4-byte header plus body, padded to a 4-byte
/// boundary, with the size field in 4-byte words.
pub fn game_sub(version: Version, subcommand: u8, client_id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(subcommand);
    out.push(0); // patched below
    if version.is_big_endian() {
        out.extend_from_slice(&client_id.to_be_bytes());
    } else {
        out.extend_from_slice(&client_id.to_le_bytes());
    }
    out.extend_from_slice(body);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out[1] = (out.len() / 4) as u8;
    out
}

pub struct TestLobby {
    pub registry: Arc<LobbyRegistry>,
    pub lobby: SharedLobby,
    pub participants: Vec<Arc<Participant>>,
    pub receivers: Vec<UnboundedReceiver<Command>>,
    pub env: RouterEnv,
}

/// A game lobby populated with one participant per requested version, in
/// slot order.
pub fn game_lobby(base: Version, versions: &[Version]) -> TestLobby {
    let registry = LobbyRegistry::new();
    let lobby = registry.insert(Lobby::new(100, base, true));
    let mut participants = Vec::new();
    let mut receivers = Vec::new();
    for (i, &version) in versions.iter().enumerate() {
        let (participant, rx) = Participant::new(0x100 + i as u32, version, format!("p{i}"));
        lobby
            .lock()
            .unwrap()
            .add_client(&participant, Some(i as u8))
            .unwrap();
        participants.push(participant);
        receivers.push(rx);
    }
    TestLobby {
        registry,
        lobby,
        participants,
        receivers,
        env: RouterEnv::new(Arc::new(ItemDefinitionTable::default())),
    }
}

/// Drain everything currently queued toward one participant.
pub fn drain(rx: &mut UnboundedReceiver<Command>) -> Vec<Command> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        out.push(cmd);
    }
    out
}
