//! # Subcommand Router
//!
//! This file is part of the crossplay-gateway project.
//!
//! Game commands carry one or more length-prefixed subcommands. The router
//! walks them, resolves each against the subcommand table under the
//! sender's numbering, and dispatches to the handler. Forwarding rewrites
//! the leading subcommand byte into each recipient's numbering; a
//! recipient whose numbering has no equivalent is skipped, never the whole
//! fan-out.
//!
//! Handlers never throw across the event-loop boundary: recoverable
//! (semantic and transcoding) errors are logged here and the message is
//! suppressed; fatal protocol violations propagate and tear down the
//! offending session's channel.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::packet::Command;
use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::items::table::ItemDefinitionTable;
use crate::lobby::{Lobby, Participant, RecordedEventKind, SharedLobby};
use crate::protocol::handlers;
use crate::protocol::subcommands::{
    command_is_private, def_for_subcommand, translate_subcommand_number, HandlerId,
    ALLOW_FORWARD_TO_WATCHED_LOBBY, ALWAYS_FORWARD_TO_WATCHERS, USE_JOIN_COMMAND_QUEUE,
};

/// Shared read-only environment for the router and its handlers.
pub struct RouterEnv {
    pub item_table: Arc<ItemDefinitionTable>,
}

impl RouterEnv {
    pub fn new(item_table: Arc<ItemDefinitionTable>) -> RouterEnv {
        RouterEnv { item_table }
    }
}

/// Size of the basic subcommand header: number, size-in-words, client id.
pub const SUBCOMMAND_HEADER_SIZE: usize = 4;

/// Walk the subcommand units inside one game command and dispatch each.
/// The basic header's size field counts 4-byte words; a zero size selects
/// the extended header whose 32-bit byte count follows.
pub fn handle_game_command(
    env: &RouterEnv,
    lobby: &SharedLobby,
    sender: &Arc<Participant>,
    cmd: &Command,
) -> Result<()> {
    if cmd.data.is_empty() {
        return Err(ProtocolError::InvalidField("empty game command"));
    }
    let data = &cmd.data;
    let mut offset = 0;
    while offset < data.len() {
        if offset + SUBCOMMAND_HEADER_SIZE > data.len() {
            return Err(ProtocolError::SizeMismatch {
                got: data.len() - offset,
                expected: SUBCOMMAND_HEADER_SIZE,
            });
        }
        let size_words = data[offset + 1] as usize;
        let unit_size = if size_words != 0 {
            size_words * 4
        } else {
            if offset + 8 > data.len() {
                return Err(ProtocolError::SizeMismatch {
                    got: data.len() - offset,
                    expected: 8,
                });
            }
            let raw = [
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ];
            let ext = if sender.version.is_big_endian() {
                u32::from_be_bytes(raw) as usize
            } else {
                u32::from_le_bytes(raw) as usize
            };
            if ext < 8 || ext % 4 != 0 {
                return Err(ProtocolError::InvalidField("extended subcommand size"));
            }
            ext
        };
        if unit_size == 0 || offset + unit_size > data.len() {
            return Err(ProtocolError::InvalidField("subcommand size"));
        }
        dispatch_one(
            env,
            lobby,
            sender,
            cmd.command,
            cmd.flag,
            &data[offset..offset + unit_size],
        )?;
        offset += unit_size;
    }
    Ok(())
}

fn dispatch_one(
    env: &RouterEnv,
    lobby: &SharedLobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    sub_data: &[u8],
) -> Result<()> {
    let subcommand = sub_data[0];
    let def = def_for_subcommand(sender.version, subcommand);
    let handler = def.map(|(_, d)| d.handler).unwrap_or(HandlerId::Unimplemented);

    let outcome = handlers::run(env, lobby, sender, handler, command, flag, sub_data);
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(
                gc = sender.guild_card_number,
                subcommand = format_args!("{subcommand:02X}"),
                error = %e,
                "fatal error in subcommand handler"
            );
            Err(e)
        }
        Err(e) => {
            // Semantic drop: recovered locally, message suppressed, no
            // other side effects.
            info!(
                gc = sender.guild_card_number,
                subcommand = format_args!("{subcommand:02X}"),
                error = %e,
                "subcommand dropped"
            );
            Ok(())
        }
    }
}

/// Rewrite the leading subcommand byte for a recipient. `None` means this
/// recipient cannot receive the message.
fn translated_payload(data: &[u8], from: Version, to: Version) -> Option<Vec<u8>> {
    // v1 and later share one numbering; a pre-v1 recipient only keeps the
    // payload untouched when the sender speaks its exact dialect.
    if (!from.is_pre_v1() && !to.is_pre_v1()) || from == to {
        return Some(data.to_vec());
    }
    let translated = translate_subcommand_number(to, from, data[0]);
    if translated == 0 {
        return None;
    }
    let mut out = data.to_vec();
    out[0] = translated;
    Some(out)
}

/// Fan a subcommand out per the forwarding policy. The caller holds the
/// lobby lock; participant sends only touch per-participant queues.
///
/// Non-private messages go to every other participant whose version admits
/// the subcommand, then to spectator lobbies when the entry's flags allow
/// it (or unconditionally once the spectated game is in its active phase),
/// then to the attached recorder. Private messages carry the target slot
/// in the frame flag and are delivered to that slot only.
pub fn forward_subcommand(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) {
    let def = def_for_subcommand(sender.version, data[0]);
    let def_flags = def.map(|(_, d)| d.flags).unwrap_or(0);

    let send_to = |target: &Arc<Participant>| {
        match translated_payload(data, sender.version, target.version) {
            Some(payload) => {
                let queue_eligible = def_flags & USE_JOIN_COMMAND_QUEUE != 0;
                target.send_or_queue(Command::new(command, flag, payload), queue_eligible);
            }
            None => {
                info!(
                    gc = target.guild_card_number,
                    subcommand = format_args!("{:02X}", data[0]),
                    "subcommand has no counterpart for recipient version"
                );
            }
        }
    };

    if command_is_private(command) {
        if flag >= crate::lobby::MAX_CLIENTS as u32 {
            return;
        }
        if let Some(target) = l.client_at(flag as u8) {
            send_to(&target);
        }
        return;
    }

    for (_, target) in l.occupied_slots() {
        if !Arc::ptr_eq(&target, sender) {
            send_to(&target);
        }
    }

    // Spectator rooms watching this lobby.
    if l.active_phase || def_flags & ALWAYS_FORWARD_TO_WATCHERS != 0 {
        for watcher in &l.watcher_lobbies {
            if let Some(watcher) = watcher.upgrade() {
                if let Ok(watcher) = watcher.lock() {
                    for (_, target) in watcher.occupied_slots() {
                        send_to(&target);
                    }
                }
            }
        }
    }

    // A spectator lobby may echo selected traffic back into the lobby it
    // watches.
    if l.is_spectator_lobby && def_flags & ALLOW_FORWARD_TO_WATCHED_LOBBY != 0 {
        if let Some(watched) = l.watched_lobby.upgrade() {
            if let Ok(watched) = watched.lock() {
                for (_, target) in watched.occupied_slots() {
                    send_to(&target);
                }
            }
        }
    }

    let kind = if l.is_spectator_lobby {
        RecordedEventKind::SpectatorGameCommand
    } else {
        RecordedEventKind::GameCommand
    };
    l.record_command(kind, data);
}

/// Unknown subcommands: pre-v1 clients are authoritative for their own
/// numbering, so theirs are forwarded unchanged; everyone else's are
/// logged and dropped.
pub fn on_unimplemented(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) {
    if sender.version.is_pre_v1() {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            "unrecognized prototype subcommand; forwarding unchanged"
        );
        forward_subcommand(l, sender, command, flag, data);
    } else if command_is_private(command) {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            target = flag,
            "unknown subcommand (private)"
        );
    } else {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            "unknown subcommand (public)"
        );
    }
}
