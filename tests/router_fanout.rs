//! Router fan-out policy: numbering translation, private delivery, join
//! queueing, spectator forwarding, and the pre-v1 compatibility rules.

mod test_utils;

use std::sync::Arc;

use crossplay_gateway::core::packet::Command;
use crossplay_gateway::core::types::Version;
use crossplay_gateway::items::data::make_mag;
use crossplay_gateway::items::inventory::InventoryItem;
use crossplay_gateway::items::snapshot::PlayerSnapshot;
use crossplay_gateway::items::table::ItemDefinitionTable;
use crossplay_gateway::lobby::{Lobby, Participant, RecordedEventKind, Recorder};
use crossplay_gateway::protocol::router::handle_game_command;

use test_utils::{drain, game_lobby, game_sub};

#[test]
fn forwarding_rewrites_the_subcommand_byte_per_recipient() {
    // Walk-to-position is 0x40 on v1+, 0x37 on prototype A, 0x3C on B.
    let mut t = game_lobby(
        Version::V4,
        &[Version::ProtoA, Version::V4, Version::ProtoB, Version::ProtoA],
    );
    let body = [0u8; 8];
    let cmd = Command::new(0x60, 0, game_sub(Version::ProtoA, 0x37, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    assert!(drain(&mut t.receivers[0]).is_empty(), "never echoed to the sender");
    assert_eq!(drain(&mut t.receivers[1])[0].data[0], 0x40);
    assert_eq!(drain(&mut t.receivers[2])[0].data[0], 0x3C);
    assert_eq!(drain(&mut t.receivers[3])[0].data[0], 0x37);
}

#[test]
fn untranslatable_subcommands_drop_per_recipient_only() {
    // The v4 stack split has no prototype counterpart; in a non-v4 lobby
    // it is forwarded, but only to recipients whose numbering can carry
    // it.
    let mut t = game_lobby(Version::V2, &[Version::V4, Version::ProtoA, Version::V2]);
    let body = [0u8; 20];
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0xC3, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    assert!(drain(&mut t.receivers[1]).is_empty(), "prototype cannot receive 0xC3");
    assert_eq!(drain(&mut t.receivers[2]).len(), 1, "v2 recipient still receives");
}

#[test]
fn private_commands_reach_only_the_flagged_slot() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4, Version::V4]);
    // 0x71 is queue-eligible and game-loading-gated; arm loading on the
    // target so the gate is open.
    t.participants[2].state.lock().unwrap().join_queue = Some(Vec::new());

    let cmd = Command::new(0x62, 2, game_sub(Version::V4, 0x71, 0, &[0u8; 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    assert!(drain(&mut t.receivers[1]).is_empty());
    // Queued, not sent, because the join queue is armed.
    assert!(drain(&mut t.receivers[2]).is_empty());
    t.participants[2].flush_join_queue();
    let got = drain(&mut t.receivers[2]);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data[0], 0x71);

    // An out-of-range slot is silently dropped.
    let cmd = Command::new(0x62, 99, game_sub(Version::V4, 0x71, 0, &[0u8; 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();
}

#[test]
fn unknown_subcommands_from_pre_v1_clients_are_still_forwarded() {
    let mut t = game_lobby(Version::V1, &[Version::ProtoA, Version::ProtoA, Version::V1]);
    // 0xF0 maps to nothing anywhere.
    let cmd = Command::new(0x60, 0, game_sub(Version::ProtoA, 0xF0, 0, &[0u8; 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let same_numbering = drain(&mut t.receivers[1]);
    assert_eq!(same_numbering.len(), 1);
    assert_eq!(same_numbering[0].data[0], 0xF0);
    // A v1 recipient has no equivalent; dropped for it only.
    assert!(drain(&mut t.receivers[2]).is_empty());

    // The same unknown number from a v1+ client is logged and dropped.
    let cmd = Command::new(0x60, 0, game_sub(Version::V1, 0xF0, 2, &[0u8; 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[2], &cmd).unwrap();
    assert!(drain(&mut t.receivers[0]).is_empty());
    assert!(drain(&mut t.receivers[1]).is_empty());
}

#[test]
fn snapshot_sync_synthesizes_the_end_of_state_marker() {
    let mut t = game_lobby(Version::V1, &[Version::ProtoA, Version::V1]);

    let mut snap = PlayerSnapshot::default();
    snap.guild_card_number = 0x0100;
    snap.stats.level = 9;
    snap.stats.hp = 120;
    let mut mag = make_mag(2, 500, 0, 100, 0, [0x40, 0x05, 0x64, 0x03]);
    mag.id = 0x0001_0001;
    snap.items[0] = InventoryItem::new(mag);
    snap.num_items = 1;

    let table = ItemDefinitionTable::default();
    let payload = snap.emit(Version::ProtoA, &table);
    // 0x70 is numbered 0x60 under prototype A.
    let cmd = Command::new(0x62, 1, game_sub(Version::ProtoA, 0x60, 0, &payload));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let got = drain(&mut t.receivers[1]);
    assert_eq!(got.len(), 2, "marker first, then the snapshot");
    assert_eq!(got[0].data[0], 0x71, "synthesized end-of-state marker");
    assert_eq!(got[1].data[0], 0x70, "snapshot translated to the v1 numbering");

    // The recipient-side record parses in its own variant with the mag
    // intact.
    let body = &got[1].data[4..];
    let expected = crossplay_gateway::items::snapshot::snapshot_size_for_version(Version::V1);
    let reparsed = PlayerSnapshot::parse(Version::V1, &body[..expected]).unwrap();
    assert_eq!(reparsed.stats.level, 9);
    assert_eq!(reparsed.items[0].data.data2, [0x40, 0x05, 0x64, 0x03]);
}

#[test]
fn watcher_lobbies_receive_flagged_traffic_and_active_phase_traffic() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);

    // A spectator lobby watching the game, holding one spectator.
    let spectator_lobby = t.registry.insert(Lobby::new(200, Version::V4, true));
    let (spectator, mut spectator_rx) = Participant::new(0x900, Version::V4, "watcher");
    spectator_lobby
        .lock()
        .unwrap()
        .add_client(&spectator, None)
        .unwrap();
    spectator_lobby.lock().unwrap().is_spectator_lobby = true;
    {
        let mut l = t.lobby.lock().unwrap();
        l.watcher_lobbies.push(Arc::downgrade(&spectator_lobby));
        l.recorder = Some(Recorder::new(true));
    }

    // Symbol chat carries the always-forward flag.
    let chat = Command::new(0x60, 0, game_sub(Version::V4, 0x07, 0, &[1, 2, 3, 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &chat).unwrap();
    assert_eq!(drain(&mut spectator_rx).len(), 1);

    // Movement does not, before the active phase...
    let walk = Command::new(0x60, 0, game_sub(Version::V4, 0x40, 0, &[0u8; 8]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &walk).unwrap();
    assert!(drain(&mut spectator_rx).is_empty());

    // ...and unconditionally once the game is active.
    t.lobby.lock().unwrap().active_phase = true;
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &walk).unwrap();
    assert_eq!(drain(&mut spectator_rx).len(), 1);

    // The recorder captured the public traffic as game commands.
    let l = t.lobby.lock().unwrap();
    let recorder = l.recorder.as_ref().unwrap();
    assert!(recorder.events().len() >= 3);
    assert!(recorder
        .events()
        .iter()
        .all(|(kind, _)| *kind == RecordedEventKind::GameCommand));
}

#[test]
fn subcommand_zero_is_dropped_without_fanout() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x00, 0, &[0u8; 4]));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();
    assert!(drain(&mut t.receivers[1]).is_empty());
}

#[test]
fn malformed_subcommand_framing_is_fatal() {
    let t = game_lobby(Version::V4, &[Version::V4]);
    // Size field says 3 words but only 8 bytes are present.
    let mut data = game_sub(Version::V4, 0x40, 0, &[0u8; 8]);
    data[1] = 9;
    let cmd = Command::new(0x60, 0, data);
    assert!(handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).is_err());

    let empty = Command::new(0x60, 0, Vec::new());
    assert!(handle_game_command(&t.env, &t.lobby, &t.participants[0], &empty).is_err());
}
