//! Authoritative item handling through the router: ID collision
//! avoidance, pick-up visibility, server drop modes, and the v4 stack
//! split.

mod test_utils;

use crossplay_gateway::core::packet::Command;
use crossplay_gateway::core::types::Version;
use crossplay_gateway::items::data::{make_tool, make_weapon, ItemData};
use crossplay_gateway::lobby::{DropGenerator, DropMode, EntityDropRequest};
use crossplay_gateway::protocol::router::handle_game_command;

use test_utils::{drain, game_lobby, game_sub};

#[test]
fn externally_created_item_ids_push_the_local_counter() {
    let mut t = game_lobby(Version::V2, &[Version::V2, Version::V2]);
    {
        let mut l = t.lobby.lock().unwrap();
        l.on_item_id_generated_externally(0, 0x0021_0000);
    }

    // Participant 0 announces a client-created inventory item.
    let mut item = make_tool(0, 1, 2);
    item.id = 0x0021_0002;
    let mut body = Vec::new();
    body.extend_from_slice(&item.to_wire(Version::V2, &t.env.item_table));
    let cmd = Command::new(0x60, 0, game_sub(Version::V2, 0x2B, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let l = t.lobby.lock().unwrap();
    assert_eq!(l.next_item_id_for_slot(0), 0x0021_0003);
    // The other participant saw the creation.
    drop(l);
    let got = drain(&mut t.receivers[1]);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data[0], 0x2B);
}

#[test]
fn pick_up_honors_the_visibility_mask() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    let mut item = make_weapon(1, 1, 0);
    item.id = 0x0F00_0100;
    {
        let mut l = t.lobby.lock().unwrap();
        // Visible to slot 1 only.
        l.add_item(2, item, 1.0, 2.0, 0b0010);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&0x0F00_0100u32.to_le_bytes());
    body.extend_from_slice(&2u32.to_le_bytes());
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x5A, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    // Semantic drop: item still on the floor, inventory untouched, no
    // fan-out.
    {
        let l = t.lobby.lock().unwrap();
        assert!(l.item_exists(2, 0x0F00_0100));
    }
    assert!(t.participants[0].state.lock().unwrap().inventory.is_empty());
    assert!(drain(&mut t.receivers[1]).is_empty());

    // The participant in the mask succeeds.
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x5A, 1, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[1], &cmd).unwrap();
    {
        let l = t.lobby.lock().unwrap();
        assert!(!l.item_exists(2, 0x0F00_0100));
    }
    assert_eq!(t.participants[1].state.lock().unwrap().inventory.len(), 1);
}

#[test]
fn pick_up_synthesizes_create_for_blind_recipients() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4, Version::V4]);
    let mut item = make_weapon(2, 2, 5);
    item.id = 0x0F00_0200;
    {
        let mut l = t.lobby.lock().unwrap();
        // Slots 0 and 1 can see it; slot 2 cannot.
        l.add_item(1, item, 0.0, 0.0, 0b0011);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&0x0F00_0200u32.to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes());
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x5A, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    // The requester (request path) and the sighted peer get the pick-up
    // notification; the blind peer gets a create-inventory-item instead.
    let own = drain(&mut t.receivers[0]);
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].data[0], 0x59);
    let sighted = drain(&mut t.receivers[1]);
    assert_eq!(sighted.len(), 1);
    assert_eq!(sighted[0].data[0], 0x59);
    let blind = drain(&mut t.receivers[2]);
    assert_eq!(blind.len(), 1);
    assert_eq!(blind[0].data[0], 0x2B);
}

struct FixedDrop(ItemData);

impl DropGenerator for FixedDrop {
    fn generate(&mut self, _request: &EntityDropRequest) -> Option<ItemData> {
        Some(self.0)
    }
}

fn entity_drop_body(entity_id: u16, floor: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&entity_id.to_le_bytes());
    body.push(0x20); // enemy rare-table index (not a box)
    body.push(0);
    body.extend_from_slice(&floor.to_le_bytes());
    body.extend_from_slice(&10.0f32.to_le_bytes());
    body.extend_from_slice(&20.0f32.to_le_bytes());
    body
}

#[test]
fn server_duplicate_drops_mint_one_item_per_participant() {
    let mut t = game_lobby(
        Version::V4,
        &[Version::V4, Version::V4, Version::V4, Version::V4],
    );
    {
        let mut l = t.lobby.lock().unwrap();
        l.drop_mode = DropMode::ServerDuplicate;
        l.item_creator = Some(Box::new(FixedDrop(make_weapon(3, 1, 0))));
    }
    for p in &t.participants {
        p.state.lock().unwrap().floor = 2;
    }

    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x60, 0, &entity_drop_body(0x0123, 2)));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let l = t.lobby.lock().unwrap();
    let items: Vec<_> = l.floor_items().collect();
    assert_eq!(items.len(), 4);
    let mut ids: Vec<u32> = items.iter().map(|i| i.data.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "every copy gets a distinct server ID");
    assert!(ids.iter().all(|&id| id >= 0x0F00_0000));
    for slot in 0..4u8 {
        let visible: Vec<_> = items.iter().filter(|i| i.visible_to_slot(slot)).collect();
        assert_eq!(visible.len(), 1, "slot {slot} sees exactly its own copy");
    }
    drop(l);

    for rx in t.receivers.iter_mut() {
        let got = drain(rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data[0], 0x5F);
    }
}

#[test]
fn redundant_entity_drop_requests_are_deduplicated() {
    let mut t = game_lobby(Version::V4, &[Version::V4]);
    {
        let mut l = t.lobby.lock().unwrap();
        l.drop_mode = DropMode::ServerShared;
        l.item_creator = Some(Box::new(FixedDrop(make_weapon(1, 1, 0))));
    }
    t.participants[0].state.lock().unwrap().floor = 3;

    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x60, 0, &entity_drop_body(0x0042, 3)));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let l = t.lobby.lock().unwrap();
    assert_eq!(l.floor_items().count(), 1, "second request must not drop again");
    drop(l);
    assert_eq!(drain(&mut t.receivers[0]).len(), 1);
}

#[test]
fn disabled_drop_mode_swallows_requests() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    {
        let mut l = t.lobby.lock().unwrap();
        l.drop_mode = DropMode::Disabled;
        l.item_creator = Some(Box::new(FixedDrop(make_weapon(1, 1, 0))));
    }
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x60, 0, &entity_drop_body(0x0099, 1)));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();
    assert_eq!(t.lobby.lock().unwrap().floor_items().count(), 0);
    assert!(drain(&mut t.receivers[1]).is_empty());
}

#[test]
fn v4_stack_split_counters_the_imminent_delete() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    let mut stack = make_tool(0, 1, 10);
    stack.id = 0x00AB_0005;
    t.participants[0]
        .state
        .lock()
        .unwrap()
        .inventory
        .add_item(stack, Version::V4)
        .unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(&0x00AB_0005u32.to_le_bytes());
    body.extend_from_slice(&3u32.to_le_bytes());
    body.extend_from_slice(&2u32.to_le_bytes());
    body.extend_from_slice(&1.0f32.to_le_bytes());
    body.extend_from_slice(&2.0f32.to_le_bytes());
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0xC3, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    // The floor stack got a freshly minted server ID; the split amount was
    // re-added, so the inventory momentarily holds the full ten again.
    let floor_id = {
        let l = t.lobby.lock().unwrap();
        let items: Vec<_> = l.floor_items().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].data.id >= 0x0F00_0000);
        assert_eq!(items[0].data.stack_size(Version::V4), 3);
        items[0].data.id
    };
    {
        let state = t.participants[0].state.lock().unwrap();
        assert_eq!(state.inventory.len(), 1);
        assert_eq!(state.inventory.items()[0].data.id, 0x00AB_0005);
        assert_eq!(state.inventory.items()[0].data.stack_size(Version::V4), 10);
    }
    assert_ne!(floor_id, 0x00AB_0005);

    // The client's follow-up delete removes exactly the split amount.
    let mut body = Vec::new();
    body.extend_from_slice(&0x00AB_0005u32.to_le_bytes());
    body.extend_from_slice(&3u32.to_le_bytes());
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x29, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let state = t.participants[0].state.lock().unwrap();
    assert_eq!(state.inventory.items()[0].data.stack_size(Version::V4), 7);
    assert_eq!(state.inventory.items()[0].data.id, 0x00AB_0005);
}

#[test]
fn item_state_sync_answers_with_authoritative_state() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    // The joiner is still loading.
    t.participants[1].state.lock().unwrap().join_queue = Some(Vec::new());

    // Client-claimed state: the lobby's own counters, no floor items.
    let mut decompressed = Vec::new();
    {
        let l = t.lobby.lock().unwrap();
        for slot in 0..12u8 {
            decompressed.extend_from_slice(&l.next_item_id_for_slot(slot).to_le_bytes());
        }
    }
    decompressed.extend_from_slice(&[0u8; 64]);
    let compressed = crossplay_gateway::utils::sync_codec::compress(&decompressed);

    let mut body = Vec::new();
    body.extend_from_slice(&((16 + compressed.len()) as u32).to_le_bytes());
    body.extend_from_slice(&(decompressed.len() as u32).to_le_bytes());
    body.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    body.extend_from_slice(&compressed);
    let cmd = Command::new(0x6D, 1, game_sub(Version::V4, 0x6D, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    // The target's queue was bypassed: the authoritative state is a fresh
    // server message, not a forwarded join command.
    let got = drain(&mut t.receivers[1]);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].command, 0x6D);
    assert_eq!(got[0].data[0], 0x6D);

    // Its payload decompresses back to the same counters.
    let reply = &got[0].data;
    let decompressed_size =
        u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]) as usize;
    let compressed_size =
        u32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]) as usize;
    let server_state = crossplay_gateway::utils::sync_codec::decompress(
        &reply[16..16 + compressed_size],
    )
    .unwrap();
    assert_eq!(server_state.len(), decompressed_size);
    let l = t.lobby.lock().unwrap();
    for slot in 0..12usize {
        let id = u32::from_le_bytes([
            server_state[slot * 4],
            server_state[slot * 4 + 1],
            server_state[slot * 4 + 2],
            server_state[slot * 4 + 3],
        ]);
        assert_eq!(id, l.next_item_id_for_slot(slot as u8));
    }
}

#[test]
fn drop_item_lands_on_the_floor_with_full_visibility() {
    let mut t = game_lobby(Version::V4, &[Version::V4, Version::V4]);
    let mut item = make_weapon(1, 4, 0);
    item.id = 0x0001_0030;
    t.participants[0]
        .state
        .lock()
        .unwrap()
        .inventory
        .add_item(item, Version::V4)
        .unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(&3u32.to_le_bytes());
    body.extend_from_slice(&7.5f32.to_le_bytes());
    body.extend_from_slice(&8.5f32.to_le_bytes());
    body.extend_from_slice(&0x0001_0030u32.to_le_bytes());
    let cmd = Command::new(0x60, 0, game_sub(Version::V4, 0x2A, 0, &body));
    handle_game_command(&t.env, &t.lobby, &t.participants[0], &cmd).unwrap();

    let l = t.lobby.lock().unwrap();
    let fi = l.floor_item(3, 0x0001_0030).expect("item on the floor");
    for slot in 0..4u8 {
        assert!(fi.visible_to_slot(slot));
    }
    drop(l);
    assert!(t.participants[0].state.lock().unwrap().inventory.is_empty());
    assert_eq!(drain(&mut t.receivers[1]).len(), 1);
}
