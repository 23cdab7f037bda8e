//! # Subcommand Handlers
//!
//! This file is part of the crossplay-gateway project.
//!
//! Handlers interpret in-game subcommands against authoritative lobby
//! state (inventories, floor items, item IDs) and re-emit them, possibly
//! transcoded, to the other participants. Each runs with the lobby lock
//! held; sends only touch per-participant outbound queues, so the whole
//! fan-out of one incoming message completes before the sender's next
//! message is processed.
//!
//! Error discipline: size mismatches and malformed fields are fatal to the
//! offending session; missing items, full inventories, and empty target
//! slots are semantic drops that the router logs and suppresses.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::packet::Command;
use crate::core::types::Version;
use crate::core::wire::{ByteReader, ByteWriter};
use crate::error::{ProtocolError, Result};
use crate::items::data::{ItemData, ITEM_ID_UNASSIGNED, ITEM_SIZE};
use crate::items::snapshot::PlayerSnapshot;
use crate::lobby::{
    DropMode, EntityDropRequest, Lobby, Participant, SharedLobby, SERVER_ITEM_SLOT,
};
use crate::protocol::router::{self, RouterEnv, SUBCOMMAND_HEADER_SIZE};
use crate::protocol::subcommands::{command_is_private, translate_subcommand_number, HandlerId};
use crate::utils::sync_codec;

struct SubHeader {
    client_id: u16,
}

fn parse_header(data: &[u8], version: Version) -> Result<SubHeader> {
    let mut r = ByteReader::new(data, version.is_big_endian());
    r.u8()?;
    r.u8()?;
    Ok(SubHeader {
        client_id: r.u16()?,
    })
}

fn check_exact_size(data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(ProtocolError::SizeMismatch {
            got: data.len(),
            expected,
        });
    }
    Ok(())
}

fn body_reader<'a>(data: &'a [u8], version: Version) -> ByteReader<'a> {
    ByteReader::new(&data[SUBCOMMAND_HEADER_SIZE..], version.is_big_endian())
}

pub(crate) fn run(
    env: &RouterEnv,
    lobby: &SharedLobby,
    sender: &Arc<Participant>,
    handler: HandlerId,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    let mut guard = lobby.lock().map_err(|_| ProtocolError::LobbyGone)?;
    let l = &mut *guard;
    match handler {
        HandlerId::Invalid => on_invalid(l, sender, command, flag, data),
        HandlerId::Unimplemented => {
            router::on_unimplemented(l, sender, command, flag, data);
            Ok(())
        }
        HandlerId::Forward => {
            router::forward_subcommand(l, sender, command, flag, data);
            Ok(())
        }
        HandlerId::ForwardCheckClient => on_forward_check_client(l, sender, command, flag, data),
        HandlerId::ForwardCheckGame => {
            if l.is_game {
                router::forward_subcommand(l, sender, command, flag, data);
            }
            Ok(())
        }
        HandlerId::ForwardCheckLobby => {
            if !l.is_game {
                router::forward_subcommand(l, sender, command, flag, data);
            }
            Ok(())
        }
        HandlerId::ForwardCheckGameClient => {
            let header = parse_header(data, sender.version)?;
            if l.is_game && Some(header.client_id as u8) == l.slot_of(sender) {
                router::forward_subcommand(l, sender, command, flag, data);
            }
            Ok(())
        }
        HandlerId::ForwardCheckGameLoading => {
            if l.is_game && any_client_loading(l) {
                router::forward_subcommand(l, sender, command, flag, data);
            }
            Ok(())
        }
        HandlerId::ChangeFloor => on_change_floor(l, sender, command, flag, data),
        HandlerId::EquipItem => on_equip_item(l, sender, command, flag, data),
        HandlerId::UnequipItem => on_unequip_item(l, sender, command, flag, data),
        HandlerId::DestroyInventoryItem => {
            on_destroy_inventory_item(l, sender, command, flag, data)
        }
        HandlerId::PlayerDropItem => on_player_drop_item(l, sender, command, flag, data),
        HandlerId::CreateInventoryItem => {
            on_create_inventory_item(env, l, sender, command, flag, data)
        }
        HandlerId::PickUpItem => on_pick_up_item(env, l, sender, data, false),
        HandlerId::PickUpItemRequest => on_pick_up_item(env, l, sender, data, true),
        HandlerId::DropPartialStack => on_drop_partial_stack(env, l, sender, command, flag, data),
        HandlerId::BoxOrEnemyItemDrop => {
            on_box_or_enemy_item_drop(env, l, sender, command, flag, data)
        }
        HandlerId::EntityDropRequest => on_entity_drop_request(env, l, sender, command, flag, data),
        HandlerId::DestroyFloorItem => on_destroy_floor_item(l, sender, command, flag, data),
        HandlerId::SyncGameState => on_sync_game_state(l, sender, command, flag, data),
        HandlerId::SyncItemState => on_sync_item_state(env, l, sender, command, flag, data),
        HandlerId::SyncPlayerDispAndInventory => {
            on_sync_disp_and_inventory(env, l, sender, command, flag, data)
        }
        HandlerId::SplitStackedItem => on_split_stacked_item(env, l, sender, command, flag, data),
        HandlerId::StealExp => on_steal_exp(l, sender, data),
    }
}

fn any_client_loading(l: &Lobby) -> bool {
    l.occupied_slots().iter().any(|(_, c)| {
        c.state
            .lock()
            .map(|s| s.join_queue.is_some())
            .unwrap_or(false)
    })
}

fn sender_slot(l: &Lobby, sender: &Arc<Participant>) -> Result<u8> {
    l.slot_of(sender).ok_or(ProtocolError::NotInLobby)
}

fn on_invalid(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    if sender.version.is_pre_v1() {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            "invalid prototype subcommand; forwarding unchanged"
        );
        router::forward_subcommand(l, sender, command, flag, data);
    } else if command_is_private(command) {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            target = flag,
            "invalid subcommand (private)"
        );
    } else {
        warn!(
            gc = sender.guild_card_number,
            subcommand = format_args!("{:02X}", data[0]),
            "invalid subcommand (public)"
        );
    }
    Ok(())
}

fn on_forward_check_client(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    let header = parse_header(data, sender.version)?;
    if Some(header.client_id as u8) == l.slot_of(sender) {
        router::forward_subcommand(l, sender, command, flag, data);
    }
    Ok(())
}

fn on_change_floor(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 12)?;
    let mut r = body_reader(data, sender.version);
    let floor = r.u32()?;
    if let Ok(mut state) = sender.state.lock() {
        state.floor = floor.min(0xFF) as u8;
    }
    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

fn on_equip_item(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 12)?;
    let header = parse_header(data, sender.version)?;
    if Some(header.client_id as u8) != l.slot_of(sender) {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;
    let slot_raw = r.u32()?;

    let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
    let item = state
        .inventory
        .find(item_id)
        .ok_or(ProtocolError::ItemNotFound(item_id))?;
    let data_copy = item.data;
    let slot = match crate::items::data::EquipSlot::from_wire(slot_raw as u8) {
        crate::items::data::EquipSlot::Unknown => data_copy.default_equip_slot(),
        s => s,
    };
    if !data_copy.can_be_equipped_in_slot(slot) {
        return Err(ProtocolError::InvalidField("equip slot"));
    }
    if let Some(entry) = state
        .inventory
        .items_mut()
        .iter_mut()
        .find(|i| i.data.id == item_id)
    {
        entry.flags |= 0x0000_0008;
    }
    drop(state);

    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

fn on_unequip_item(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 12)?;
    let header = parse_header(data, sender.version)?;
    if Some(header.client_id as u8) != l.slot_of(sender) {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;

    let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
    if let Some(entry) = state
        .inventory
        .items_mut()
        .iter_mut()
        .find(|i| i.data.id == item_id)
    {
        entry.flags &= !0x0000_0008;
    }
    drop(state);

    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

fn on_destroy_inventory_item(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 12)?;
    let header = parse_header(data, sender.version)?;
    if Some(header.client_id as u8) != l.slot_of(sender) {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;
    let amount = r.u32()?;

    {
        let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
        state.inventory.remove_item(item_id, amount, sender.version)?;
    }
    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

fn on_player_drop_item(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 20)?;
    let header = parse_header(data, sender.version)?;
    let slot = sender_slot(l, sender)?;
    if header.client_id as u8 != slot {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let floor = r.u32()?;
    let x = r.f32()?;
    let z = r.f32()?;
    let item_id = r.u32()?;

    let item = {
        let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
        state.inventory.remove_item(item_id, 0, sender.version)?
    };
    l.add_item(floor.min(0xFF) as u8, item, x, z, 0x0F);
    info!(
        slot,
        item_id = format_args!("{item_id:08X}"),
        floor,
        "player dropped item"
    );

    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

fn on_create_inventory_item(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, SUBCOMMAND_HEADER_SIZE + ITEM_SIZE)?;
    let header = parse_header(data, sender.version)?;
    let slot = sender_slot(l, sender)?;
    if header.client_id as u8 != slot {
        return Ok(());
    }
    if sender.version == Version::V4 {
        // The final version never creates inventory items client-side;
        // those come only from server responses.
        return Ok(());
    }
    let item = ItemData::from_wire(&data[SUBCOMMAND_HEADER_SIZE..], sender.version)?;
    l.on_item_id_generated_externally(slot, item.id);
    {
        let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
        state.inventory.add_item(item, sender.version)?;
    }
    info!(
        slot,
        item_id = format_args!("{:08X}", item.id),
        "player created inventory item"
    );

    forward_with_item_transcode(env, l, sender, command, flag, data, &item)
}

/// Forward a subcommand whose payload tail is one wire-format item,
/// re-encoding the item for recipients of other versions. Bytes between
/// the header and the item are copied verbatim.
fn forward_with_item_transcode(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
    canonical_item: &ItemData,
) -> Result<()> {
    if command_is_private(command) {
        // Item state must stay in sync for every participant.
        return Err(ProtocolError::InvalidField(
            "item subcommand sent via private command",
        ));
    }
    let item_offset = data.len() - ITEM_SIZE;
    for (_, target) in l.occupied_slots() {
        if Arc::ptr_eq(&target, sender) {
            continue;
        }
        if target.version == sender.version {
            target.send(Command::new(command, flag, data.to_vec()));
            continue;
        }
        let translated = translate_subcommand_number(target.version, sender.version, data[0]);
        if translated == 0 {
            info!(
                gc = target.guild_card_number,
                "subcommand has no counterpart for recipient version"
            );
            continue;
        }
        let mut payload = data.to_vec();
        payload[0] = translated;
        payload[item_offset..]
            .copy_from_slice(&canonical_item.to_wire(target.version, &env.item_table));
        target.send(Command::new(command, flag, payload));
    }
    Ok(())
}

fn build_pick_up_notice(picker_slot: u8, floor: u8, item_id: u32, version: Version) -> Option<Vec<u8>> {
    let number = translate_subcommand_number(version, Version::V4, 0x59);
    if number == 0 {
        return None;
    }
    let mut w = ByteWriter::new(version.is_big_endian());
    w.u8(number).u8(3).u16(picker_slot as u16);
    w.u32(item_id);
    w.u32(floor as u32);
    Some(w.into_vec())
}

fn build_create_item_notice(
    env: &RouterEnv,
    picker_slot: u8,
    item: &ItemData,
    version: Version,
) -> Option<Vec<u8>> {
    let number = translate_subcommand_number(version, Version::V4, 0x2B);
    if number == 0 {
        return None;
    }
    let mut w = ByteWriter::new(version.is_big_endian());
    w.u8(number).u8(6).u16(picker_slot as u16);
    w.bytes(&item.to_wire(version, &env.item_table));
    Some(w.into_vec())
}

fn build_drop_notice(
    env: &RouterEnv,
    from_enemy: bool,
    entity_id: u16,
    floor: u8,
    x: f32,
    z: f32,
    item: &ItemData,
    version: Version,
) -> Option<Vec<u8>> {
    let number = translate_subcommand_number(version, Version::V4, 0x5F);
    if number == 0 {
        return None;
    }
    let mut w = ByteWriter::new(version.is_big_endian());
    w.u8(number).u8(9).u16(0);
    w.u8(floor).u8(from_enemy as u8).u16(entity_id);
    w.f32(x).f32(z);
    w.bytes(&item.to_wire(version, &env.item_table));
    Some(w.into_vec())
}

fn build_stack_drop_notice(
    env: &RouterEnv,
    owner_slot: u8,
    floor: u8,
    x: f32,
    z: f32,
    item: &ItemData,
    version: Version,
) -> Option<Vec<u8>> {
    let number = translate_subcommand_number(version, Version::V4, 0x5D);
    if number == 0 {
        return None;
    }
    let mut w = ByteWriter::new(version.is_big_endian());
    w.u8(number).u8(9).u16(owner_slot as u16);
    w.u32(floor as u32);
    w.f32(x).f32(z);
    w.bytes(&item.to_wire(version, &env.item_table));
    Some(w.into_vec())
}

/// Pick-up (0x59) and pick-up-request (0x5A). Handled authoritatively: the
/// floor item is removed if present and visible, appended to the
/// requester's inventory, and each recipient is told either "picked up"
/// (if it could see the item) or "create inventory item" (if it could
/// not). This is the one case where the server synthesizes a different
/// message per recipient.
fn on_pick_up_item(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    data: &[u8],
    is_request: bool,
) -> Result<()> {
    check_exact_size(data, 12)?;
    let header = parse_header(data, sender.version)?;
    let slot = sender_slot(l, sender)?;
    if !l.is_game || header.client_id as u8 != slot {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;
    let floor = r.u32()?.min(0xFF) as u8;

    let Some(existing) = l.floor_item(floor, item_id) else {
        // Slow networks re-request pick-ups, and two participants can race
        // for the same item; only one wins, the rest drop silently.
        info!(
            slot,
            item_id = format_args!("{item_id:08X}"),
            "pick-up for nonexistent item; dropping command"
        );
        return Ok(());
    };
    if !existing.visible_to_slot(slot) {
        warn!(
            slot,
            item_id = format_args!("{item_id:08X}"),
            "pick-up for item not visible to requester; dropping command"
        );
        return Ok(());
    }

    let fi = l.remove_item(floor, item_id)?;
    {
        let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
        if let Err(e) = state.inventory.add_item(fi.data, sender.version) {
            drop(state);
            warn!(
                slot,
                item_id = format_args!("{item_id:08X}"),
                "inventory full; returning item to the floor"
            );
            l.put_back(fi);
            return Err(e);
        }
    }
    info!(slot, item_id = format_args!("{item_id:08X}"), "picked up item");

    for (z, target) in l.occupied_slots() {
        if !is_request && Arc::ptr_eq(&target, sender) {
            continue;
        }
        let payload = if fi.visible_to_slot(z) {
            build_pick_up_notice(slot, floor, item_id, target.version)
        } else {
            build_create_item_notice(env, slot, &fi.data, target.version)
        };
        match payload {
            Some(payload) => target.send(Command::new(0x60, 0, payload)),
            None => info!(
                gc = target.guild_card_number,
                "pick-up result cannot be translated to recipient version"
            ),
        }
    }
    Ok(())
}

fn on_drop_partial_stack(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, SUBCOMMAND_HEADER_SIZE + 12 + ITEM_SIZE)?;
    if !l.is_game || l.base_version == Version::V4 {
        return Ok(());
    }
    let slot = sender_slot(l, sender)?;
    let mut r = body_reader(data, sender.version);
    let floor = r.u32()?.min(0xFF) as u8;
    let x = r.f32()?;
    let z = r.f32()?;
    let item = ItemData::from_wire(r.slice(ITEM_SIZE)?, sender.version)?;

    l.on_item_id_generated_externally(slot, item.id);
    l.add_item(floor, item, x, z, 0x0F);
    info!(
        slot,
        item_id = format_args!("{:08X}", item.id),
        "split stack to create floor item"
    );

    forward_with_item_transcode(env, l, sender, command, flag, data, &item)
}

/// The v4 split-stack (0xC3). The client immediately follows this with a
/// delete-inventory message that would erase the whole original stack, so
/// the split-off portion is re-added before that delete arrives; the
/// delete then removes exactly the split amount.
fn on_split_stacked_item(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    if l.base_version != Version::V4 {
        router::forward_subcommand(l, sender, command, flag, data);
        return Ok(());
    }
    check_exact_size(data, 24)?;
    let header = parse_header(data, sender.version)?;
    let slot = sender_slot(l, sender)?;
    if !l.is_game || header.client_id as u8 != slot {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;
    let amount = r.u32()?;
    let floor = r.u32()?.min(0xFF) as u8;
    let x = r.f32()?;
    let z = r.f32()?;

    let mut state = sender.state.lock().map_err(|_| ProtocolError::SessionGone)?;
    let mut item = state.inventory.remove_item(item_id, amount, sender.version)?;
    // A split leaves the original entry alive, signalled by the unassigned
    // ID; the floor portion gets a freshly minted server ID.
    if item.id == ITEM_ID_UNASSIGNED {
        item.id = l.generate_item_id(SERVER_ITEM_SLOT);
    }
    state.inventory.add_item(item, sender.version)?;
    drop(state);

    l.add_item(floor, item, x, z, 0x0F);
    info!(
        slot,
        original = format_args!("{item_id:08X}"),
        minted = format_args!("{:08X}", item.id),
        amount,
        "split stacked item"
    );

    for (_, target) in l.occupied_slots() {
        match build_stack_drop_notice(env, slot, floor, x, z, &item, target.version) {
            Some(payload) => target.send(Command::new(0x60, 0, payload)),
            None => info!(
                gc = target.guild_card_number,
                "stack drop cannot be translated to recipient version"
            ),
        }
    }
    Ok(())
}

fn on_box_or_enemy_item_drop(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, SUBCOMMAND_HEADER_SIZE + 12 + ITEM_SIZE)?;
    if command_is_private(command) {
        return Err(ProtocolError::InvalidField(
            "item subcommand sent via private command",
        ));
    }
    let slot = sender_slot(l, sender)?;
    if !l.is_game || slot != l.leader_slot || l.base_version == Version::V4 {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let floor = r.u8()?;
    let _from_enemy = r.u8()?;
    let _entity_id = r.u16()?;
    let x = r.f32()?;
    let z = r.f32()?;
    let item = ItemData::from_wire(r.slice(ITEM_SIZE)?, sender.version)?;

    l.on_item_id_generated_externally(slot, item.id);
    l.add_item(floor, item, x, z, 0x0F);
    info!(
        slot,
        item_id = format_args!("{:08X}", item.id),
        "leader created floor item"
    );

    forward_with_item_transcode(env, l, sender, command, flag, data, &item)
}

fn on_destroy_floor_item(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 12)?;
    let mut r = body_reader(data, sender.version);
    let item_id = r.u32()?;
    let floor = r.u32()?.min(0xFF) as u8;
    l.remove_item(floor, item_id)?;
    router::forward_subcommand(l, sender, command, flag, data);
    Ok(())
}

/// Entity drop requests (0x60). The drop mode decides who mints the item;
/// a per-entity flag deduplicates redundant requests in every server mode.
fn on_entity_drop_request(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    check_exact_size(data, 20)?;
    if !l.is_game {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let entity_id = r.u16()?;
    let rt_index = r.u8()?;
    let ignore_def = r.u8()? != 0;
    let floor = r.u32()?.min(0xFF) as u8;
    let x = r.f32()?;
    let z = r.f32()?;
    let request = EntityDropRequest {
        entity_id,
        rt_index,
        ignore_def,
        floor,
        effective_area: floor,
        x,
        z,
    };

    match l.drop_mode {
        DropMode::Client => {
            // The lobby leader's client is the drop authority.
            let leader = l.leader_slot;
            let sender_slot = l.slot_of(sender);
            if Some(leader) != sender_slot {
                if let Some(target) = l.client_at(leader) {
                    let payload =
                        match translate_subcommand_number(target.version, sender.version, data[0]) {
                            0 => None,
                            n => {
                                let mut p = data.to_vec();
                                p[0] = n;
                                Some(p)
                            }
                        };
                    if let Some(payload) = payload {
                        target.send(Command::new(command, flag, payload));
                    }
                }
            }
            return Ok(());
        }
        DropMode::Disabled => return Ok(()),
        DropMode::ServerShared | DropMode::ServerDuplicate | DropMode::ServerPrivate => {}
    }

    if !l.mark_entity_drop_decided(entity_id) {
        info!(entity_id = format_args!("{entity_id:04X}"), "drop already decided; skipping");
        return Ok(());
    }

    match l.drop_mode {
        DropMode::ServerShared | DropMode::ServerDuplicate => {
            let generated = l
                .item_creator
                .as_mut()
                .and_then(|c| c.generate(&request));
            let Some(item) = generated else {
                info!(entity_id = format_args!("{entity_id:04X}"), "no item was created");
                return Ok(());
            };
            if l.drop_mode == DropMode::ServerDuplicate {
                for (slot, target) in l.occupied_slots() {
                    let eligible = request.is_box()
                        || target
                            .state
                            .lock()
                            .map(|s| s.floor == floor)
                            .unwrap_or(false);
                    if !eligible {
                        continue;
                    }
                    let mut copy = item;
                    copy.id = l.generate_item_id(SERVER_ITEM_SLOT);
                    l.add_item(floor, copy, x, z, 1 << slot);
                    if let Some(payload) = build_drop_notice(
                        env,
                        !request.is_box(),
                        entity_id,
                        floor,
                        x,
                        z,
                        &copy,
                        target.version,
                    ) {
                        target.send(Command::new(0x60, 0, payload));
                    }
                }
            } else {
                let mut shared = item;
                shared.id = l.generate_item_id(SERVER_ITEM_SLOT);
                l.add_item(floor, shared, x, z, 0x0F);
                for (_, target) in l.occupied_slots() {
                    if let Some(payload) = build_drop_notice(
                        env,
                        !request.is_box(),
                        entity_id,
                        floor,
                        x,
                        z,
                        &shared,
                        target.version,
                    ) {
                        target.send(Command::new(0x60, 0, payload));
                    }
                }
            }
        }
        DropMode::ServerPrivate => {
            for (slot, target) in l.occupied_slots() {
                let eligible = request.is_box()
                    || target
                        .state
                        .lock()
                        .map(|s| s.floor == floor)
                        .unwrap_or(false);
                if !eligible {
                    continue;
                }
                let generated = l
                    .item_creator
                    .as_mut()
                    .and_then(|c| c.generate(&request));
                let Some(mut item) = generated else {
                    info!(slot, "no item was created for this participant");
                    continue;
                };
                item.id = l.generate_item_id(SERVER_ITEM_SLOT);
                l.add_item(floor, item, x, z, 1 << slot);
                if let Some(payload) = build_drop_notice(
                    env,
                    !request.is_box(),
                    entity_id,
                    floor,
                    x,
                    z,
                    &item,
                    target.version,
                ) {
                    target.send(Command::new(0x60, 0, payload));
                }
            }
        }
        DropMode::Disabled | DropMode::Client => unreachable!("handled above"),
    }
    Ok(())
}

fn sync_target(l: &Lobby, command: u16, flag: u32) -> Result<Option<(u8, Arc<Participant>)>> {
    if !command_is_private(command) {
        return Err(ProtocolError::InvalidField("sync data sent via public command"));
    }
    if !l.is_game || flag >= crate::lobby::MAX_CLIENTS as u32 {
        return Ok(None);
    }
    Ok(l.client_at(flag as u8).map(|c| (flag as u8, c)))
}

fn on_sync_game_state(
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    if sync_target(l, command, flag)?.is_none() {
        return Ok(());
    }
    if any_client_loading(l) {
        router::forward_subcommand(l, sender, command, flag, data);
    }
    Ok(())
}

/// Joining-player item-state sync (0x6D). The payload is compressed with
/// the bit codec; after validation the server answers with its own
/// authoritative floor-item state so the joiner can never trust a stale or
/// malicious snapshot.
fn on_sync_item_state(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    let Some((target_slot, target)) = sync_target(l, command, flag)? else {
        return Ok(());
    };
    if data.len() < SUBCOMMAND_HEADER_SIZE + 12 {
        return Err(ProtocolError::SizeMismatch {
            got: data.len(),
            expected: SUBCOMMAND_HEADER_SIZE + 12,
        });
    }
    let mut r = body_reader(data, sender.version);
    // Sync subcommands carry an extended 32-bit total alongside the basic
    // header.
    let declared_total = r.u32()? as usize;
    if declared_total > data.len() {
        return Err(ProtocolError::InvalidField("sync total size"));
    }
    let decompressed_size = r.u32()? as usize;
    let (compressed_size, compressed) = if sender.version.is_pre_v1() {
        // The prototype header has no compressed-size field; the payload
        // runs to the end of the subcommand.
        let rest = r.slice(r.remaining())?;
        (rest.len(), rest)
    } else {
        let size = r.u32()? as usize;
        if size > r.remaining() {
            return Err(ProtocolError::InvalidField("compressed size"));
        }
        (size, r.slice(size)?)
    };

    let decompressed = if sender.version.is_pre_v1() {
        // Alignment padding follows the payload; stop at the declared
        // size instead of misreading the pad bytes as operations.
        sync_codec::decompress_limit(&compressed[..compressed_size], decompressed_size)?
    } else {
        sync_codec::decompress(&compressed[..compressed_size])?
    };
    if decompressed.len() < decompressed_size {
        return Err(ProtocolError::DecompressionFailure("short item state"));
    }
    if decompressed.len() < 48 + 64 {
        return Err(ProtocolError::SizeMismatch {
            got: decompressed.len(),
            expected: 48 + 64,
        });
    }
    let mut dr = ByteReader::new(&decompressed, false);
    let mut next_ids = [0u32; 12];
    for id in next_ids.iter_mut() {
        *id = dr.u32()?;
    }
    let mut floor_counts = [0u32; 16];
    let mut total_items = 0usize;
    for count in floor_counts.iter_mut() {
        *count = dr.u32()?;
        total_items += *count as usize;
    }
    if total_items * FLOOR_ITEM_ENTRY_SIZE > dr.remaining() {
        return Err(ProtocolError::SizeMismatch {
            got: dr.remaining(),
            expected: total_items * FLOOR_ITEM_ENTRY_SIZE,
        });
    }

    let target_num_items = target
        .state
        .lock()
        .map(|s| s.inventory.len() as u32)
        .unwrap_or(0);
    let mut any_diverged = false;
    for (z, &client_next) in next_ids.iter().enumerate() {
        let server_next = l.next_item_id_for_slot(z as u8);
        if client_next == server_next {
            info!(slot = z, id = format_args!("{client_next:08X}"), "next item ID matches");
        } else if z as u8 == target_slot && client_next == server_next.wrapping_sub(target_num_items)
        {
            info!(
                slot = z,
                id = format_args!("{client_next:08X}"),
                "next item ID matches value before inventory assignment"
            );
        } else {
            warn!(
                slot = z,
                client = format_args!("{client_next:08X}"),
                server = format_args!("{server_next:08X}"),
                "next item ID diverges from expected value"
            );
            any_diverged = true;
        }
    }
    if any_diverged {
        warn!(slot = target_slot, "item ID state diverged; re-sending authoritative state");
    }

    send_game_item_state(env, l, target_slot, &target);
    Ok(())
}

const FLOOR_ITEM_ENTRY_SIZE: usize = 12 + ITEM_SIZE;

/// Authoritative floor-item state, compressed and sent privately to one
/// participant.
pub fn send_game_item_state(
    env: &RouterEnv,
    l: &Lobby,
    target_slot: u8,
    target: &Arc<Participant>,
) {
    let mut w = ByteWriter::new(false);
    for z in 0..12u8 {
        w.u32(l.next_item_id_for_slot(z));
    }
    for floor in 0..16u8 {
        w.u32(l.floor_item_count(floor) as u32);
    }
    for floor in 0..16u8 {
        for item in l.floor_items().filter(|i| i.floor == floor) {
            w.u32(item.floor as u32);
            w.f32(item.x);
            w.f32(item.z);
            w.bytes(&item.data.to_wire(target.version, &env.item_table));
        }
    }
    let decompressed = w.into_vec();
    let compressed = sync_codec::compress(&decompressed);

    let number = translate_subcommand_number(target.version, Version::V4, 0x6D);
    if number == 0 {
        return;
    }
    let mut sub = ByteWriter::new(target.version.is_big_endian());
    sub.u8(number).u8(0).u16(target_slot as u16);
    if target.version.is_pre_v1() {
        let total = 8 + 4 + compressed.len();
        sub.u32(((total + 3) & !3) as u32);
        sub.u32(decompressed.len() as u32);
    } else {
        let total = 8 + 8 + compressed.len();
        sub.u32(((total + 3) & !3) as u32);
        sub.u32(decompressed.len() as u32);
        sub.u32(compressed.len() as u32);
    }
    sub.bytes(&compressed);
    sub.align(4);
    let mut payload = sub.into_vec();
    // The total may exceed what the one-byte word count can carry, so the
    // size byte stays 0 and the extended total governs.
    if payload.len() / 4 <= 0xFF {
        payload[1] = (payload.len() / 4) as u8;
    }
    target.send(Command::new(0x6D, target_slot as u32, payload));
}

/// Joining-player display/inventory sync (0x70). Parsed through the
/// snapshot codec and re-emitted in the target's variant. A pre-v1 sender
/// never sends the end-of-state marker its successors expect, so the
/// marker is synthesized here before the snapshot is delivered.
fn on_sync_disp_and_inventory(
    env: &RouterEnv,
    l: &mut Lobby,
    sender: &Arc<Participant>,
    command: u16,
    flag: u32,
    data: &[u8],
) -> Result<()> {
    // This command can arrive after the joiner finished loading on some
    // versions, so loading is not checked here.
    let Some((target_slot, target)) = sync_target(l, command, flag)? else {
        return Ok(());
    };
    if sender.version.is_pre_v1() && !target.version.is_pre_v1() {
        let marker = Command::new(0x62, target_slot as u32, vec![0x71, 0x01, 0x00, 0x00]);
        target.send_or_queue(marker, true);
    }

    let expected = crate::items::snapshot::snapshot_size_for_version(sender.version);
    if data.len() < SUBCOMMAND_HEADER_SIZE + expected {
        return Err(ProtocolError::SizeMismatch {
            got: data.len(),
            expected: SUBCOMMAND_HEADER_SIZE + expected,
        });
    }
    // The subcommand is padded to a 4-byte boundary; parse the exact
    // record and ignore the pad.
    let snapshot = PlayerSnapshot::parse(
        sender.version,
        &data[SUBCOMMAND_HEADER_SIZE..SUBCOMMAND_HEADER_SIZE + expected],
    )?;
    let number = translate_subcommand_number(target.version, sender.version, data[0]);
    if number == 0 {
        info!(
            gc = target.guild_card_number,
            "snapshot cannot be translated to recipient version"
        );
        return Ok(());
    }
    let mut sub = ByteWriter::new(target.version.is_big_endian());
    sub.u8(number).u8(0).u16(target_slot as u16);
    sub.bytes(&snapshot.emit(target.version, &env.item_table));
    sub.align(4);
    let mut payload = sub.into_vec();
    payload[1] = (payload.len() / 4).min(0xFF) as u8;
    target.send_or_queue(Command::new(0x62, target_slot as u32, payload), true);
    Ok(())
}

/// Historical EXP-steal multipliers: +30% on episode 2, +30% for android
/// classes on the highest difficulty.
pub fn compute_stolen_exp(
    base_exp: u32,
    steal_percent: u8,
    episode: u8,
    difficulty: u8,
    is_android: bool,
) -> u32 {
    let mut exp = base_exp as u64 * steal_percent.min(100) as u64 / 100;
    if episode == 2 {
        exp = exp * 130 / 100;
    }
    if is_android && difficulty == 3 {
        exp = exp * 130 / 100;
    }
    exp as u32
}

fn on_steal_exp(l: &mut Lobby, sender: &Arc<Participant>, data: &[u8]) -> Result<()> {
    check_exact_size(data, 12)?;
    if !l.is_game || l.base_version != Version::V4 {
        return Ok(());
    }
    let mut r = body_reader(data, sender.version);
    let base_exp = r.u32()?;
    let steal_percent = r.u8()?;
    let is_android = r.u8()? != 0;
    let exp = compute_stolen_exp(base_exp, steal_percent, l.episode, l.difficulty, is_android);
    if exp > 0 {
        let mut w = ByteWriter::new(sender.version.is_big_endian());
        w.u8(0xBF).u8(2).u16(0);
        w.u32(exp);
        sender.send(Command::new(0x60, 0, w.into_vec()));
    }
    Ok(())
}
