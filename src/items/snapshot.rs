//! # Player-State Snapshot Codec
//!
//! This file is part of the crossplay-gateway project.
//!
//! When a participant joins an in-progress game, its display state, stats,
//! and inventory are exchanged via a version-specific record. Six wire
//! variants exist: the two pre-v1 prototypes, the shared v1/v2 shape, the
//! two v3 shapes (cube = big-endian, box = extended), and v4. Everything
//! parses into the version-neutral [`PlayerSnapshot`]; emitting for a
//! recipient produces that recipient's variant with absent fields defaulted
//! deterministically.
//!
//! Unused-field masks per variant: the prototypes carry no bonus stats,
//! battle team, technique levels, floor, or item extension bytes; v1/v2
//! carry no floor or set-top identity; only v4 carries the separate
//! marker-tagged name field. Inventory items pass through the item codec in
//! both directions, so mag quirks are compensated before any comparison.

use crate::core::text::{self, Language, TextEncoding};
use crate::core::types::Version;
use crate::core::wire::{ByteReader, ByteWriter};
use crate::error::{ProtocolError, Result};
use crate::items::data::{ItemData, ITEM_SIZE};
use crate::items::inventory::InventoryItem;
use crate::items::table::ItemDefinitionTable;

pub const MAX_SNAPSHOT_ITEMS: usize = 30;

const PROTO_ITEM_ENTRY_SIZE: usize = 4 + ITEM_SIZE;
const ITEM_ENTRY_SIZE: usize = 8 + ITEM_SIZE;
const BASE_SIZE: usize = 82;

pub const SNAPSHOT_SIZE_PROTO_A: usize = BASE_SIZE + 12 + MAX_SNAPSHOT_ITEMS * PROTO_ITEM_ENTRY_SIZE;
pub const SNAPSHOT_SIZE_PROTO_B: usize = BASE_SIZE + 24 + MAX_SNAPSHOT_ITEMS * PROTO_ITEM_ENTRY_SIZE;
pub const SNAPSHOT_SIZE_V1_V2: usize = BASE_SIZE + 32 + MAX_SNAPSHOT_ITEMS * ITEM_ENTRY_SIZE;
pub const SNAPSHOT_SIZE_V3_CUBE: usize = SNAPSHOT_SIZE_V1_V2 + 4;
pub const SNAPSHOT_SIZE_V3_BOX: usize = SNAPSHOT_SIZE_V1_V2 + 16;
pub const SNAPSHOT_SIZE_V4: usize = SNAPSHOT_SIZE_V1_V2 + 40;

pub fn snapshot_size_for_version(version: Version) -> usize {
    match version {
        Version::ProtoA => SNAPSHOT_SIZE_PROTO_A,
        Version::ProtoB => SNAPSHOT_SIZE_PROTO_B,
        Version::V1 | Version::V2 => SNAPSHOT_SIZE_V1_V2,
        Version::V3Cube => SNAPSHOT_SIZE_V3_CUBE,
        Version::V3Box => SNAPSHOT_SIZE_V3_BOX,
        Version::V4 => SNAPSHOT_SIZE_V4,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisualConfig {
    pub name_raw: [u8; 16],
    pub char_class: u8,
    pub costume: u8,
    pub skin: u8,
    pub hair: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub atp: u16,
    pub mst: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
    pub level: u32,
    pub exp: u32,
    pub meseta: u32,
}

#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub language: u8,
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub battle_team_number: u32,
    pub bonus_hp: u16,
    pub bonus_tp: u16,
    pub technique_levels: [u8; 20],
    pub telepipe: [u8; 16],
    pub area: u32,
    pub floor: u32,
    pub flags2: u32,
    pub visual: VisualConfig,
    pub name: String,
    pub stats: PlayerStats,
    pub num_items: u32,
    pub items: [InventoryItem; MAX_SNAPSHOT_ITEMS],
    pub xb_user_id: u64,
    pub xb_extra: u32,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        PlayerSnapshot {
            language: 0,
            player_tag: 0x0001_0000,
            guild_card_number: 0,
            battle_team_number: 0,
            bonus_hp: 0,
            bonus_tp: 0,
            technique_levels: [0xFF; 20],
            telepipe: [0; 16],
            area: 0,
            floor: 0,
            flags2: 0,
            visual: VisualConfig::default(),
            name: String::new(),
            stats: PlayerStats::default(),
            num_items: 0,
            items: [InventoryItem::default(); MAX_SNAPSHOT_ITEMS],
            xb_user_id: 0,
            xb_extra: 0,
        }
    }
}

impl PlayerSnapshot {
    fn default_xb_user_id(guild_card_number: u32) -> u64 {
        0xAE00_0000_0000_0000 | guild_card_number as u64
    }

    /// Parse any variant into the neutral form. The sender's version
    /// selects the layout; a size mismatch is a protocol violation.
    pub fn parse(version: Version, data: &[u8]) -> Result<PlayerSnapshot> {
        let expected = snapshot_size_for_version(version);
        if data.len() != expected {
            return Err(ProtocolError::SizeMismatch {
                got: data.len(),
                expected,
            });
        }
        let mut r = ByteReader::new(data, version.is_big_endian());
        let mut snap = PlayerSnapshot::default();

        snap.language = r.u8()?;
        r.u8()?;
        r.u16()?;
        snap.player_tag = r.u32()?;
        snap.guild_card_number = r.u32()?;
        snap.telepipe = r.bytes::<16>()?;
        snap.area = r.u32()?;
        snap.flags2 = r.u32()?;
        snap.visual.name_raw = r.bytes::<16>()?;
        snap.visual.char_class = r.u8()?;
        snap.visual.costume = r.u8()?;
        snap.visual.skin = r.u8()?;
        snap.visual.hair = r.u8()?;
        snap.stats = read_stats(&mut r)?;
        snap.floor = snap.area;
        snap.xb_user_id = Self::default_xb_user_id(snap.guild_card_number);

        match version {
            Version::ProtoA => {
                // Two words nothing downstream interprets; kept only so
                // re-emitting to the same variant is loss-free.
                r.u32()?;
                r.u32()?;
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, true)?;
            }
            Version::ProtoB => {
                snap.bonus_hp = r.u16()?;
                snap.bonus_tp = r.u16()?;
                r.slice(16)?;
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, true)?;
            }
            Version::V1 | Version::V2 => {
                snap.bonus_hp = r.u16()?;
                snap.bonus_tp = r.u16()?;
                snap.battle_team_number = r.u32()?;
                snap.technique_levels = r.bytes::<20>()?;
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, false)?;
            }
            Version::V3Cube => {
                snap.bonus_hp = r.u16()?;
                snap.bonus_tp = r.u16()?;
                snap.battle_team_number = r.u32()?;
                snap.technique_levels = r.bytes::<20>()?;
                snap.floor = r.u32()?;
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, false)?;
            }
            Version::V3Box => {
                snap.bonus_hp = r.u16()?;
                snap.bonus_tp = r.u16()?;
                snap.battle_team_number = r.u32()?;
                snap.technique_levels = r.bytes::<20>()?;
                snap.floor = r.u32()?;
                snap.xb_user_id = r.u64()?;
                snap.xb_extra = r.u32()?;
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, false)?;
            }
            Version::V4 => {
                snap.bonus_hp = r.u16()?;
                snap.bonus_tp = r.u16()?;
                snap.battle_team_number = r.u32()?;
                snap.technique_levels = r.bytes::<20>()?;
                snap.floor = r.u32()?;
                snap.xb_user_id = r.u64()?;
                snap.xb_extra = r.u32()?;
                let name_field = r.bytes::<24>()?;
                snap.name = text::decode_fixed(&name_field, TextEncoding::Utf16);
                snap.num_items = r.u32()?;
                read_items(&mut r, version, &mut snap.items, false)?;
            }
        }

        if snap.num_items as usize > MAX_SNAPSHOT_ITEMS {
            return Err(ProtocolError::InvalidField("num_items"));
        }
        if version != Version::V4 {
            snap.name = text::decode_fixed(&snap.visual.name_raw, TextEncoding::Ascii);
        }
        if version == Version::V1 || version.is_pre_v1() {
            snap.clear_v1_unused_item_fields();
        }
        Ok(snap)
    }

    /// Emit the variant matching `recipient`. Slots beyond `num_items` are
    /// zeroed, extension fields are cleared for v1 recipients, and items
    /// are re-encoded for the recipient through the item codec.
    pub fn emit(&self, recipient: Version, table: &ItemDefinitionTable) -> Vec<u8> {
        let mut out = self.clone();
        for slot in out.items.iter_mut().skip(self.num_items as usize) {
            *slot = InventoryItem::default();
        }
        if recipient == Version::V1 || recipient.is_pre_v1() {
            out.clear_v1_unused_item_fields();
        } else {
            // Later entries never carry extension data on any version.
            for item in out.items.iter_mut().skip(20) {
                item.extension_data1 = 0;
            }
            for item in out.items.iter_mut().skip(16) {
                item.extension_data2 = 0;
            }
        }

        let mut w = ByteWriter::new(recipient.is_big_endian());
        w.u8(out.language).u8(0).u16(0);
        w.u32(out.player_tag);
        w.u32(out.guild_card_number);
        w.bytes(&out.telepipe);
        w.u32(out.area);
        w.u32(out.flags2);
        if recipient == Version::V4 {
            // The v4 record carries the display name separately; the
            // visual name slot shows the guild card number instead.
            let gc_text = format!("{:>10}", out.guild_card_number);
            let encoded = text::encode_fixed(&gc_text, 16, TextEncoding::Ascii);
            w.bytes(&encoded);
        } else {
            w.bytes(&out.visual.name_raw);
        }
        w.u8(out.visual.char_class)
            .u8(out.visual.costume)
            .u8(out.visual.skin)
            .u8(out.visual.hair);
        write_stats(&mut w, &out.stats);

        match recipient {
            Version::ProtoA => {
                w.u32(0).u32(0);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, true, table);
            }
            Version::ProtoB => {
                w.u16(out.bonus_hp).u16(out.bonus_tp);
                w.bytes(&[0u8; 16]);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, true, table);
            }
            Version::V1 | Version::V2 => {
                w.u16(out.bonus_hp).u16(out.bonus_tp);
                w.u32(out.battle_team_number);
                w.bytes(&out.technique_levels);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, false, table);
            }
            Version::V3Cube => {
                w.u16(out.bonus_hp).u16(out.bonus_tp);
                w.u32(out.battle_team_number);
                w.bytes(&out.technique_levels);
                w.u32(out.floor);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, false, table);
            }
            Version::V3Box => {
                w.u16(out.bonus_hp).u16(out.bonus_tp);
                w.u32(out.battle_team_number);
                w.bytes(&out.technique_levels);
                w.u32(out.floor);
                w.u64(out.xb_user_id);
                w.u32(out.xb_extra);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, false, table);
            }
            Version::V4 => {
                w.u16(out.bonus_hp).u16(out.bonus_tp);
                w.u32(out.battle_team_number);
                w.bytes(&out.technique_levels);
                w.u32(out.floor);
                w.u64(out.xb_user_id);
                w.u32(out.xb_extra);
                let name_field = text::encode_fixed_with_marker(
                    &out.name,
                    Language::from_byte(out.language),
                    24,
                    TextEncoding::Utf16,
                );
                w.bytes(&name_field);
                w.u32(out.num_items);
                write_items(&mut w, recipient, &out.items, false, table);
            }
        }
        w.into_vec()
    }

    fn clear_v1_unused_item_fields(&mut self) {
        for item in self.items.iter_mut() {
            item.extension_data1 = 0;
            item.extension_data2 = 0;
        }
    }
}

fn read_stats(r: &mut ByteReader<'_>) -> Result<PlayerStats> {
    Ok(PlayerStats {
        atp: r.u16()?,
        mst: r.u16()?,
        evp: r.u16()?,
        hp: r.u16()?,
        dfp: r.u16()?,
        ata: r.u16()?,
        lck: r.u16()?,
        level: r.u32()?,
        exp: r.u32()?,
        meseta: r.u32()?,
    })
}

fn write_stats(w: &mut ByteWriter, s: &PlayerStats) {
    w.u16(s.atp)
        .u16(s.mst)
        .u16(s.evp)
        .u16(s.hp)
        .u16(s.dfp)
        .u16(s.ata)
        .u16(s.lck)
        .u32(s.level)
        .u32(s.exp)
        .u32(s.meseta);
}

fn read_items(
    r: &mut ByteReader<'_>,
    version: Version,
    items: &mut [InventoryItem; MAX_SNAPSHOT_ITEMS],
    proto_layout: bool,
) -> Result<()> {
    for item in items.iter_mut() {
        if proto_layout {
            item.present = r.u16()? != 0;
            item.flags = r.u16()? as u32;
            item.extension_data1 = 0;
            item.extension_data2 = 0;
        } else {
            item.present = r.u16()? != 0;
            item.extension_data1 = r.u8()?;
            item.extension_data2 = r.u8()?;
            item.flags = r.u32()?;
        }
        item.data = ItemData::from_wire(r.slice(ITEM_SIZE)?, version)?;
    }
    Ok(())
}

fn write_items(
    w: &mut ByteWriter,
    version: Version,
    items: &[InventoryItem; MAX_SNAPSHOT_ITEMS],
    proto_layout: bool,
    table: &ItemDefinitionTable,
) {
    for item in items.iter() {
        if proto_layout {
            w.u16(item.present as u16);
            w.u16(item.flags as u16);
        } else {
            w.u16(item.present as u16);
            w.u8(item.extension_data1);
            w.u8(item.extension_data2);
            w.u32(item.flags);
        }
        w.bytes(&item.data.to_wire(version, table));
    }
}
