//! # Item Codec
//!
//! This file is part of the crossplay-gateway project.
//!
//! The canonical in-memory item is a 20-octet packed record: 12 octets of
//! kind-dependent data, a 32-bit server-assigned ID, and 4 more octets of
//! kind-dependent data. The leading octet selects the interpretation; the
//! per-kind rules live in one table indexed by that octet rather than in
//! ad-hoc branches.
//!
//! ## Canonical layouts
//! ```text
//!          data1/0  data1/4  data1/8  data2
//! Weapon:  00GGTTRR SS00AABB AABBAABB 00000000
//! Armor:   0101TT00 FF00DDDD EEEE0000 00000000
//! Shield:  0102TT00 FF00DDDD EEEE0000 00000000
//! Unit:    0103TT00 FF00MMMM 00000000 00000000
//! Mag:     02TTLLWW HHHHIIII JJJJKKKK FFQQYYVV
//! Tool:    03TTTTFF 00CC0000 00000000 00000000
//! Meseta:  04000000 00000000 00000000 AAAAAAAA
//! ```
//! `TT` subkind, `GG` weapon group, `RR` grind, `SS` weapon flags+special,
//! `A/B` attribute type/amount pairs, `DD`/`EE` defense/evasion bonuses,
//! `MM` unit modifier, `HH/II/JJ/KK` mag def/pow/dex/mind (hundredths),
//! `LL` mag level, `WW` photon blasts, `FF` flags, `QQ` mag IQ, `YY` mag
//! synchro, `VV` mag color, `CC` tool stack, `AAAA` meseta amount.
//!
//! Two cross-version quirks are compensated here: the big-endian v3 client
//! byte-swaps mag `data2` on the wire, and the pre-v3 retail line uses a
//! packed legacy mag layout that stores dex and mind only as whole levels
//! (the sub-level remainder is not representable there).

use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::items::table::ItemDefinitionTable;
use std::cmp::Ordering;

pub const ITEM_SIZE: usize = 20;

/// ID value meaning "not yet assigned by the server".
pub const ITEM_ID_UNASSIGNED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Weapon,
    Armor,
    Shield,
    Unit,
    Mag,
    Tool,
    Meseta,
}

/// Equip slot indices as clients send them. `Unknown` means the receiving
/// side must derive the slot from the item itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipSlot {
    Unknown,
    Mag,
    Armor,
    Shield,
    Weapon,
    Unit1,
    Unit2,
    Unit3,
    Unit4,
}

impl EquipSlot {
    pub fn from_wire(v: u8) -> EquipSlot {
        match v {
            0x01 => EquipSlot::Mag,
            0x02 => EquipSlot::Armor,
            0x03 => EquipSlot::Shield,
            0x06 => EquipSlot::Weapon,
            0x09 => EquipSlot::Unit1,
            0x0A => EquipSlot::Unit2,
            0x0B => EquipSlot::Unit3,
            0x0C => EquipSlot::Unit4,
            _ => EquipSlot::Unknown,
        }
    }
}

/// Per-kind invariants, indexed by the leading kind octet.
struct KindProperties {
    name: &'static str,
    /// data1 indices that act as sort subkeys after the kind octet.
    sort_subkeys: &'static [usize],
    /// Tools stack; everything else does not (meseta is an amount, not a
    /// stack).
    stackable: bool,
    equip_slot: Option<EquipSlot>,
}

static KIND_TABLE: [KindProperties; 5] = [
    KindProperties {
        name: "weapon",
        sort_subkeys: &[1, 2, 3],
        stackable: false,
        equip_slot: Some(EquipSlot::Weapon),
    },
    KindProperties {
        name: "armor-class",
        sort_subkeys: &[1, 2],
        stackable: false,
        equip_slot: Some(EquipSlot::Armor),
    },
    KindProperties {
        name: "mag",
        sort_subkeys: &[1, 2],
        stackable: false,
        equip_slot: Some(EquipSlot::Mag),
    },
    KindProperties {
        name: "tool",
        sort_subkeys: &[1, 2, 5],
        stackable: true,
        equip_slot: None,
    },
    KindProperties {
        name: "meseta",
        sort_subkeys: &[],
        stackable: false,
        equip_slot: None,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemData {
    pub data1: [u8; 12],
    pub id: u32,
    pub data2: [u8; 4],
}

impl Default for ItemData {
    fn default() -> Self {
        ItemData {
            data1: [0; 12],
            id: ITEM_ID_UNASSIGNED,
            data2: [0; 4],
        }
    }
}

impl ItemData {
    pub fn new(data1: [u8; 12], data2: [u8; 4]) -> ItemData {
        ItemData {
            data1,
            id: ITEM_ID_UNASSIGNED,
            data2,
        }
    }

    pub fn clear(&mut self) {
        *self = ItemData::default();
        self.id = 0;
    }

    pub fn empty(&self) -> bool {
        self.data1.iter().all(|&b| b == 0)
    }

    fn props(&self) -> &'static KindProperties {
        &KIND_TABLE[(self.data1[0] as usize).min(KIND_TABLE.len() - 1)]
    }

    pub fn kind(&self) -> ItemKind {
        match self.data1[0] {
            0x00 => ItemKind::Weapon,
            0x01 => match self.data1[1] {
                0x02 => ItemKind::Shield,
                0x03 => ItemKind::Unit,
                _ => ItemKind::Armor,
            },
            0x02 => ItemKind::Mag,
            0x03 => ItemKind::Tool,
            _ => ItemKind::Meseta,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.props().name
    }

    /// 32-bit fingerprint used as a lookup key into external tables. It
    /// depends only on kind and subkind, never on per-instance state.
    pub fn primary_identifier(&self) -> u32 {
        match self.data1[0] {
            0x00 => 0x0000_0000 | ((self.data1[1] as u32) << 16) | ((self.data1[2] as u32) << 8),
            0x01 => 0x0100_0000 | ((self.data1[1] as u32) << 16) | ((self.data1[2] as u32) << 8),
            0x02 => 0x0200_0000 | ((self.data1[1] as u32) << 16),
            0x03 => {
                if self.data1[1] == 0x02 {
                    // Technique disks key on the technique number, not the
                    // disk level.
                    0x0302_0000 | (self.data1[4] as u32)
                } else {
                    0x0300_0000 | ((self.data1[1] as u32) << 16) | ((self.data1[2] as u32) << 8)
                }
            }
            _ => 0x0400_0000,
        }
    }

    pub fn is_stackable(&self, _version: Version) -> bool {
        // Technique disks are the one tool that never stacks.
        self.props().stackable && !(self.data1[0] == 0x03 && self.data1[1] == 0x02)
    }

    pub fn stack_size(&self, version: Version) -> u32 {
        if self.data1[0] == 0x04 {
            u32::from_le_bytes(self.data2)
        } else if self.is_stackable(version) {
            (self.data1[5] as u32).max(1)
        } else {
            1
        }
    }

    pub fn max_stack_size(&self, version: Version, table: &ItemDefinitionTable) -> u32 {
        if self.is_stackable(version) {
            table.max_stack_size(self.primary_identifier())
        } else {
            1
        }
    }

    pub fn set_stack_size(&mut self, amount: u32) {
        if self.data1[0] == 0x04 {
            self.data2 = amount.to_le_bytes();
        } else {
            self.data1[5] = amount.min(0xFF) as u8;
        }
    }

    /// A tool received with stack byte 0 means one item.
    pub fn enforce_min_stack_size(&mut self, version: Version) {
        if self.is_stackable(version) && self.data1[5] == 0 {
            self.data1[5] = 1;
        }
    }

    pub fn default_equip_slot(&self) -> EquipSlot {
        match self.kind() {
            ItemKind::Weapon => EquipSlot::Weapon,
            ItemKind::Armor => EquipSlot::Armor,
            ItemKind::Shield => EquipSlot::Shield,
            ItemKind::Unit => EquipSlot::Unit1,
            ItemKind::Mag => EquipSlot::Mag,
            _ => EquipSlot::Unknown,
        }
    }

    pub fn can_be_equipped_in_slot(&self, slot: EquipSlot) -> bool {
        match self.kind() {
            ItemKind::Weapon => slot == EquipSlot::Weapon,
            ItemKind::Armor => slot == EquipSlot::Armor,
            ItemKind::Shield => slot == EquipSlot::Shield,
            ItemKind::Unit => matches!(
                slot,
                EquipSlot::Unit1 | EquipSlot::Unit2 | EquipSlot::Unit3 | EquipSlot::Unit4
            ),
            ItemKind::Mag => slot == EquipSlot::Mag,
            ItemKind::Tool | ItemKind::Meseta => false,
        }
    }

    /// Total order used for inventory display: leading kind octet first,
    /// then the kind's subkeys from the table, then the full record so the
    /// order is stable for otherwise-equal items.
    pub fn compare_for_sort(a: &ItemData, b: &ItemData) -> Ordering {
        a.data1[0]
            .cmp(&b.data1[0])
            .then_with(|| {
                for &idx in a.props().sort_subkeys {
                    let ord = a.data1[idx].cmp(&b.data1[idx]);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
            .then_with(|| {
                if a.data1[0] == 0x04 {
                    u32::from_le_bytes(a.data2).cmp(&u32::from_le_bytes(b.data2))
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| a.data1.cmp(&b.data1))
            .then_with(|| a.data2.cmp(&b.data2))
    }

    // -- mag helpers -------------------------------------------------------

    pub fn mag_def(&self) -> u16 {
        u16::from_le_bytes([self.data1[4], self.data1[5]])
    }

    pub fn mag_pow(&self) -> u16 {
        u16::from_le_bytes([self.data1[6], self.data1[7]])
    }

    pub fn mag_dex(&self) -> u16 {
        u16::from_le_bytes([self.data1[8], self.data1[9]])
    }

    pub fn mag_mind(&self) -> u16 {
        u16::from_le_bytes([self.data1[10], self.data1[11]])
    }

    pub fn compute_mag_level(&self) -> u16 {
        self.mag_def() / 100 + self.mag_pow() / 100 + self.mag_dex() / 100 + self.mag_mind() / 100
    }

    /// Normalize an item that just arrived from a client of `version` into
    /// canonical form.
    pub fn decode_for_version(&mut self, version: Version) {
        if self.data1[0] == 0x02 {
            if version.is_big_endian() {
                // This client erroneously byte-swaps mag data2 on the wire.
                self.data2.reverse();
            }
            if version.uses_legacy_mag_format() {
                self.decode_legacy_mag();
            }
        }
        self.enforce_min_stack_size(version);
    }

    /// Inverse of `decode_for_version`: produce the in-memory value a
    /// client of `version` expects to see on the wire. The definition
    /// table supplies stack limits so overlong stacks never reach clients
    /// that cannot represent them.
    pub fn encode_for_version(&mut self, version: Version, table: &ItemDefinitionTable) {
        if self.is_stackable(version) {
            let max = table.max_stack_size(self.primary_identifier());
            if (self.data1[5] as u32) > max {
                self.data1[5] = max.min(0xFF) as u8;
            }
        }
        if self.data1[0] == 0x02 {
            if version.uses_legacy_mag_format() {
                self.encode_legacy_mag();
            }
            if version.is_big_endian() {
                self.data2.reverse();
            }
        }
    }

    /// Expand the pre-v3 packed mag layout into canonical form. The legacy
    /// layout keeps def and pow in full but stores dex and mind as whole
    /// levels only.
    fn decode_legacy_mag(&mut self) {
        let def = u16::from_le_bytes([self.data1[4], self.data1[5]]);
        let pow = u16::from_le_bytes([self.data1[6], self.data1[7]]);
        let dex = (self.data1[8] as u16) * 100;
        let mind = (self.data1[9] as u16) * 100;
        let flags = self.data1[10];
        let iq = self.data1[11];
        let synchro = self.data2[0];
        let color = self.data2[1];

        self.data1[4..6].copy_from_slice(&def.to_le_bytes());
        self.data1[6..8].copy_from_slice(&pow.to_le_bytes());
        self.data1[8..10].copy_from_slice(&dex.to_le_bytes());
        self.data1[10..12].copy_from_slice(&mind.to_le_bytes());
        self.data2 = [flags, iq, synchro, color];
        self.data1[2] = (self.compute_mag_level().min(200)) as u8;
    }

    fn encode_legacy_mag(&mut self) {
        let def = self.mag_def();
        let pow = self.mag_pow();
        let dex_level = (self.mag_dex() / 100).min(0xFF) as u8;
        let mind_level = (self.mag_mind() / 100).min(0xFF) as u8;
        let [flags, iq, synchro, color] = self.data2;

        self.data1[2] = (self.compute_mag_level().min(200)) as u8;
        self.data1[4..6].copy_from_slice(&def.to_le_bytes());
        self.data1[6..8].copy_from_slice(&pow.to_le_bytes());
        self.data1[8] = dex_level;
        self.data1[9] = mind_level;
        self.data1[10] = flags;
        self.data1[11] = iq;
        self.data2 = [synchro, color, 0, 0];
    }

    // -- wire form ---------------------------------------------------------

    pub fn from_wire(raw: &[u8], version: Version) -> Result<ItemData> {
        if raw.len() < ITEM_SIZE {
            return Err(ProtocolError::SizeMismatch {
                got: raw.len(),
                expected: ITEM_SIZE,
            });
        }
        let mut data1 = [0u8; 12];
        data1.copy_from_slice(&raw[..12]);
        let id = if version.is_big_endian() {
            u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]])
        } else {
            u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]])
        };
        let mut data2 = [0u8; 4];
        data2.copy_from_slice(&raw[16..20]);
        let mut item = ItemData { data1, id, data2 };
        item.decode_for_version(version);
        Ok(item)
    }

    pub fn to_wire(&self, version: Version, table: &ItemDefinitionTable) -> [u8; ITEM_SIZE] {
        let mut copy = *self;
        copy.encode_for_version(version, table);
        let mut out = [0u8; ITEM_SIZE];
        out[..12].copy_from_slice(&copy.data1);
        let id_bytes = if version.is_big_endian() {
            copy.id.to_be_bytes()
        } else {
            copy.id.to_le_bytes()
        };
        out[12..16].copy_from_slice(&id_bytes);
        out[16..20].copy_from_slice(&copy.data2);
        out
    }
}

/// Construct a mag in canonical form.
pub fn make_mag(subkind: u8, def: u16, pow: u16, dex: u16, mind: u16, data2: [u8; 4]) -> ItemData {
    let mut data1 = [0u8; 12];
    data1[0] = 0x02;
    data1[1] = subkind;
    data1[4..6].copy_from_slice(&def.to_le_bytes());
    data1[6..8].copy_from_slice(&pow.to_le_bytes());
    data1[8..10].copy_from_slice(&dex.to_le_bytes());
    data1[10..12].copy_from_slice(&mind.to_le_bytes());
    let mut item = ItemData::new(data1, data2);
    item.data1[2] = item.compute_mag_level().min(200) as u8;
    item
}

/// Construct a stackable tool in canonical form.
pub fn make_tool(subkind: u8, which: u8, stack: u8) -> ItemData {
    let mut data1 = [0u8; 12];
    data1[0] = 0x03;
    data1[1] = subkind;
    data1[2] = which;
    data1[5] = stack;
    ItemData::new(data1, [0; 4])
}

/// Construct a meseta amount.
pub fn make_meseta(amount: u32) -> ItemData {
    let mut data1 = [0u8; 12];
    data1[0] = 0x04;
    ItemData::new(data1, amount.to_le_bytes())
}

/// Construct a weapon in canonical form.
pub fn make_weapon(group: u8, index: u8, grind: u8) -> ItemData {
    let mut data1 = [0u8; 12];
    data1[1] = group;
    data1[2] = index;
    data1[3] = grind;
    ItemData::new(data1, [0; 4])
}
