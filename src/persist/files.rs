//! # Save Files
//!
//! This file is part of the crossplay-gateway project.
//!
//! Character, system, and guild-card files are fixed-size packed records.
//! A character file is preceded by a `(size=0x399C, command=0x00E7,
//! flag=0)` header in the v4 header shape; system and guild-card records
//! carry an embedded signature word instead.
//!
//! Legacy files written by a different server are accepted and migrated at
//! load time: the signature is verified, areas the old format lacked are
//! defaulted, and renamed fields are folded into their new locations.
//!
//! All open save files go through the process-wide files manager, which
//! deduplicates by filename so concurrent access from the same session
//! shares one in-memory object; it is the single point of serialization
//! for on-disk writes.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

use crate::core::packet::CommandHeader;
use crate::core::types::Version;
use crate::core::wire::{ByteReader, ByteWriter};
use crate::core::text::{self, TextEncoding};
use crate::error::{ProtocolError, Result};
use crate::items::data::ItemData;
use crate::items::inventory::{Bank, Inventory, InventoryItem};
use crate::items::snapshot::PlayerStats;

/// Character file header: fixed size field, command 0x00E7, flag 0.
pub const CHARACTER_FILE_SIZE: u16 = 0x399C;
pub const CHARACTER_FILE_COMMAND: u16 = 0x00E7;

/// Legacy character files from the previous server carry this size field.
pub const LEGACY_CHARACTER_FILE_SIZE: u16 = 0x2A94;

pub const SYSTEM_FILE_SIGNATURE: u32 = 0x6853_7953; // "SySh"
pub const GUILD_CARD_FILE_SIGNATURE: u32 = 0x6446_6347; // "GcFd"

const MAX_TECH_LEVELS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct CharacterFile {
    pub guild_card_number: u32,
    pub name: String,
    pub stats: PlayerStats,
    pub technique_levels: [u8; MAX_TECH_LEVELS],
    pub play_time_seconds: u32,
    pub inventory: Inventory,
    pub bank: Bank,
}

impl CharacterFile {
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = CommandHeader {
            command: CHARACTER_FILE_COMMAND,
            flag: 0,
            size: CHARACTER_FILE_SIZE,
        };
        let mut w = ByteWriter::new(false);
        w.bytes(&header.serialize(Version::V4));
        w.u32(self.guild_card_number);
        w.bytes(&text::encode_fixed(&self.name, 24, TextEncoding::Utf16));
        write_stats(&mut w, &self.stats);
        w.bytes(&self.technique_levels);
        w.u32(self.play_time_seconds);

        w.u32(self.inventory.len() as u32);
        for slot in 0..crate::items::inventory::INVENTORY_CAPACITY {
            let entry = self.inventory.items().get(slot).copied().unwrap_or_default();
            w.u16(entry.present as u16);
            w.u8(entry.extension_data1);
            w.u8(entry.extension_data2);
            w.u32(entry.flags);
            write_item(&mut w, &entry.data);
        }

        w.u32(self.bank.meseta);
        w.u32(self.bank.items.len() as u32);
        for item in &self.bank.items {
            write_item(&mut w, item);
        }

        let mut out = w.into_vec();
        out.resize(CHARACTER_FILE_SIZE as usize, 0);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<CharacterFile> {
        if data.len() < 8 {
            return Err(ProtocolError::SaveFileError("file too short".into()));
        }
        let header = CommandHeader::parse(Version::V4, &data[..8])?;
        if header.command != CHARACTER_FILE_COMMAND || header.flag != 0 {
            return Err(ProtocolError::SaveFileError("bad character file header".into()));
        }
        match header.size {
            CHARACTER_FILE_SIZE => Self::parse_current(&data[8..]),
            LEGACY_CHARACTER_FILE_SIZE => Self::parse_legacy(&data[8..]),
            other => Err(ProtocolError::SaveFileError(format!(
                "unknown character file size {other:04X}"
            ))),
        }
    }

    fn parse_current(data: &[u8]) -> Result<CharacterFile> {
        let mut r = ByteReader::new(data, false);
        let guild_card_number = r.u32()?;
        let name_raw = r.bytes::<24>()?;
        let name = text::decode_fixed(&name_raw, TextEncoding::Utf16);
        let stats = read_stats(&mut r)?;
        let technique_levels = r.bytes::<MAX_TECH_LEVELS>()?;
        let play_time_seconds = r.u32()?;

        let num_items = r.u32()? as usize;
        let mut inventory = Inventory::new();
        for slot in 0..crate::items::inventory::INVENTORY_CAPACITY {
            let present = r.u16()? != 0;
            let extension_data1 = r.u8()?;
            let extension_data2 = r.u8()?;
            let flags = r.u32()?;
            let item = read_item(&mut r)?;
            if present && slot < num_items {
                let mut entry = InventoryItem::new(item);
                entry.flags = flags;
                entry.extension_data1 = extension_data1;
                entry.extension_data2 = extension_data2;
                inventory.push_raw(entry);
            }
        }

        let meseta = r.u32()?;
        let bank_count = r.u32()? as usize;
        let mut bank = Bank {
            items: Vec::new(),
            meseta,
        };
        for _ in 0..bank_count {
            bank.items.push(read_item(&mut r)?);
        }

        Ok(CharacterFile {
            guild_card_number,
            name,
            stats,
            technique_levels,
            play_time_seconds,
            inventory,
            bank,
        })
    }

    /// Migrate the previous server's layout: the name was single-byte
    /// text, the level was a 16-bit field folded into the 32-bit stats
    /// level, and there was no bank or play-time area at all.
    fn parse_legacy(data: &[u8]) -> Result<CharacterFile> {
        let mut r = ByteReader::new(data, false);
        let guild_card_number = r.u32()?;
        let name_raw = r.bytes::<16>()?;
        let name = text::decode_fixed(&name_raw, TextEncoding::LegacySingleByte);
        let level16 = r.u16()?;
        let atp = r.u16()?;
        let mst = r.u16()?;
        let evp = r.u16()?;
        let hp = r.u16()?;
        let dfp = r.u16()?;
        let ata = r.u16()?;
        let lck = r.u16()?;
        let exp = r.u32()?;
        let meseta = r.u32()?;
        let technique_levels = r.bytes::<MAX_TECH_LEVELS>()?;

        let num_items = r.u32()? as usize;
        let mut inventory = Inventory::new();
        for slot in 0..20usize {
            let present = r.u16()? != 0;
            let flags = r.u16()? as u32;
            let item = read_item(&mut r)?;
            if present && slot < num_items {
                let mut entry = InventoryItem::new(item);
                entry.flags = flags;
                inventory.push_raw(entry);
            }
        }

        info!(guild_card_number, "migrated legacy character file");
        Ok(CharacterFile {
            guild_card_number,
            name,
            stats: PlayerStats {
                atp,
                mst,
                evp,
                hp,
                dfp,
                ata,
                lck,
                level: level16 as u32,
                exp,
                meseta,
            },
            technique_levels,
            play_time_seconds: 0,
            inventory,
            bank: Bank::default(),
        })
    }
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

fn write_item(w: &mut ByteWriter, item: &ItemData) {
    w.bytes(&item.data1);
    w.u32(item.id);
    w.bytes(&item.data2);
}

fn read_item(r: &mut ByteReader<'_>) -> Result<ItemData> {
    Ok(ItemData {
        data1: r.bytes::<12>()?,
        id: r.u32()?,
        data2: r.bytes::<4>()?,
    })
}

/// Account-level settings record with an embedded signature.
#[derive(Debug, Clone)]
pub struct SystemFile {
    pub language: u8,
    pub key_config: [u8; 0x16C],
}

impl Default for SystemFile {
    fn default() -> Self {
        SystemFile {
            language: 0,
            key_config: [0; 0x16C],
        }
    }
}

impl SystemFile {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new(false);
        w.u32(SYSTEM_FILE_SIGNATURE);
        w.u8(self.language);
        w.u8(0).u16(0);
        w.bytes(&self.key_config);
        w.into_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<SystemFile> {
        let mut r = ByteReader::new(data, false);
        let signature = r.u32()?;
        if signature != SYSTEM_FILE_SIGNATURE {
            return Err(ProtocolError::SaveFileError("bad system file signature".into()));
        }
        let language = r.u8()?;
        r.u8()?;
        r.u16()?;
        Ok(SystemFile {
            language,
            key_config: r.bytes::<0x16C>()?,
        })
    }
}

/// One saved guild-card entry.
#[derive(Debug, Clone, Default)]
pub struct GuildCardEntry {
    pub guild_card_number: u32,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct GuildCardFile {
    pub entries: Vec<GuildCardEntry>,
}

impl GuildCardFile {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new(false);
        w.u32(GUILD_CARD_FILE_SIGNATURE);
        w.u32(self.entries.len() as u32);
        for entry in &self.entries {
            w.u32(entry.guild_card_number);
            w.bytes(&text::encode_fixed(&entry.name, 24, TextEncoding::Utf16));
            w.bytes(&text::encode_fixed(&entry.description, 88, TextEncoding::Utf16));
        }
        w.into_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<GuildCardFile> {
        let mut r = ByteReader::new(data, false);
        let signature = r.u32()?;
        if signature != GUILD_CARD_FILE_SIGNATURE {
            return Err(ProtocolError::SaveFileError(
                "bad guild card file signature".into(),
            ));
        }
        let count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(512));
        for _ in 0..count.min(512) {
            let guild_card_number = r.u32()?;
            let name_raw = r.bytes::<24>()?;
            let desc_raw = r.bytes::<88>()?;
            entries.push(GuildCardEntry {
                guild_card_number,
                name: text::decode_fixed(&name_raw, TextEncoding::Utf16),
                description: text::decode_fixed(&desc_raw, TextEncoding::Utf16),
            });
        }
        Ok(GuildCardFile { entries })
    }
}

/// An open character file: the parsed record plus its on-disk home.
pub struct CharacterSaveFile {
    pub path: PathBuf,
    pub character: CharacterFile,
    dirty: bool,
}

impl CharacterSaveFile {
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the record back to disk if it changed.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        std::fs::write(&self.path, self.character.to_bytes())?;
        self.dirty = false;
        info!(path = %self.path.display(), "character file saved");
        Ok(())
    }
}

/// Deduplicates open save files by filename.
#[derive(Default)]
pub struct FilesManager {
    open_files: Mutex<HashMap<PathBuf, Weak<Mutex<CharacterSaveFile>>>>,
}

static FILES_MANAGER: Lazy<FilesManager> = Lazy::new(FilesManager::default);

pub fn files_manager() -> &'static FilesManager {
    &FILES_MANAGER
}

impl FilesManager {
    /// Open (or create) a character file. Two opens of the same path
    /// return the same in-memory object while anyone still holds it.
    pub fn open_character(&self, path: &Path) -> Result<Arc<Mutex<CharacterSaveFile>>> {
        let mut open_files = self
            .open_files
            .lock()
            .map_err(|_| ProtocolError::SaveFileError("files manager lock poisoned".into()))?;
        if let Some(existing) = open_files.get(path).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }
        let character = match std::fs::read(path) {
            Ok(data) => CharacterFile::from_bytes(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "character file missing; starting fresh");
                CharacterFile::default()
            }
            Err(e) => return Err(e.into()),
        };
        let file = Arc::new(Mutex::new(CharacterSaveFile {
            path: path.to_path_buf(),
            character,
            dirty: false,
        }));
        open_files.insert(path.to_path_buf(), Arc::downgrade(&file));
        Ok(file)
    }
}
