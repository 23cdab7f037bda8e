//! # Inventory and Bank
//!
//! This file is part of the crossplay-gateway project.
//!
//! Inventories hold up to 30 entries. Stackable tools combine into the
//! existing stack on add; removing part of a stack returns a copy with an
//! unassigned ID so the caller knows a fresh server ID is required for the
//! split-off portion.

use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::items::data::{ItemData, ITEM_ID_UNASSIGNED};

pub const INVENTORY_CAPACITY: usize = 30;

#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryItem {
    pub present: bool,
    pub flags: u32,
    pub extension_data1: u8,
    pub extension_data2: u8,
    pub data: ItemData,
}

impl InventoryItem {
    pub fn new(data: ItemData) -> InventoryItem {
        InventoryItem {
            present: true,
            flags: 0,
            extension_data1: 0,
            extension_data2: 0,
            data,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    items: Vec<InventoryItem>,
}

impl Inventory {
    pub fn new() -> Inventory {
        Inventory { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[InventoryItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [InventoryItem] {
        &mut self.items
    }

    pub fn find(&self, item_id: u32) -> Option<&InventoryItem> {
        self.items.iter().find(|i| i.data.id == item_id)
    }

    /// Append an item, folding stackables into an existing stack of the
    /// same primary identifier. Fails with `InventoryFull` when no slot is
    /// free; the caller recovers locally.
    pub fn add_item(&mut self, item: ItemData, version: Version) -> Result<()> {
        if item.is_stackable(version) {
            let pid = item.primary_identifier();
            if let Some(existing) = self
                .items
                .iter_mut()
                .find(|i| i.data.primary_identifier() == pid)
            {
                let combined = existing.data.stack_size(version) + item.stack_size(version);
                existing.data.set_stack_size(combined);
                return Ok(());
            }
        }
        if self.items.len() >= INVENTORY_CAPACITY {
            return Err(ProtocolError::InventoryFull);
        }
        self.items.push(InventoryItem::new(item));
        Ok(())
    }

    /// Restore an entry exactly as recorded, bypassing stack folding.
    /// Used when loading saved inventories whose entries are already
    /// canonical.
    pub fn push_raw(&mut self, entry: InventoryItem) {
        if self.items.len() < INVENTORY_CAPACITY {
            self.items.push(entry);
        }
    }

    /// Remove `amount` of `item_id` (0 = the whole entry). When a stack is
    /// split, the original entry survives and the returned copy carries
    /// `ITEM_ID_UNASSIGNED` to signal that the split-off portion needs a
    /// newly minted ID.
    pub fn remove_item(&mut self, item_id: u32, amount: u32, version: Version) -> Result<ItemData> {
        let idx = self
            .items
            .iter()
            .position(|i| i.data.id == item_id)
            .ok_or(ProtocolError::ItemNotFound(item_id))?;
        let entry = self.items[idx];
        let stack = entry.data.stack_size(version);
        if amount > 0 && entry.data.is_stackable(version) && amount < stack {
            self.items[idx].data.set_stack_size(stack - amount);
            let mut split = entry.data;
            split.set_stack_size(amount);
            split.id = ITEM_ID_UNASSIGNED;
            return Ok(split);
        }
        self.items.remove(idx);
        Ok(entry.data)
    }

    pub fn sort(&mut self) {
        self.items
            .sort_by(|a, b| ItemData::compare_for_sort(&a.data, &b.data));
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bank {
    pub items: Vec<ItemData>,
    pub meseta: u32,
}

impl Bank {
    /// Deposited items keep the inventory item's ID. Withdrawals always
    /// allocate new IDs, so the reuse cannot collide.
    pub fn deposit(&mut self, item: ItemData) {
        self.items.push(item);
    }

    pub fn withdraw(&mut self, item_id: u32, new_id: u32) -> Result<ItemData> {
        let idx = self
            .items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or(ProtocolError::ItemNotFound(item_id))?;
        let mut item = self.items.remove(idx);
        item.id = new_id;
        Ok(item)
    }
}
