//! # Item Definition Table
//!
//! This file is part of the crossplay-gateway project.
//!
//! Stack limits and price information come from data files maintained
//! outside the core; the codec only ever sees this lookup keyed by an
//! item's primary identifier. A default-constructed table answers with
//! conservative fallbacks so the server stays functional without the data
//! files.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct ItemDefinition {
    pub max_stack: u32,
    pub base_price: u32,
    pub is_rare: bool,
}

impl Default for ItemDefinition {
    fn default() -> Self {
        ItemDefinition {
            max_stack: 10,
            base_price: 10,
            is_rare: false,
        }
    }
}

#[derive(Default)]
pub struct ItemDefinitionTable {
    definitions: HashMap<u32, ItemDefinition>,
    fallback: ItemDefinition,
}

impl ItemDefinitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, primary_identifier: u32, definition: ItemDefinition) {
        self.definitions.insert(primary_identifier, definition);
    }

    pub fn lookup(&self, primary_identifier: u32) -> ItemDefinition {
        self.definitions
            .get(&primary_identifier)
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn max_stack_size(&self, primary_identifier: u32) -> u32 {
        self.lookup(primary_identifier).max_stack
    }

    pub fn price(&self, primary_identifier: u32) -> u32 {
        self.lookup(primary_identifier).base_price
    }

    pub fn is_rare(&self, primary_identifier: u32) -> bool {
        self.lookup(primary_identifier).is_rare
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_identifiers_fall_back() {
        let table = ItemDefinitionTable::new();
        assert_eq!(table.max_stack_size(0x0301_0000), 10);
        assert!(!table.is_rare(0x0301_0000));
    }

    #[test]
    fn inserted_definitions_win() {
        let mut table = ItemDefinitionTable::new();
        table.insert(
            0x0300_0100,
            ItemDefinition {
                max_stack: 99,
                base_price: 50,
                is_rare: true,
            },
        );
        assert_eq!(table.max_stack_size(0x0300_0100), 99);
        assert!(table.is_rare(0x0300_0100));
    }
}
