//! Cross-version item codec properties: round trips across every version
//! pair and the mag data2 compensation.

use crossplay_gateway::core::types::{Version, ALL_VERSIONS};
use crossplay_gateway::items::data::{
    make_mag, make_meseta, make_tool, make_weapon, ItemData,
};
use crossplay_gateway::items::table::ItemDefinitionTable;

fn sample_items() -> Vec<ItemData> {
    let mut armor = ItemData::default();
    armor.data1 = [0x01, 0x01, 0x07, 0, 0x40, 0, 0x0A, 0, 0x05, 0, 0, 0];
    armor.id = 0x0001_0010;
    let mut shield = ItemData::default();
    shield.data1 = [0x01, 0x02, 0x03, 0, 0x40, 0, 0x02, 0, 0x01, 0, 0, 0];
    shield.id = 0x0001_0011;
    let mut unit = ItemData::default();
    unit.data1 = [0x01, 0x03, 0x0B, 0, 0x40, 0, 0x01, 0, 0, 0, 0, 0];
    unit.id = 0x0001_0012;

    let mut weapon = make_weapon(0x02, 0x06, 0x23);
    weapon.id = 0x0001_0013;
    // Whole-level mag stats: the pre-v3 legacy layout stores dex and mind
    // as levels only, so sub-level precision is a documented loss there.
    let mut mag = make_mag(0x05, 500, 1200, 300, 100, [0x40, 0x28, 0x64, 0x0E]);
    mag.id = 0x0001_0014;
    let mut tool = make_tool(0x00, 0x01, 7);
    tool.id = 0x0001_0015;
    let mut meseta = make_meseta(123_456);
    meseta.id = 0x0001_0016;

    vec![weapon, armor, shield, unit, mag, tool, meseta]
}

#[test]
fn items_round_trip_across_every_version_pair() {
    let table = ItemDefinitionTable::default();
    for item in sample_items() {
        for &sender in &ALL_VERSIONS {
            let canonical = {
                let wire = item.to_wire(sender, &table);
                ItemData::from_wire(&wire, sender).unwrap()
            };
            for &recipient in &ALL_VERSIONS {
                let rewired = canonical.to_wire(recipient, &table);
                let decoded = ItemData::from_wire(&rewired, recipient).unwrap();
                assert_eq!(
                    decoded, canonical,
                    "kind {:?} via {sender:?} -> {recipient:?}",
                    item.kind()
                );
            }
        }
    }
}

#[test]
fn mag_data2_differs_on_wire_but_not_in_memory() {
    let table = ItemDefinitionTable::default();
    let mag = make_mag(0x05, 500, 300, 0, 0, [0x40, 0x28, 0x00, 0x0E]);

    let cube_wire = mag.to_wire(Version::V3Cube, &table);
    let v4_wire = mag.to_wire(Version::V4, &table);
    assert_ne!(cube_wire[16..20], v4_wire[16..20]);

    let from_cube = ItemData::from_wire(&cube_wire, Version::V3Cube).unwrap();
    let from_v4 = ItemData::from_wire(&v4_wire, Version::V4).unwrap();
    assert_eq!(from_cube.data2, [0x40, 0x28, 0x00, 0x0E]);
    assert_eq!(from_cube, from_v4);
}

#[test]
fn zero_stack_tools_normalize_to_one_everywhere() {
    let tool = make_tool(0x00, 0x03, 0);
    for &version in &ALL_VERSIONS {
        let table = ItemDefinitionTable::default();
        let decoded = ItemData::from_wire(&tool.to_wire(version, &table), version).unwrap();
        assert_eq!(decoded.stack_size(version), 1, "{version:?}");
    }
}

#[test]
fn stacks_clamp_to_the_definition_table_limit() {
    let mut table = ItemDefinitionTable::default();
    table.insert(
        make_tool(0x00, 0x01, 1).primary_identifier(),
        crossplay_gateway::items::table::ItemDefinition {
            max_stack: 5,
            base_price: 10,
            is_rare: false,
        },
    );
    let tool = make_tool(0x00, 0x01, 99);
    let wire = tool.to_wire(Version::V4, &table);
    let decoded = ItemData::from_wire(&wire, Version::V4).unwrap();
    assert_eq!(decoded.stack_size(Version::V4), 5);
}
