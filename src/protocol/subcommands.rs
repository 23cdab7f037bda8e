//! # Subcommand Table
//!
//! This file is part of the crossplay-gateway project.
//!
//! In-game messages are nested subcommands inside the game commands (0x60,
//! 0x62, 0x6C, 0x6D). Three different numbering sets exist: one per pre-v1
//! prototype and the set shared by every later version. The table below is
//! indexed by the dominant (v1+) number and carries each entry's number
//! under the two prototype sets (0 = no counterpart), its handler, and its
//! forwarding-policy flags.
//!
//! Reverse maps for the prototype numberings are built once at first use;
//! lookup for a pre-v1 client goes through them.

use once_cell::sync::Lazy;

pub const ALWAYS_FORWARD_TO_WATCHERS: u8 = 0x01;
pub const ALLOW_FORWARD_TO_WATCHED_LOBBY: u8 = 0x02;
pub const USE_JOIN_COMMAND_QUEUE: u8 = 0x04;

/// Game commands that carry a target slot index in the frame flag and are
/// delivered to that slot only.
pub fn command_is_private(command: u16) -> bool {
    command == 0x62 || command == 0x6D
}

pub fn command_is_game_command(command: u16) -> bool {
    matches!(command, 0x60 | 0x62 | 0x6C | 0x6D)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerId {
    /// Invalid on every version; logged and dropped (still forwarded when
    /// a pre-v1 client sent it, since those clients are the authority on
    /// their own numbering).
    Invalid,
    /// Unknown subcommand: log-and-ignore, except pre-v1 senders whose
    /// unknown subcommands are forwarded unchanged.
    Unimplemented,
    Forward,
    ForwardCheckClient,
    ForwardCheckGame,
    ForwardCheckLobby,
    ForwardCheckGameClient,
    ForwardCheckGameLoading,
    ChangeFloor,
    EquipItem,
    UnequipItem,
    DestroyInventoryItem,
    PlayerDropItem,
    CreateInventoryItem,
    PickUpItem,
    PickUpItemRequest,
    DropPartialStack,
    BoxOrEnemyItemDrop,
    EntityDropRequest,
    DestroyFloorItem,
    SyncGameState,
    SyncItemState,
    SyncPlayerDispAndInventory,
    SplitStackedItem,
    StealExp,
}

#[derive(Debug, Clone, Copy)]
pub struct SubcommandDefinition {
    /// Number under the earliest prototype's set; 0 if none.
    pub proto_a: u8,
    /// Number under the second prototype's set; 0 if none.
    pub proto_b: u8,
    pub handler: HandlerId,
    pub flags: u8,
}

const UNSET: SubcommandDefinition = SubcommandDefinition {
    proto_a: 0,
    proto_b: 0,
    handler: HandlerId::Unimplemented,
    flags: 0,
};

fn build_table() -> [SubcommandDefinition; 0x100] {
    let mut t = [UNSET; 0x100];
    let mut set = |idx: usize, proto_a: u8, proto_b: u8, handler: HandlerId, flags: u8| {
        t[idx] = SubcommandDefinition {
            proto_a,
            proto_b,
            handler,
            flags,
        };
    };

    set(0x00, 0x00, 0x00, HandlerId::Invalid, 0);
    set(0x05, 0x05, 0x05, HandlerId::ForwardCheckGame, 0);
    set(0x07, 0x07, 0x07, HandlerId::Forward, ALWAYS_FORWARD_TO_WATCHERS);
    set(0x1F, 0x1B, 0x1D, HandlerId::ChangeFloor, 0);
    set(0x20, 0x1C, 0x1E, HandlerId::ForwardCheckGameClient, 0);
    set(0x21, 0x1D, 0x1F, HandlerId::ChangeFloor, 0);
    set(0x22, 0x1E, 0x20, HandlerId::ForwardCheckClient, 0);
    set(0x23, 0x1F, 0x21, HandlerId::ForwardCheckLobby, 0);
    set(0x24, 0x20, 0x22, HandlerId::ForwardCheckGame, 0);
    set(0x25, 0x21, 0x23, HandlerId::EquipItem, 0);
    set(0x26, 0x22, 0x24, HandlerId::UnequipItem, 0);
    set(0x29, 0x25, 0x27, HandlerId::DestroyInventoryItem, 0);
    set(0x2A, 0x26, 0x28, HandlerId::PlayerDropItem, 0);
    set(0x2B, 0x27, 0x29, HandlerId::CreateInventoryItem, 0);
    set(0x3F, 0x36, 0x3B, HandlerId::ForwardCheckGameClient, 0);
    set(0x40, 0x37, 0x3C, HandlerId::Forward, 0);
    set(0x42, 0x39, 0x3E, HandlerId::Forward, 0);
    set(0x59, 0x4B, 0x52, HandlerId::PickUpItem, 0);
    set(0x5A, 0x4C, 0x53, HandlerId::PickUpItemRequest, 0);
    set(0x5D, 0x4F, 0x56, HandlerId::DropPartialStack, 0);
    set(0x5F, 0x51, 0x58, HandlerId::BoxOrEnemyItemDrop, 0);
    set(0x60, 0x52, 0x59, HandlerId::EntityDropRequest, 0);
    set(0x61, 0x53, 0x5A, HandlerId::ForwardCheckGame, 0);
    set(0x63, 0x55, 0x5C, HandlerId::DestroyFloorItem, 0);
    set(0x6B, 0x5C, 0x63, HandlerId::SyncGameState, USE_JOIN_COMMAND_QUEUE);
    set(0x6C, 0x5D, 0x64, HandlerId::SyncGameState, USE_JOIN_COMMAND_QUEUE);
    set(0x6D, 0x5E, 0x65, HandlerId::SyncItemState, USE_JOIN_COMMAND_QUEUE);
    set(0x6E, 0x5F, 0x66, HandlerId::SyncGameState, USE_JOIN_COMMAND_QUEUE);
    set(0x6F, 0x00, 0x00, HandlerId::ForwardCheckGameLoading, USE_JOIN_COMMAND_QUEUE);
    set(
        0x70,
        0x60,
        0x67,
        HandlerId::SyncPlayerDispAndInventory,
        USE_JOIN_COMMAND_QUEUE,
    );
    set(0x71, 0x00, 0x00, HandlerId::ForwardCheckGameLoading, USE_JOIN_COMMAND_QUEUE);
    set(0x72, 0x61, 0x68, HandlerId::ForwardCheckGameLoading, USE_JOIN_COMMAND_QUEUE);
    set(0x73, 0x00, 0x00, HandlerId::Invalid, 0);
    set(0x74, 0x62, 0x69, HandlerId::Forward, ALWAYS_FORWARD_TO_WATCHERS);
    set(
        0xBE,
        0x00,
        0x00,
        HandlerId::Forward,
        ALWAYS_FORWARD_TO_WATCHERS | ALLOW_FORWARD_TO_WATCHED_LOBBY,
    );
    set(0xC3, 0x00, 0x00, HandlerId::SplitStackedItem, 0);
    set(0xC6, 0x00, 0x00, HandlerId::StealExp, 0);

    t
}

static SUBCOMMAND_DEFINITIONS: Lazy<[SubcommandDefinition; 0x100]> = Lazy::new(build_table);

/// final-number lookup tables for the two prototype numbering sets. Built
/// once; read-only afterwards.
static PROTO_A_TO_FINAL: Lazy<[u8; 0x100]> = Lazy::new(|| reverse_map(|d| d.proto_a));
static PROTO_B_TO_FINAL: Lazy<[u8; 0x100]> = Lazy::new(|| reverse_map(|d| d.proto_b));

fn reverse_map(select: fn(&SubcommandDefinition) -> u8) -> [u8; 0x100] {
    let mut map = [0u8; 0x100];
    for (final_number, def) in SUBCOMMAND_DEFINITIONS.iter().enumerate() {
        let proto_number = select(def);
        if proto_number != 0 {
            debug_assert_eq!(
                map[proto_number as usize], 0,
                "two final subcommands claim the same prototype number"
            );
            map[proto_number as usize] = final_number as u8;
        }
    }
    map
}

fn uses_proto_a_numbering(version: crate::core::types::Version) -> bool {
    version == crate::core::types::Version::ProtoA
}

fn uses_proto_b_numbering(version: crate::core::types::Version) -> bool {
    version == crate::core::types::Version::ProtoB
}

/// Resolve a subcommand byte as sent by a client of `version` to its table
/// entry and dominant (v1+) number.
pub fn def_for_subcommand(
    version: crate::core::types::Version,
    subcommand: u8,
) -> Option<(u8, &'static SubcommandDefinition)> {
    let final_number = if uses_proto_a_numbering(version) {
        let n = PROTO_A_TO_FINAL[subcommand as usize];
        if n == 0 {
            return None;
        }
        n
    } else if uses_proto_b_numbering(version) {
        let n = PROTO_B_TO_FINAL[subcommand as usize];
        if n == 0 {
            return None;
        }
        n
    } else {
        subcommand
    };
    Some((final_number, &SUBCOMMAND_DEFINITIONS[final_number as usize]))
}

/// Rewrite a subcommand number from `from`'s numbering into `to`'s.
/// Returns 0 when the recipient's numbering has no equivalent; the message
/// is then dropped for that recipient only.
pub fn translate_subcommand_number(
    to: crate::core::types::Version,
    from: crate::core::types::Version,
    subcommand: u8,
) -> u8 {
    match def_for_subcommand(from, subcommand) {
        None => 0,
        Some((final_number, def)) => {
            if uses_proto_a_numbering(to) {
                def.proto_a
            } else if uses_proto_b_numbering(to) {
                def.proto_b
            } else {
                final_number
            }
        }
    }
}
