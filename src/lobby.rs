//! # Lobby State
//!
//! This file is part of the crossplay-gateway project.
//!
//! A lobby holds up to 12 participant slots, a leader, a floor-item table
//! keyed by (floor, item ID), per-participant item-ID progressions, a drop
//! mode, watcher sub-lobbies, and an optional recorder. Games are lobbies
//! with `is_game` set.
//!
//! Ownership is unidirectional: the lobby owns its floor items, but links
//! to participants are weak and may legitimately dangle during teardown; a
//! failed upgrade means "gone" and surfaces as a recoverable error.
//!
//! Item IDs minted on behalf of slot `k` come from a disjoint arithmetic
//! progression per slot; authoritative IDs come from a separate server
//! progression addressed by the sentinel `0xFF`. A floor item's visibility
//! mask is monotone: bits may be cleared but never added after creation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::packet::Command;
use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::items::data::ItemData;
use crate::items::inventory::Inventory;

pub const MAX_CLIENTS: usize = 12;

/// First ID of slot `k`'s progression; slots never overlap because the
/// stride exceeds any realistic per-session allocation count.
const CLIENT_ITEM_ID_BASE: u32 = 0x0001_0000;
const CLIENT_ITEM_ID_STRIDE: u32 = 0x0020_0000;

/// Authoritative ("server") progression, addressed by slot 0xFF.
const SERVER_ITEM_ID_BASE: u32 = 0x0F00_0000;

pub const SERVER_ITEM_SLOT: u8 = 0xFF;

/// Request parameters handed to the external drop generator.
#[derive(Debug, Clone, Copy)]
pub struct EntityDropRequest {
    pub entity_id: u16,
    pub rt_index: u8,
    pub ignore_def: bool,
    pub floor: u8,
    pub effective_area: u8,
    pub x: f32,
    pub z: f32,
}

impl EntityDropRequest {
    pub fn is_box(&self) -> bool {
        self.rt_index == 0x30
    }
}

/// Drop generation is supplied externally (drop tables are out of scope);
/// `None` means the entity drops nothing.
pub trait DropGenerator: Send {
    fn generate(&mut self, request: &EntityDropRequest) -> Option<ItemData>;
}

/// Policy governing who mints dropped items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropMode {
    Disabled,
    /// The lobby leader's client generates drops.
    #[default]
    Client,
    /// The server generates one shared item visible to everyone.
    ServerShared,
    /// The server mints a distinct item per eligible participant, each
    /// visible to exactly one slot.
    ServerDuplicate,
    /// Like duplicate, but the generation itself runs per participant.
    ServerPrivate,
}

/// What a participant looks like to the router: identity, version, an
/// outbound queue, and the mutable per-session state handlers touch.
pub struct Participant {
    pub guild_card_number: u32,
    pub version: Version,
    pub name: String,
    pub outbound: mpsc::UnboundedSender<Command>,
    pub state: Mutex<ParticipantState>,
}

#[derive(Default)]
pub struct ParticipantState {
    pub floor: u8,
    pub inventory: Inventory,
    /// Armed while the participant loads into a game; queued commands are
    /// flushed in order when it signals completion.
    pub join_queue: Option<Vec<Command>>,
    pub debug_enabled: bool,
}

impl Participant {
    pub fn new(
        guild_card_number: u32,
        version: Version,
        name: impl Into<String>,
    ) -> (Arc<Participant>, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Participant {
                guild_card_number,
                version,
                name: name.into(),
                outbound: tx,
                state: Mutex::new(ParticipantState::default()),
            }),
            rx,
        )
    }

    /// Enqueue a command toward this participant's channel. A send to a
    /// participant whose session is draining is silently dropped; the
    /// session registry reaps it on its own schedule.
    pub fn send(&self, command: Command) {
        if self.outbound.send(command).is_err() {
            warn!(gc = self.guild_card_number, "participant outbound queue is gone");
        }
    }

    /// Queue the command if the join queue is armed, else send it now.
    pub fn send_or_queue(&self, command: Command, queue_eligible: bool) {
        if queue_eligible {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            if let Some(queue) = state.join_queue.as_mut() {
                queue.push(command);
                return;
            }
            drop(state);
        }
        self.send(command);
    }

    /// Flush and disarm the join queue; called when the client signals
    /// join completion.
    pub fn flush_join_queue(&self) {
        let queued = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            state.join_queue.take()
        };
        if let Some(commands) = queued {
            info!(
                gc = self.guild_card_number,
                count = commands.len(),
                "flushing join command queue"
            );
            for cmd in commands {
                self.send(cmd);
            }
        }
    }
}

/// An item placed in the world, addressed by (floor, id).
#[derive(Debug, Clone)]
pub struct FloorItem {
    pub data: ItemData,
    pub floor: u8,
    pub x: f32,
    pub z: f32,
    visibility: u8,
}

impl FloorItem {
    pub fn visible_to_slot(&self, slot: u8) -> bool {
        slot < 4 && (self.visibility & (1 << slot)) != 0
    }

    pub fn visibility(&self) -> u8 {
        self.visibility
    }

    /// Visibility is monotone: this can only clear bits, never add them.
    pub fn restrict_visibility(&mut self, mask: u8) {
        self.visibility &= mask;
    }
}

/// Recorder attachment: a spectated game's traffic capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedEventKind {
    GameCommand,
    SpectatorGameCommand,
}

#[derive(Default)]
pub struct Recorder {
    pub battle_in_progress: bool,
    events: Vec<(RecordedEventKind, Vec<u8>)>,
}

impl Recorder {
    pub fn new(battle_in_progress: bool) -> Recorder {
        Recorder {
            battle_in_progress,
            events: Vec::new(),
        }
    }

    pub fn add_command(&mut self, kind: RecordedEventKind, data: &[u8]) {
        self.events.push((kind, data.to_vec()));
    }

    pub fn events(&self) -> &[(RecordedEventKind, Vec<u8>)] {
        &self.events
    }
}

pub type SharedLobby = Arc<Mutex<Lobby>>;

pub struct Lobby {
    pub id: u32,
    pub name: String,
    pub is_game: bool,
    pub persistent: bool,
    pub base_version: Version,
    /// Bitmask over `Version` discriminants of variants that may coexist
    /// here.
    pub allowed_versions: u16,
    pub leader_slot: u8,
    pub drop_mode: DropMode,
    pub episode: u8,
    pub difficulty: u8,
    /// True once a spectated game has entered its active phase; watcher
    /// fan-out becomes unconditional then.
    pub active_phase: bool,
    pub is_spectator_lobby: bool,
    pub watched_lobby: Weak<Mutex<Lobby>>,
    pub watcher_lobbies: Vec<Weak<Mutex<Lobby>>>,
    pub recorder: Option<Recorder>,
    pub item_creator: Option<Box<dyn DropGenerator>>,
    slots: [Option<Weak<Participant>>; MAX_CLIENTS],
    floor_items: HashMap<(u8, u32), FloorItem>,
    next_item_id: [u32; MAX_CLIENTS],
    next_server_item_id: u32,
    /// Entities for which a drop decision has already been made; tolerates
    /// redundant drop requests.
    entity_drop_decided: HashSet<u16>,
}

pub fn version_mask(versions: &[Version]) -> u16 {
    versions.iter().fold(0, |acc, v| {
        acc | (1 << crate::core::types::ALL_VERSIONS.iter().position(|x| x == v).unwrap_or(0))
    })
}

impl Lobby {
    pub fn new(id: u32, base_version: Version, is_game: bool) -> Lobby {
        let mut next_item_id = [0u32; MAX_CLIENTS];
        for (k, slot) in next_item_id.iter_mut().enumerate() {
            *slot = CLIENT_ITEM_ID_BASE + CLIENT_ITEM_ID_STRIDE * k as u32;
        }
        Lobby {
            id,
            name: format!("lobby-{id}"),
            is_game,
            persistent: !is_game,
            base_version,
            allowed_versions: version_mask(&crate::core::types::ALL_VERSIONS),
            leader_slot: 0,
            drop_mode: DropMode::default(),
            episode: 1,
            difficulty: 0,
            active_phase: false,
            is_spectator_lobby: false,
            watched_lobby: Weak::new(),
            watcher_lobbies: Vec::new(),
            recorder: None,
            item_creator: None,
            slots: Default::default(),
            floor_items: HashMap::new(),
            next_item_id,
            next_server_item_id: SERVER_ITEM_ID_BASE,
            entity_drop_decided: HashSet::new(),
        }
    }

    pub fn admits_version(&self, version: Version) -> bool {
        self.allowed_versions & version_mask(&[version]) != 0
    }

    /// Occupy a free slot (or the given one). Fails with a recoverable
    /// "no free slot" when the lobby is full.
    pub fn add_client(&mut self, client: &Arc<Participant>, slot: Option<u8>) -> Result<u8> {
        if !self.admits_version(client.version) {
            return Err(ProtocolError::NoFreeSlot);
        }
        let slot = match slot {
            Some(s) => {
                let idx = s as usize;
                if idx >= MAX_CLIENTS || self.slots[idx].as_ref().is_some_and(|w| w.upgrade().is_some()) {
                    return Err(ProtocolError::NoFreeSlot);
                }
                idx
            }
            None => self
                .slots
                .iter()
                .position(|s| s.as_ref().map_or(true, |w| w.upgrade().is_none()))
                .ok_or(ProtocolError::NoFreeSlot)?,
        };
        let was_empty = self.occupied_slots().is_empty();
        self.slots[slot] = Some(Arc::downgrade(client));
        if was_empty {
            self.leader_slot = slot as u8;
        }
        Ok(slot as u8)
    }

    /// Vacate a slot and notify the remaining participants. Returns true
    /// when the lobby is now empty and not persistent, in which case the
    /// caller schedules destruction.
    pub fn remove_client(&mut self, slot: u8) -> bool {
        let idx = slot as usize;
        if idx < MAX_CLIENTS {
            self.slots[idx] = None;
        }
        let remaining = self.occupied_slots();
        if slot == self.leader_slot {
            if let Some((new_leader, _)) = remaining.first() {
                self.leader_slot = *new_leader;
            }
        }
        let leave_notice = Command::new(
            0x66,
            slot as u32,
            vec![slot, self.leader_slot, 1, 0],
        );
        for (_, client) in &remaining {
            client.send(leave_notice.clone());
        }
        remaining.is_empty() && !self.persistent
    }

    pub fn client_at(&self, slot: u8) -> Option<Arc<Participant>> {
        self.slots
            .get(slot as usize)?
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    pub fn occupied_slots(&self) -> Vec<(u8, Arc<Participant>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| Some((i as u8, s.as_ref()?.upgrade()?)))
            .collect()
    }

    pub fn slot_of(&self, client: &Arc<Participant>) -> Option<u8> {
        self.occupied_slots()
            .into_iter()
            .find(|(_, c)| Arc::ptr_eq(c, client))
            .map(|(s, _)| s)
    }

    // -- item IDs ----------------------------------------------------------

    /// Next ID in slot `k`'s progression; `SERVER_ITEM_SLOT` (0xFF) mints
    /// from the authoritative server progression.
    pub fn generate_item_id(&mut self, slot: u8) -> u32 {
        if slot == SERVER_ITEM_SLOT {
            let id = self.next_server_item_id;
            self.next_server_item_id += 1;
            id
        } else {
            let id = self.next_item_id[slot as usize];
            self.next_item_id[slot as usize] += 1;
            id
        }
    }

    pub fn next_item_id_for_slot(&self, slot: u8) -> u32 {
        if slot == SERVER_ITEM_SLOT {
            self.next_server_item_id
        } else {
            self.next_item_id[slot as usize]
        }
    }

    /// Keep `slot`'s counter strictly above any ID observed from that
    /// participant, so later locally-minted IDs cannot collide.
    pub fn on_item_id_generated_externally(&mut self, slot: u8, id: u32) {
        if slot == SERVER_ITEM_SLOT {
            if id >= self.next_server_item_id {
                self.next_server_item_id = id + 1;
            }
        } else if id != crate::items::data::ITEM_ID_UNASSIGNED
            && id >= self.next_item_id[slot as usize]
        {
            self.next_item_id[slot as usize] = id + 1;
        }
    }

    // -- floor items -------------------------------------------------------

    pub fn add_item(&mut self, floor: u8, data: ItemData, x: f32, z: f32, visibility: u8) {
        self.floor_items.insert(
            (floor, data.id),
            FloorItem {
                data,
                floor,
                x,
                z,
                visibility: visibility & 0x0F,
            },
        );
    }

    pub fn put_back(&mut self, item: FloorItem) {
        self.floor_items.insert((item.floor, item.data.id), item);
    }

    pub fn item_exists(&self, floor: u8, item_id: u32) -> bool {
        self.floor_items.contains_key(&(floor, item_id))
    }

    pub fn floor_item(&self, floor: u8, item_id: u32) -> Option<&FloorItem> {
        self.floor_items.get(&(floor, item_id))
    }

    pub fn remove_item(&mut self, floor: u8, item_id: u32) -> Result<FloorItem> {
        self.floor_items
            .remove(&(floor, item_id))
            .ok_or(ProtocolError::ItemNotFound(item_id))
    }

    pub fn floor_items(&self) -> impl Iterator<Item = &FloorItem> {
        self.floor_items.values()
    }

    pub fn floor_item_count(&self, floor: u8) -> usize {
        self.floor_items.keys().filter(|(f, _)| *f == floor).count()
    }

    // -- drops -------------------------------------------------------------

    /// Returns true the first time a drop decision is made for an entity;
    /// redundant requests for the same entity return false.
    pub fn mark_entity_drop_decided(&mut self, entity_id: u16) -> bool {
        self.entity_drop_decided.insert(entity_id)
    }

    pub fn record_command(&mut self, kind: RecordedEventKind, data: &[u8]) {
        if let Some(recorder) = self.recorder.as_mut() {
            if recorder.battle_in_progress {
                recorder.add_command(kind, data);
            }
        }
    }
}

/// Process-wide registry of lobbies. Destruction is deferred: a removed
/// lobby is parked in a to-destroy set and reaped by an immediate-timeout
/// task, so callers may still hold borrowed references during the same
/// tick.
#[derive(Default)]
pub struct LobbyRegistry {
    lobbies: Mutex<HashMap<u32, SharedLobby>>,
    to_destroy: Mutex<Vec<SharedLobby>>,
}

impl LobbyRegistry {
    pub fn new() -> Arc<LobbyRegistry> {
        Arc::new(LobbyRegistry::default())
    }

    pub fn insert(&self, lobby: Lobby) -> SharedLobby {
        let id = lobby.id;
        let shared = Arc::new(Mutex::new(lobby));
        if let Ok(mut map) = self.lobbies.lock() {
            map.insert(id, shared.clone());
        }
        shared
    }

    pub fn get(&self, id: u32) -> Option<SharedLobby> {
        self.lobbies.lock().ok()?.get(&id).cloned()
    }

    /// Park the lobby for destruction and schedule the reap. A spectator
    /// lobby unlinks itself from its watched lobby; a watched lobby
    /// cascades a disband notice to every spectator lobby referencing it.
    pub fn remove_lobby(self: &Arc<Self>, id: u32) {
        let removed = {
            let mut map = match self.lobbies.lock() {
                Ok(m) => m,
                Err(_) => return,
            };
            map.remove(&id)
        };
        let Some(lobby) = removed else { return };

        {
            let mut guard = match lobby.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            if guard.is_spectator_lobby {
                if let Some(watched) = guard.watched_lobby.upgrade() {
                    if let Ok(mut watched) = watched.lock() {
                        watched
                            .watcher_lobbies
                            .retain(|w| w.upgrade().map_or(false, |l| !Arc::ptr_eq(&l, &lobby)));
                    }
                }
            }
            let watchers = std::mem::take(&mut guard.watcher_lobbies);
            drop(guard);
            for watcher in watchers {
                if let Some(watcher) = watcher.upgrade() {
                    if let Ok(guard) = watcher.lock() {
                        for (_, client) in guard.occupied_slots() {
                            // Disband notice: the watched game is gone.
                            client.send(Command::new(0xE8, 0, Vec::new()));
                        }
                    }
                }
            }
        }

        if let Ok(mut pending) = self.to_destroy.lock() {
            pending.push(lobby);
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::ZERO).await;
            registry.destroy_pending();
        });
        info!(lobby_id = id, "lobby scheduled for destruction");
    }

    fn destroy_pending(&self) {
        if let Ok(mut pending) = self.to_destroy.lock() {
            pending.clear();
        }
    }
}
