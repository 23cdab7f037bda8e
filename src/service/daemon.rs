//! # Game Server Daemon
//!
//! This file is part of the crossplay-gateway project.
//!
//! The main server: accepts connections, runs the version-appropriate
//! encryption handshake, waits for the login command, registers the
//! session, and drives its channel. Inbound game commands go through the
//! subcommand router; outbound fan-out arrives on the session's queue and
//! is written in enqueue order, so per-channel ordering holds end to end.
//!
//! Each session re-arms a ping every 30 seconds and disconnects after 60
//! idle seconds; v4 sessions also flush their save files once a minute.
//! `suspend_timeouts` dismounts all three, and disconnect cancels them
//! with the session task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::channel::{Channel, LogColor};
use crate::config::GatewayConfig;
use crate::core::packet::Command;
use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::items::table::ItemDefinitionTable;
use crate::lobby::{version_mask, Lobby, LobbyRegistry, Participant, SharedLobby};
use crate::protocol::router::{self, RouterEnv};
use crate::protocol::subcommands::command_is_game_command;
use crate::proxy::session::{process_unlinked_command, start_client_handshake};
use crate::service::session::ClientSession;
use crate::utils::timeout;

/// Ping command number; clients answer with the same number.
const COMMAND_PING: u16 = 0x1D;
/// Client-initiated disconnect.
const COMMAND_DISCONNECT: u16 = 0x05;
/// Server assigns the canonical guild card number.
const COMMAND_SET_GUILD_CARD: u16 = 0x04;
/// Client signals that it finished loading into a game.
const COMMAND_DONE_LOADING: u16 = 0x6F;

pub struct GameServer {
    pub config: Arc<GatewayConfig>,
    pub env: RouterEnv,
    pub registry: Arc<LobbyRegistry>,
    pub default_lobby: SharedLobby,
    sessions: Mutex<HashMap<u64, Arc<ClientSession>>>,
    next_session_id: AtomicU64,
}

impl GameServer {
    pub fn new(config: Arc<GatewayConfig>, item_table: Arc<ItemDefinitionTable>) -> Arc<GameServer> {
        let registry = LobbyRegistry::new();
        let mut lobby = Lobby::new(1, Version::V4, false);
        lobby.persistent = true;
        lobby.allowed_versions = version_mask(&crate::core::types::ALL_VERSIONS);
        let default_lobby = registry.insert(lobby);
        Arc::new(GameServer {
            config,
            env: RouterEnv::new(item_table),
            registry,
            default_lobby,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Accept connections on the configured address, treating each as the
    /// given client version until its login refines the tag.
    pub async fn run(self: &Arc<Self>, version: Version) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.address).await?;
        info!(
            address = %self.config.server.address,
            version = version.name(),
            "game server listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, version).await {
                    error!(peer = %peer, error = %e, "session ended with error");
                }
            });
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, version: Version) -> Result<()> {
        if self.session_count() >= self.config.server.max_sessions {
            warn!("session limit reached; dropping connection");
            return Ok(());
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut channel = Channel::with_stream(stream, version, format!("GameSession:{id}"))
            .with_colors(LogColor::Yellow, LogColor::Green);

        start_client_handshake(&mut channel).await?;
        let login = loop {
            let cmd = timeout::with_timeout_error(
                channel.recv(),
                self.config.server.handshake_timeout,
            )
            .await?;
            if let Some(login) = process_unlinked_command(&mut channel, &cmd)? {
                break login;
            }
        };
        let version = channel.version();
        info!(
            session = id,
            version = version.name(),
            gc = format_args!("{:08X}", login.serial_number),
            name = %login.character_name,
            "login accepted"
        );

        let (participant, mut outbound_rx) =
            Participant::new(login.serial_number, version, login.character_name.clone());
        let session = ClientSession::new(
            id,
            version,
            login.serial_number,
            participant.clone(),
            self.config.rules.cheat_mode.default_enabled(),
        );
        self.sessions
            .lock()
            .map_err(|_| ProtocolError::SessionGone)?
            .insert(id, session.clone());

        // Canonical identity, then the default lobby.
        let mut w = crate::core::wire::ByteWriter::new(version.is_big_endian());
        w.u32(0x0001_0000);
        w.u32(login.serial_number);
        channel.send(COMMAND_SET_GUILD_CARD, 0, &w.into_vec()).await?;

        let join_result = {
            let mut lobby = self
                .default_lobby
                .lock()
                .map_err(|_| ProtocolError::LobbyGone)?;
            lobby.add_client(&participant, None)
        };
        match join_result {
            Ok(slot) => session.set_lobby(&self.default_lobby, slot),
            Err(e) => {
                warn!(session = id, error = %e, "could not join default lobby");
            }
        }

        let result = self.drive_session(&session, &mut channel, &mut outbound_rx).await;

        // Teardown: vacate the lobby slot, flush saves, drop the session.
        if let Ok(lobby) = session.current_lobby() {
            let now_empty = lobby
                .lock()
                .map(|mut l| l.remove_client(session.slot()))
                .unwrap_or(false);
            if now_empty {
                let lobby_id = lobby.lock().map(|l| l.id).unwrap_or(0);
                self.registry.remove_lobby(lobby_id);
            }
        }
        session.clear_lobby();
        if let Err(e) = session.save_character() {
            warn!(session = id, error = %e, "final save failed");
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
        channel.disconnect().await;
        info!(session = id, "session closed");
        result
    }

    async fn drive_session(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        channel: &mut Channel,
        outbound_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        let mut ping = tokio::time::interval(self.config.server.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut save = tokio::time::interval(timeout::SAVE_INTERVAL);
        save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_recv = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if session.timeouts_suspended() {
                        continue;
                    }
                    if last_recv.elapsed() >= self.config.server.idle_timeout {
                        info!(session = session.id, "idle timeout expired");
                        return Ok(());
                    }
                    channel.send(COMMAND_PING, 0, &[]).await?;
                }
                _ = save.tick() => {
                    if session.version == Version::V4 && !session.timeouts_suspended() {
                        if let Err(e) = session.save_character() {
                            warn!(session = session.id, error = %e, "periodic save failed");
                        }
                    }
                }
                queued = outbound_rx.recv() => {
                    match queued {
                        Some(cmd) => channel.send_command(&cmd).await?,
                        None => return Ok(()),
                    }
                }
                inbound = channel.recv() => {
                    last_recv = Instant::now();
                    let cmd = match inbound {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            info!(session = session.id, error = %e, "client has disconnected");
                            return Ok(());
                        }
                    };
                    if let Err(e) = self.process_command(session, &cmd) {
                        if e.is_fatal() {
                            error!(session = session.id, error = %e, "fatal protocol error");
                            return Err(e);
                        }
                        info!(session = session.id, error = %e, "command dropped");
                    }
                    if cmd.command == COMMAND_DISCONNECT {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn process_command(&self, session: &Arc<ClientSession>, cmd: &Command) -> Result<()> {
        if command_is_game_command(cmd.command) {
            let lobby = session.current_lobby()?;
            return router::handle_game_command(&self.env, &lobby, &session.participant, cmd);
        }
        match cmd.command {
            COMMAND_PING => Ok(()),
            COMMAND_DONE_LOADING => {
                session.finish_game_join();
                Ok(())
            }
            COMMAND_DISCONNECT => Ok(()),
            other => {
                info!(
                    session = session.id,
                    command = format_args!("{other:04X}"),
                    "unhandled command; ignoring"
                );
                Ok(())
            }
        }
    }
}
