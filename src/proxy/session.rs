//! # Proxy Sessions
//!
//! This file is part of the crossplay-gateway project.
//!
//! A proxy session starts *unlinked*: the client has connected and
//! completed the encryption handshake, but no upstream has been chosen.
//! The login command's opcode disambiguates the exact client variant
//! (0x8B for the earliest prototype, 0x93 for v1 or v4, 0x9D for v2,
//! 0x9E for v3, with sub_version refining further) and carries the
//! credentials that key the session. Once credentials are known the
//! session becomes *linked*: an upstream channel is opened, the proxy
//! performs the client side of the upstream handshake, and both halves are
//! spliced: each direction decrypts here, is observed and possibly
//! rewritten, and is re-encrypted with the opposite side's cipher.
//!
//! When the upstream closes, the client is sent back to the home server
//! with a synthesized info message and the session schedules its own
//! deletion; a reconnect with the same license inside that window cancels
//! the deletion and resumes the session.

use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{Channel, LogColor};
use crate::config::{GatewayConfig, SERVER_INIT_CONSOLE, SERVER_INIT_COPYRIGHT, SERVER_INIT_V4};
use crate::core::packet::Command;
use crate::core::text::{self, TextEncoding};
use crate::core::types::{Generation, Version};
use crate::core::wire::{ByteReader, ByteWriter};
use crate::crypto::detect::{shared_detector, SharedDetector, SharedDetectorCipher};
use crate::crypto::{ConsoleCipher, LegacyCipher, MultiKeyImitator, OnlineCipher, SEED_SIZE};
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;

/// Why a linked session closed; selects the deletion delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectAction {
    #[default]
    LongTimeout,
    MediumTimeout,
    ShortTimeout,
    CloseImmediately,
}

impl DisconnectAction {
    pub fn delay(self) -> Duration {
        match self {
            DisconnectAction::LongTimeout => timeout::PROXY_LONG_TIMEOUT,
            DisconnectAction::MediumTimeout => timeout::PROXY_MEDIUM_TIMEOUT,
            DisconnectAction::ShortTimeout => timeout::PROXY_SHORT_TIMEOUT,
            DisconnectAction::CloseImmediately => Duration::ZERO,
        }
    }
}

/// Credentials and identity captured from an unlinked client.
#[derive(Debug, Clone, Default)]
pub struct CapturedLogin {
    pub serial_number: u32,
    pub access_key: String,
    pub character_name: String,
    pub sub_version: u8,
    pub language: u8,
}

pub const LOGIN_OPCODE_PROTO: u16 = 0x8B;
pub const LOGIN_OPCODE_V1: u16 = 0x93;
pub const LOGIN_OPCODE_V2: u16 = 0x9D;
pub const LOGIN_OPCODE_V3: u16 = 0x9E;
pub const CLIENT_CONFIG_OPCODE: u16 = 0x9F;

const CONSOLE_LOGIN_SIZE: usize = 68;
const V4_LOGIN_MIN_SIZE: usize = 48;

/// Server-init payload for pre-v4 clients: copyright text plus the two
/// 4-octet cipher seeds.
pub fn build_server_init_console(server_seed: u32, client_seed: u32) -> Vec<u8> {
    let mut w = ByteWriter::new(false);
    w.bytes(&text::encode_fixed(SERVER_INIT_COPYRIGHT, 0x40, TextEncoding::Ascii));
    w.u32(server_seed);
    w.u32(client_seed);
    w.into_vec()
}

pub fn parse_server_init_console(data: &[u8]) -> Result<(u32, u32)> {
    let mut r = ByteReader::new(data, false);
    r.slice(0x40)?;
    Ok((r.u32()?, r.u32()?))
}

/// Server-init payload for v4: copyright text plus the two 0x30-octet
/// keys.
pub fn build_server_init_v4(server_key: &[u8; SEED_SIZE], client_key: &[u8; SEED_SIZE]) -> Vec<u8> {
    let mut w = ByteWriter::new(false);
    w.bytes(&text::encode_fixed(SERVER_INIT_COPYRIGHT, 0x60, TextEncoding::Ascii));
    w.bytes(server_key);
    w.bytes(client_key);
    w.into_vec()
}

pub fn parse_server_init_v4(data: &[u8]) -> Result<([u8; SEED_SIZE], [u8; SEED_SIZE])> {
    let mut r = ByteReader::new(data, false);
    r.slice(0x60)?;
    Ok((r.bytes::<SEED_SIZE>()?, r.bytes::<SEED_SIZE>()?))
}

/// Console login layout: player tag, guild card, sub version, language,
/// then the credential and name text fields.
pub fn build_console_login(login: &CapturedLogin, guild_card_number: u32) -> Vec<u8> {
    let mut w = ByteWriter::new(false);
    w.u32(0x0001_0000);
    w.u32(guild_card_number);
    w.u8(login.sub_version).u8(login.language).u16(0);
    w.bytes(&text::encode_fixed(
        &format!("{:08X}", login.serial_number),
        16,
        TextEncoding::Ascii,
    ));
    w.bytes(&text::encode_fixed(&login.access_key, 16, TextEncoding::Ascii));
    w.bytes(&text::encode_fixed(&login.character_name, 24, TextEncoding::Ascii));
    w.into_vec()
}

fn parse_console_login(data: &[u8]) -> Result<CapturedLogin> {
    if data.len() < CONSOLE_LOGIN_SIZE {
        return Err(ProtocolError::SizeMismatch {
            got: data.len(),
            expected: CONSOLE_LOGIN_SIZE,
        });
    }
    let mut r = ByteReader::new(data, false);
    r.u32()?; // player tag
    r.u32()?; // client-claimed guild card number; never trusted
    let sub_version = r.u8()?;
    let language = r.u8()?;
    r.u16()?;
    let serial_raw = r.slice(16)?;
    let access_raw = r.slice(16)?;
    let name_raw = r.slice(24)?;
    Ok(CapturedLogin {
        serial_number: text::parse_serial_number(&text::decode_fixed(
            serial_raw,
            TextEncoding::Ascii,
        ))?,
        access_key: text::decode_fixed(access_raw, TextEncoding::Ascii),
        character_name: text::decode_fixed(name_raw, TextEncoding::Ascii),
        sub_version,
        language,
    })
}

fn parse_v4_login(data: &[u8]) -> Result<CapturedLogin> {
    if data.len() < V4_LOGIN_MIN_SIZE {
        return Err(ProtocolError::SizeMismatch {
            got: data.len(),
            expected: V4_LOGIN_MIN_SIZE,
        });
    }
    let mut r = ByteReader::new(data, false);
    let username_raw = r.slice(16)?;
    let password_raw = r.slice(16)?;
    let username = text::decode_fixed(username_raw, TextEncoding::Ascii);
    let password = text::decode_fixed(password_raw, TextEncoding::Ascii);
    // v4 accounts key on the username; fold it into a 31-bit serial the
    // way account creation does.
    let serial_number = fnv1a32(username.as_bytes()) & 0x7FFF_FFFF;
    Ok(CapturedLogin {
        serial_number,
        access_key: password,
        character_name: username,
        sub_version: 0,
        language: 0,
    })
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Perform the server side of the encryption handshake on a fresh client
/// channel: send the server-init command with freshly generated keys and
/// install the matching cipher pair. The init command itself goes out
/// before encryption is enabled.
pub async fn start_client_handshake(channel: &mut Channel) -> Result<Option<SharedDetector>> {
    if channel.version() == Version::V4 {
        let mut server_key = [0u8; SEED_SIZE];
        let mut client_key = [0u8; SEED_SIZE];
        rand::thread_rng().fill_bytes(&mut server_key);
        rand::thread_rng().fill_bytes(&mut client_key);
        let payload = build_server_init_v4(&server_key, &client_key);
        channel.send(SERVER_INIT_V4, 0, &payload).await?;
        let detector = shared_detector(crate::crypto::detect::detection_keyset(), client_key);
        channel.set_ciphers(
            Some(Box::new(SharedDetectorCipher(detector.clone()))),
            Some(Box::new(MultiKeyImitator::new(detector.clone(), server_key))),
        );
        Ok(Some(detector))
    } else {
        let server_seed = rand::thread_rng().next_u32();
        let client_seed = rand::thread_rng().next_u32();
        let payload = build_server_init_console(server_seed, client_seed);
        channel.send(SERVER_INIT_CONSOLE, 0, &payload).await?;
        if channel.version().generation() <= Generation::V2 {
            channel.set_ciphers(
                Some(Box::new(LegacyCipher::new(client_seed))),
                Some(Box::new(LegacyCipher::new(server_seed))),
            );
        } else {
            channel.set_ciphers(
                Some(Box::new(ConsoleCipher::new(client_seed))),
                Some(Box::new(ConsoleCipher::new(server_seed))),
            );
        }
        Ok(None)
    }
}

/// Refine the channel's version tag from the login opcode, and parse the
/// credentials. Returns None for commands that are part of the handshake
/// but not yet the login (e.g. the v3 set-top client-config round trip).
pub fn process_unlinked_command(
    channel: &mut Channel,
    cmd: &Command,
) -> Result<Option<CapturedLogin>> {
    match (channel.version().generation(), cmd.command) {
        (Generation::PreV1 | Generation::V1 | Generation::V2, LOGIN_OPCODE_PROTO) => {
            channel.set_version(Version::ProtoA);
            info!("version refined to {}", Version::ProtoA.name());
            Ok(Some(parse_console_login(&cmd.data)?))
        }
        (Generation::PreV1 | Generation::V1 | Generation::V2, LOGIN_OPCODE_V1) => {
            let login = parse_console_login(&cmd.data)?;
            // The second prototype shares this opcode; its sub_version
            // range distinguishes it from the retail v1 client.
            if login.sub_version < 0x20 {
                channel.set_version(Version::ProtoB);
            } else {
                channel.set_version(Version::V1);
            }
            info!("version refined to {}", channel.version().name());
            Ok(Some(login))
        }
        (Generation::V1 | Generation::V2, LOGIN_OPCODE_V2) => {
            channel.set_version(Version::V2);
            Ok(Some(parse_console_login(&cmd.data)?))
        }
        (Generation::V3, LOGIN_OPCODE_V3) => Ok(Some(parse_console_login(&cmd.data)?)),
        (Generation::V3, CLIENT_CONFIG_OPCODE) => Ok(None),
        (Generation::V4, LOGIN_OPCODE_V1) => Ok(Some(parse_v4_login(&cmd.data)?)),
        (_, other) => Err(ProtocolError::InvalidLoginOpcode(other)),
    }
}

/// A session paired (or pairable) with an upstream. Keyed by the license
/// serial number; reconnects by the same identity resume it.
pub struct LinkedSession {
    pub id: u64,
    pub version: Mutex<Version>,
    pub destination: SocketAddr,
    pub login: Mutex<CapturedLogin>,
    pub login_command_v4: Mutex<Option<Command>>,
    /// Identity the upstream assigned us; 0 until observed.
    pub remote_guild_card_number: AtomicU32,
    pub guild_card_substitution: bool,
    pub disconnect_action: Mutex<DisconnectAction>,
    pub active: AtomicBool,
    pub deletion_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkedSession {
    pub fn new(
        id: u64,
        version: Version,
        destination: SocketAddr,
        login: CapturedLogin,
        config: &GatewayConfig,
    ) -> LinkedSession {
        LinkedSession {
            id,
            version: Mutex::new(version),
            destination,
            login: Mutex::new(login),
            login_command_v4: Mutex::new(None),
            remote_guild_card_number: AtomicU32::new(0),
            guild_card_substitution: config.proxy.remote_guild_card_substitution,
            disconnect_action: Mutex::new(DisconnectAction::default()),
            active: AtomicBool::new(false),
            deletion_task: Mutex::new(None),
        }
    }

    pub fn set_disconnect_action(&self, action: DisconnectAction) {
        if let Ok(mut guard) = self.disconnect_action.lock() {
            *guard = action;
        }
    }

    pub fn cancel_deletion(&self) {
        if let Ok(mut guard) = self.deletion_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
                info!(session = self.id, "deletion timer cancelled; session resumed");
            }
        }
    }

    /// Connect to the configured upstream and perform the client side of
    /// its handshake: wait for the server-init, install ciphers, then log
    /// in with the captured (or replayed) credentials.
    pub async fn connect_upstream(&self, detector: Option<&SharedDetector>) -> Result<Channel> {
        info!(session = self.id, destination = %self.destination, "connecting upstream");
        let version = *self
            .version
            .lock()
            .map_err(|_| ProtocolError::SessionGone)?;
        let stream = TcpStream::connect(self.destination).await?;
        let mut upstream = Channel::with_stream(
            stream,
            version,
            format!("LinkedSession:{:08X}:server", self.id),
        )
        .with_colors(LogColor::Yellow, LogColor::Red);

        let init = upstream.recv().await?;
        if version == Version::V4 {
            if init.command != SERVER_INIT_V4 {
                return Err(ProtocolError::HandshakeError(format!(
                    "unexpected upstream init command {:02X}",
                    init.command
                )));
            }
            let (server_key, client_key) = parse_server_init_v4(&init.data)?;
            let key = detector
                .and_then(|d| d.lock().ok().and_then(|d| d.committed_key()))
                .ok_or(ProtocolError::CipherDetectionFailed)?;
            upstream.set_ciphers(
                Some(Box::new(OnlineCipher::new(&key, &server_key))),
                Some(Box::new(OnlineCipher::new(&key, &client_key))),
            );
            let replay = self
                .login_command_v4
                .lock()
                .map_err(|_| ProtocolError::SessionGone)?
                .clone();
            match replay {
                Some(cached) => upstream.send_command(&cached).await?,
                None => {
                    return Err(ProtocolError::HandshakeError(
                        "no cached v4 login to replay".into(),
                    ))
                }
            }
        } else {
            if init.command != SERVER_INIT_CONSOLE {
                return Err(ProtocolError::HandshakeError(format!(
                    "unexpected upstream init command {:02X}",
                    init.command
                )));
            }
            let (server_seed, client_seed) = parse_server_init_console(&init.data)?;
            if version.generation() <= Generation::V2 {
                upstream.set_ciphers(
                    Some(Box::new(LegacyCipher::new(server_seed))),
                    Some(Box::new(LegacyCipher::new(client_seed))),
                );
            } else {
                upstream.set_ciphers(
                    Some(Box::new(ConsoleCipher::new(server_seed))),
                    Some(Box::new(ConsoleCipher::new(client_seed))),
                );
            }
            let login = self
                .login
                .lock()
                .map_err(|_| ProtocolError::SessionGone)?
                .clone();
            let opcode = match version.generation() {
                Generation::PreV1 => LOGIN_OPCODE_PROTO,
                Generation::V1 => LOGIN_OPCODE_V1,
                Generation::V2 => LOGIN_OPCODE_V2,
                _ => LOGIN_OPCODE_V3,
            };
            let payload = build_console_login(&login, login.serial_number);
            upstream.send(opcode, 0, &payload).await?;
        }
        Ok(upstream)
    }

    /// Observe and possibly rewrite one command crossing the splice.
    /// Returns false to swallow the command instead of forwarding it.
    pub fn on_proxy_command(&self, from_server: bool, cmd: &mut Command) -> bool {
        if from_server {
            // The upstream announces the identity it assigned in its
            // set-guild-card command; capture it for substitution.
            if cmd.command == 0x04 && cmd.data.len() >= 8 {
                let assigned = u32::from_le_bytes([
                    cmd.data[4],
                    cmd.data[5],
                    cmd.data[6],
                    cmd.data[7],
                ]);
                self.remote_guild_card_number.store(assigned, Ordering::Relaxed);
                info!(
                    session = self.id,
                    assigned = format_args!("{assigned:08X}"),
                    "upstream assigned guild card number"
                );
            }
        } else if self.guild_card_substitution {
            let remote = self.remote_guild_card_number.load(Ordering::Relaxed);
            if remote != 0 && cmd.command == 0x06 && cmd.data.len() >= 8 {
                // Replace the client's canonical identity with the
                // upstream-provided one in guild-card sends.
                cmd.data[4..8].copy_from_slice(&remote.to_le_bytes());
            }
        }
        true
    }

    /// The upstream is gone: delete the other lobby players client-side,
    /// show an info message, and redirect the client back to the home
    /// server's login port.
    pub async fn send_to_game_server(
        &self,
        client: &mut Channel,
        server_name: &str,
        login_port: u16,
        message: &str,
    ) -> Result<()> {
        let info_text = format!("You've returned to\n{server_name}\n\n{message}");
        let encoded = text::encode_fixed(&info_text, info_text.len() * 2 + 2, TextEncoding::Utf16);
        client.send(0x11, 0, &encoded).await?;

        let mut w = ByteWriter::new(false);
        let address = match client.remote_addr {
            Some(SocketAddr::V4(v4)) => u32::from_be_bytes(v4.ip().octets()),
            _ => u32::from_be_bytes([127, 0, 0, 1]),
        };
        w.u32(address);
        w.u16(login_port);
        w.u16(0);
        client.send(0x19, 0, &w.into_vec()).await?;
        self.set_disconnect_action(DisconnectAction::CloseImmediately);
        Ok(())
    }
}

/// Splice the two halves of a linked session until either side closes.
/// Returns the action governing the session's deletion delay.
pub async fn splice(
    session: &LinkedSession,
    client: &mut Channel,
    upstream: &mut Channel,
    server_name: &str,
    login_port: u16,
) -> DisconnectAction {
    session.active.store(true, Ordering::Relaxed);
    let mut prev_server_command: Option<u16> = None;
    loop {
        tokio::select! {
            from_client = client.recv() => match from_client {
                Ok(mut cmd) => {
                    if session.on_proxy_command(false, &mut cmd) {
                        if let Err(e) = upstream.send_command(&cmd).await {
                            warn!(session = session.id, error = %e, "upstream send failed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    info!(session = session.id, error = %e, "client has disconnected");
                    session.set_disconnect_action(DisconnectAction::LongTimeout);
                    break;
                }
            },
            from_server = upstream.recv() => match from_server {
                Ok(mut cmd) => {
                    prev_server_command = Some(cmd.command);
                    if session.on_proxy_command(true, &mut cmd) {
                        if let Err(e) = client.send_command(&cmd).await {
                            warn!(session = session.id, error = %e, "client send failed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    info!(
                        session = session.id,
                        error = %e,
                        prev_command = prev_server_command.map(|c| format!("{c:04X}")),
                        "upstream has disconnected"
                    );
                    if let Err(e) = session
                        .send_to_game_server(client, server_name, login_port, "The server has\ndisconnected.")
                        .await
                    {
                        warn!(session = session.id, error = %e, "failed to redirect client");
                    }
                    break;
                }
            },
        }
    }
    session.active.store(false, Ordering::Relaxed);
    client.disconnect().await;
    upstream.disconnect().await;
    session
        .disconnect_action
        .lock()
        .map(|g| *g)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_init_payloads_round_trip() {
        let payload = build_server_init_console(0x1111_2222, 0x3333_4444);
        let (s, c) = parse_server_init_console(&payload).unwrap();
        assert_eq!((s, c), (0x1111_2222, 0x3333_4444));

        let server_key = [7u8; SEED_SIZE];
        let client_key = [9u8; SEED_SIZE];
        let payload = build_server_init_v4(&server_key, &client_key);
        let (s, c) = parse_server_init_v4(&payload).unwrap();
        assert_eq!(s, server_key);
        assert_eq!(c, client_key);
    }

    #[test]
    fn console_login_round_trips() {
        let login = CapturedLogin {
            serial_number: 0x0012_ABCD,
            access_key: "key-key-key".into(),
            character_name: "Sue".into(),
            sub_version: 0x41,
            language: 1,
        };
        let payload = build_console_login(&login, login.serial_number);
        let parsed = parse_console_login(&payload).unwrap();
        assert_eq!(parsed.serial_number, login.serial_number);
        assert_eq!(parsed.access_key, login.access_key);
        assert_eq!(parsed.character_name, login.character_name);
        assert_eq!(parsed.sub_version, login.sub_version);
    }

    #[test]
    fn disconnect_actions_have_documented_delays() {
        assert_eq!(DisconnectAction::LongTimeout.delay(), Duration::from_secs(300));
        assert_eq!(DisconnectAction::MediumTimeout.delay(), Duration::from_secs(30));
        assert_eq!(DisconnectAction::ShortTimeout.delay(), Duration::from_secs(10));
        assert_eq!(DisconnectAction::CloseImmediately.delay(), Duration::ZERO);
    }

    #[test]
    fn v4_login_folds_username_into_serial() {
        let mut data = vec![0u8; 48];
        data[..5].copy_from_slice(b"guild");
        data[16..20].copy_from_slice(b"pass");
        let a = parse_v4_login(&data).unwrap();
        let b = parse_v4_login(&data).unwrap();
        assert_eq!(a.serial_number, b.serial_number);
        assert!(a.serial_number <= 0x7FFF_FFFF);
        assert_eq!(a.character_name, "guild");
    }
}
