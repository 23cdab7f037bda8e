//! # Proxy Server
//!
//! This file is part of the crossplay-gateway project.
//!
//! The intercepting proxy terminates the client's encrypted session,
//! performs its own handshake upstream to a real server, and splices the
//! two halves. Each listening port is bound to one client version and an
//! optional default upstream; listeners that mark themselves *direct* skip
//! the login wait entirely and link immediately (used for variants that
//! never log in).
//!
//! Linked sessions live in a registry keyed by license serial number. A
//! session whose client disappears is kept for a deletion window sized by
//! the reason it closed; reconnecting within the window cancels the timer
//! and resumes the same session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::channel::{Channel, LogColor};
use crate::config::GatewayConfig;
use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::proxy::session::{
    splice, start_client_handshake, process_unlinked_command, CapturedLogin, DisconnectAction,
    LinkedSession, LOGIN_OPCODE_V1,
};
use crate::utils::timeout;

/// Sessions for clients that never present a license draw IDs from this
/// space so they can never collide with real serial numbers.
const FIRST_UNLICENSED_SESSION_ID: u64 = 0xFF00_0000_0000_0001;

pub struct ListenerSpec {
    pub address: String,
    pub version: Version,
    pub default_upstream: Option<SocketAddr>,
    /// Link immediately without waiting for a login.
    pub direct: bool,
}

pub struct ProxyServer {
    pub config: Arc<GatewayConfig>,
    sessions: Mutex<HashMap<u64, Arc<LinkedSession>>>,
    next_unlicensed_session_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(config: Arc<GatewayConfig>) -> Arc<ProxyServer> {
        Arc::new(ProxyServer {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_unlicensed_session_id: AtomicU64::new(FIRST_UNLICENSED_SESSION_ID),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn session_by_id(&self, id: u64) -> Option<Arc<LinkedSession>> {
        self.sessions.lock().ok()?.get(&id).cloned()
    }

    /// Look up a session by its hexadecimal name, as the shell command
    /// surface addresses them.
    pub fn session_by_name(&self, name: &str) -> Result<Arc<LinkedSession>> {
        let id = u64::from_str_radix(name, 16)
            .map_err(|_| ProtocolError::ConfigError(format!("invalid session name {name}")))?;
        self.session_by_id(id).ok_or(ProtocolError::SessionGone)
    }

    /// Drop every session that is not currently spliced.
    pub fn delete_disconnected_sessions(&self) -> usize {
        let mut sessions = match self.sessions.lock() {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let before = sessions.len();
        sessions.retain(|_, s| s.active.load(Ordering::Relaxed));
        before - sessions.len()
    }

    fn delete_session(&self, id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.remove(&id).is_some() {
                info!(session = format_args!("{id:08X}"), "closed linked session");
            }
        }
    }

    /// Bind one listener and serve it forever.
    pub async fn listen(self: &Arc<Self>, spec: ListenerSpec) -> Result<()> {
        let listener = TcpListener::bind(&spec.address).await?;
        info!(
            address = %spec.address,
            version = spec.version.name(),
            direct = spec.direct,
            "proxy listening"
        );
        let spec = Arc::new(spec);
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(peer = %peer, version = spec.version.name(), "client connected");
            let server = self.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, &spec).await {
                    error!(peer = %peer, error = %e, "proxy session error");
                }
            });
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, spec: &ListenerSpec) -> Result<()> {
        let mut channel = Channel::with_stream(
            stream,
            spec.version,
            format!("UnlinkedSession:{}", spec.address),
        )
        .with_colors(LogColor::Yellow, LogColor::Green);

        if spec.direct {
            // No login on this variant; link to the default upstream
            // immediately as an unlicensed session.
            let destination = spec
                .default_upstream
                .ok_or(ProtocolError::NoUpstreamDestination)?;
            let id = self.allocate_unlicensed_id();
            let session = Arc::new(LinkedSession::new(
                id,
                spec.version,
                destination,
                CapturedLogin::default(),
                &self.config,
            ));
            self.register(session.clone())?;
            info!(session = format_args!("{id:08X}"), "opened direct linked session");
            return self.run_linked(session, channel, None).await;
        }

        // Unlinked: handshake, then wait for the login command that
        // identifies the variant and carries the credentials.
        let detector = start_client_handshake(&mut channel).await?;
        let (login, login_command) = loop {
            let cmd = timeout::with_timeout_error(
                channel.recv(),
                self.config.server.handshake_timeout,
            )
            .await?;
            if let Some(login) = process_unlinked_command(&mut channel, &cmd)? {
                break (login, cmd);
            }
        };

        let session = match self.session_by_id(login.serial_number as u64) {
            Some(existing) => {
                info!(
                    session = format_args!("{:08X}", existing.id),
                    "resuming linked session from unlinked session"
                );
                existing.cancel_deletion();
                existing
            }
            None => {
                let destination = self
                    .config
                    .proxy
                    .upstream_for(channel.version())
                    .and_then(|u| format!("{}:{}", u.host, u.port).parse().ok())
                    .or(spec.default_upstream)
                    .ok_or_else(|| {
                        warn!("no valid destination in client config or listener default");
                        ProtocolError::NoUpstreamDestination
                    })?;
                let session = Arc::new(LinkedSession::new(
                    login.serial_number as u64,
                    channel.version(),
                    destination,
                    login.clone(),
                    &self.config,
                ));
                self.register(session.clone())?;
                info!(
                    session = format_args!("{:08X}", session.id),
                    "opened licensed session for unlinked session"
                );
                session
            }
        };
        if let Ok(mut version) = session.version.lock() {
            *version = channel.version();
        }
        if channel.version() == Version::V4 && login_command.command == LOGIN_OPCODE_V1 {
            // Cache the raw login for replay into the upstream.
            *session
                .login_command_v4
                .lock()
                .map_err(|_| ProtocolError::SessionGone)? = Some(login_command);
        }

        self.run_linked(session, channel, detector).await
    }

    async fn run_linked(
        self: &Arc<Self>,
        session: Arc<LinkedSession>,
        mut client: Channel,
        detector: Option<crate::crypto::detect::SharedDetector>,
    ) -> Result<()> {
        let mut upstream = match session.connect_upstream(detector.as_ref()).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(session = format_args!("{:08X}", session.id), error = %e, "upstream connect failed");
                let _ = session
                    .send_to_game_server(
                        &mut client,
                        &self.config.server.name,
                        self.config.server.login_port,
                        "The server is\nunavailable.",
                    )
                    .await;
                client.disconnect().await;
                self.schedule_deletion(&session, DisconnectAction::CloseImmediately);
                return Err(e);
            }
        };

        // Client-visible lobby decoration hint, overridden on connect.
        if let Some(event) = self.config.proxy.override_lobby_event {
            if session
                .version
                .lock()
                .map(|v| v.generation() >= crate::core::types::Generation::V3)
                .unwrap_or(false)
            {
                let _ = client.send(0xDA, event as u32, &[]).await;
            }
        }

        let action = splice(
            &session,
            &mut client,
            &mut upstream,
            &self.config.server.name,
            self.config.server.login_port,
        )
        .await;
        self.schedule_deletion(&session, action);
        Ok(())
    }

    fn register(&self, session: Arc<LinkedSession>) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| ProtocolError::SessionGone)?;
        if sessions.contains_key(&session.id) {
            return Err(ProtocolError::ConfigError(
                "session already exists for this license".into(),
            ));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    fn allocate_unlicensed_id(&self) -> u64 {
        let id = self.next_unlicensed_session_id.fetch_add(1, Ordering::Relaxed);
        if id == u64::MAX {
            self.next_unlicensed_session_id
                .store(FIRST_UNLICENSED_SESSION_ID, Ordering::Relaxed);
        }
        id
    }

    /// Arm (or re-arm) the session's deletion timer; a later resume
    /// cancels it.
    fn schedule_deletion(self: &Arc<Self>, session: &Arc<LinkedSession>, action: DisconnectAction) {
        let delay = action.delay();
        let server = self.clone();
        let id = session.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            server.delete_session(id);
        });
        if let Ok(mut guard) = session.deletion_task.lock() {
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }
        info!(
            session = format_args!("{id:08X}"),
            delay_secs = delay.as_secs(),
            "session deletion scheduled"
        );
    }
}
