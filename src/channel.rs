//! # Channel
//!
//! This file is part of the crossplay-gateway project.
//!
//! A channel is the per-connection bidirectional framed stream: a version
//! tag (which may be refined after initial detection), two independent
//! cipher states, two log tags for human-readable capture, and the peer
//! addresses (or a virtual-connection sentinel for clients that arrive
//! through the IP-stack simulator).
//!
//! Lifecycle: `unbound → bound → connected → draining → closed`. Draining
//! exists solely to flush pending writes after a logical disconnect; after
//! a disconnect is initiated, inbound is disabled.

use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::core::codec::CommandCodec;
use crate::core::packet::Command;
use crate::core::types::Version;
use crate::core::text::Language;
use crate::crypto::Cipher;
use crate::error::{ProtocolError, Result};

/// Log tint for one direction of a channel's capture output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogColor {
    #[default]
    Default,
    Yellow,
    Green,
    Red,
}

impl LogColor {
    fn label(self) -> &'static str {
        match self {
            LogColor::Default => "none",
            LogColor::Yellow => "yellow",
            LogColor::Green => "green",
            LogColor::Red => "red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unbound,
    Bound,
    Connected,
    Draining,
    Closed,
}

pub struct Channel {
    framed: Option<Framed<TcpStream, CommandCodec>>,
    state: ChannelState,
    version: Version,
    pub name: String,
    pub language: Language,
    pub send_color: LogColor,
    pub recv_color: LogColor,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Set when the peer reached us through the in-process IP-stack
    /// simulator rather than a real socket.
    pub is_virtual_connection: bool,
}

impl Channel {
    /// An unbound channel; a transport is attached later with `bind`.
    pub fn new(version: Version, name: impl Into<String>) -> Channel {
        Channel {
            framed: None,
            state: ChannelState::Unbound,
            version,
            name: name.into(),
            language: Language::default(),
            send_color: LogColor::Default,
            recv_color: LogColor::Default,
            local_addr: None,
            remote_addr: None,
            is_virtual_connection: false,
        }
    }

    pub fn with_stream(stream: TcpStream, version: Version, name: impl Into<String>) -> Channel {
        let mut ch = Channel::new(version, name);
        ch.bind(stream);
        ch
    }

    pub fn with_colors(mut self, send: LogColor, recv: LogColor) -> Channel {
        self.send_color = send;
        self.recv_color = recv;
        self
    }

    pub fn bind(&mut self, stream: TcpStream) {
        self.local_addr = stream.local_addr().ok();
        self.remote_addr = stream.peer_addr().ok();
        self.is_virtual_connection = self.remote_addr.is_none();
        self.framed = Some(Framed::new(stream, CommandCodec::new(self.version)));
        self.state = ChannelState::Connected;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.framed.is_some() && self.state == ChannelState::Connected
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
        if let Some(framed) = self.framed.as_mut() {
            framed.codec_mut().set_version(version);
        }
    }

    pub fn set_ciphers(
        &mut self,
        crypt_in: Option<Box<dyn Cipher>>,
        crypt_out: Option<Box<dyn Cipher>>,
    ) {
        if let Some(framed) = self.framed.as_mut() {
            framed.codec_mut().set_ciphers(crypt_in, crypt_out);
        }
    }

    /// Build the version-appropriate header, pad, encrypt, enqueue.
    pub async fn send(&mut self, command: u16, flag: u32, data: &[u8]) -> Result<()> {
        if !self.connected() {
            warn!(channel = %self.name, command, "send on closed channel; dropping data");
            return Ok(());
        }
        debug!(
            channel = %self.name,
            version = self.version.name(),
            command = format_args!("{command:04X}"),
            flag = format_args!("{flag:08X}"),
            size = data.len(),
            color = self.send_color.label(),
            "sending"
        );
        let framed = self.framed.as_mut().ok_or(ProtocolError::SessionGone)?;
        framed.send(Command::new(command, flag, data.to_vec())).await
    }

    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.send(cmd.command, cmd.flag, &cmd.data).await
    }

    /// Wait for the next complete command. Returns an EOF-flavored I/O
    /// error when the peer closes; the caller disconnects unconditionally
    /// on any error.
    pub async fn recv(&mut self) -> Result<Command> {
        if self.state != ChannelState::Connected {
            return Err(ProtocolError::NoCommandAvailable);
        }
        let framed = self.framed.as_mut().ok_or(ProtocolError::SessionGone)?;
        match framed.next().await {
            Some(Ok(cmd)) => {
                debug!(
                    channel = %self.name,
                    version = self.version.name(),
                    command = format_args!("{:04X}", cmd.command),
                    flag = format_args!("{:08X}", cmd.flag),
                    size = cmd.data.len(),
                    color = self.recv_color.label(),
                    "received"
                );
                Ok(cmd)
            }
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ))),
        }
    }

    /// Drain pending outbound bytes, then close the transport. Inbound is
    /// disabled as soon as the drain starts.
    pub async fn disconnect(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            self.state = ChannelState::Draining;
            if let Err(e) = framed.flush().await {
                warn!(channel = %self.name, error = %e, "error draining channel");
            }
            let mut stream = framed.into_inner();
            let _ = stream.shutdown().await;
        }
        self.local_addr = None;
        self.remote_addr = None;
        self.is_virtual_connection = false;
        self.state = ChannelState::Closed;
    }

    /// Transfer the transport, ciphers, version, and peer addresses from
    /// `other` into `self`, leaving `other` disconnected. Used when an
    /// unlinked proxy session is promoted to a linked session.
    pub fn replace_with(&mut self, other: &mut Channel, name: impl Into<String>) {
        self.framed = other.framed.take();
        self.state = if self.framed.is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Unbound
        };
        self.version = other.version;
        self.language = other.language;
        self.local_addr = other.local_addr.take();
        self.remote_addr = other.remote_addr.take();
        self.is_virtual_connection = other.is_virtual_connection;
        self.name = name.into();

        other.is_virtual_connection = false;
        other.state = ChannelState::Closed;
    }
}
