//! # Command Framing
//!
//! This file is part of the crossplay-gateway project.
//!
//! It defines the `Command` value, the logical unit exchanged over a
//! channel, and the version-specific header layouts used to frame it.
//!
//! The protocol is specified in bit-exact terms, so headers are read and
//! written field by field with explicit endianness instead of casting over
//! raw memory.
//!
//! ## Header shapes
//! - pre-v1 and v1/v3 console variants: `(command u8, flag u8, size u16)`,
//!   big-endian integers only on the v3-cube variant
//! - v2 PC family: `(size u16 LE, command u8, flag u8)`
//! - v4: `(size u16 LE, command u16 LE, flag u32 LE)`
//!
//! The size field always covers header plus payload.

use crate::core::types::Version;
use crate::error::{ProtocolError, Result};

/// Receive-buffer size of every studied client. Nothing larger than this is
/// ever sent; oversized outputs are rejected at the source.
pub const MAX_FRAME_SIZE: usize = 0x7C00;

/// A fully decoded protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command: u16,
    pub flag: u32,
    pub data: Vec<u8>,
}

impl Command {
    pub fn new(command: u16, flag: u32, data: Vec<u8>) -> Self {
        Command { command, flag, data }
    }
}

/// Decoded header fields before the payload has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: u16,
    pub flag: u32,
    /// Logical size: header plus payload, before any encryption padding.
    pub size: u16,
}

impl CommandHeader {
    /// Parse a header from the first `version.header_size()` bytes of `buf`.
    pub fn parse(version: Version, buf: &[u8]) -> Result<CommandHeader> {
        if buf.len() < version.header_size() {
            return Err(ProtocolError::InvalidHeader);
        }
        let be = version.is_big_endian();
        let header = match version {
            Version::V4 => CommandHeader {
                size: u16::from_le_bytes([buf[0], buf[1]]),
                command: u16::from_le_bytes([buf[2], buf[3]]),
                flag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            },
            Version::V2 => CommandHeader {
                size: u16::from_le_bytes([buf[0], buf[1]]),
                command: buf[2] as u16,
                flag: buf[3] as u32,
            },
            _ => CommandHeader {
                command: buf[0] as u16,
                flag: buf[1] as u32,
                size: if be {
                    u16::from_be_bytes([buf[2], buf[3]])
                } else {
                    u16::from_le_bytes([buf[2], buf[3]])
                },
            },
        };
        if (header.size as usize) < version.header_size() {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(header)
    }

    /// Serialize this header in the version's shape.
    pub fn serialize(&self, version: Version) -> Vec<u8> {
        let be = version.is_big_endian();
        match version {
            Version::V4 => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&self.size.to_le_bytes());
                out.extend_from_slice(&self.command.to_le_bytes());
                out.extend_from_slice(&self.flag.to_le_bytes());
                out
            }
            Version::V2 => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&self.size.to_le_bytes());
                out.push(self.command as u8);
                out.push(self.flag as u8);
                out
            }
            _ => {
                let mut out = Vec::with_capacity(4);
                out.push(self.command as u8);
                out.push(self.flag as u8);
                if be {
                    out.extend_from_slice(&self.size.to_be_bytes());
                } else {
                    out.extend_from_slice(&self.size.to_le_bytes());
                }
                out
            }
        }
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

/// Compute the logical size field and the physical (transmitted) size for a
/// payload of `payload_len` bytes.
///
/// Without encryption both equal header + payload. With encryption, frames
/// pad to the version's block size; on v4 the size *field* rounds to 4 while
/// the transmitted bytes round to 8.
pub fn frame_sizes(version: Version, payload_len: usize, encrypted: bool) -> (u16, usize) {
    let raw = version.header_size() + payload_len;
    if !encrypted {
        return (raw as u16, raw);
    }
    if version == Version::V4 {
        (round_up(raw, 4) as u16, round_up(raw, 8))
    } else {
        let padded = round_up(raw, 4);
        (padded as u16, padded)
    }
}

/// Build a complete unencrypted frame (header + payload + padding) ready to
/// be handed to the cipher.
pub fn build_frame(
    version: Version,
    command: u16,
    flag: u32,
    payload: &[u8],
    encrypted: bool,
) -> Result<Vec<u8>> {
    let (logical, physical) = frame_sizes(version, payload.len(), encrypted);
    if physical > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedCommand(physical));
    }
    let header = CommandHeader {
        command,
        flag,
        size: logical,
    };
    let mut out = header.serialize(version);
    out.extend_from_slice(payload);
    out.resize(physical, 0);
    Ok(out)
}
