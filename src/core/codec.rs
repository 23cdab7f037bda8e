//! # Codec
//!
//! This file is part of the crossplay-gateway project.
//!
//! It adapts command framing to the [`tokio_util::codec`] traits so a
//! channel can run over any byte transport as a `Framed` stream.
//!
//! The decoder peeks the header with a *non-advancing* decrypt to learn the
//! logical length, waits until the full physical frame has arrived, then
//! consumes it and decrypts header and body with the keystream advancing.
//! Some ciphers advance differently depending on the decrypted data, so the
//! header really is decrypted twice; the non-advancing peek guarantees the
//! stream stays consistent.
//!
//! Encrypted v4 frames occupy a multiple of 8 bytes on the wire while their
//! size field rounds to 4; the decoder accounts for the difference when
//! deciding whether a full frame is buffered.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{build_frame, Command, CommandHeader, MAX_FRAME_SIZE};
use crate::core::types::Version;
use crate::crypto::Cipher;
use crate::error::{ProtocolError, Result};

pub struct CommandCodec {
    version: Version,
    crypt_in: Option<Box<dyn Cipher>>,
    crypt_out: Option<Box<dyn Cipher>>,
}

impl CommandCodec {
    pub fn new(version: Version) -> Self {
        CommandCodec {
            version,
            crypt_in: None,
            crypt_out: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Refine the version tag after initial detection. Header shape changes
    /// take effect on the next frame in either direction.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn set_ciphers(
        &mut self,
        crypt_in: Option<Box<dyn Cipher>>,
        crypt_out: Option<Box<dyn Cipher>>,
    ) {
        self.crypt_in = crypt_in;
        self.crypt_out = crypt_out;
    }

    pub fn take_ciphers(&mut self) -> (Option<Box<dyn Cipher>>, Option<Box<dyn Cipher>>) {
        (self.crypt_in.take(), self.crypt_out.take())
    }

    pub fn encryption_enabled(&self) -> bool {
        self.crypt_out.is_some()
    }

    fn physical_size(&self, logical: usize) -> usize {
        if self.crypt_in.is_some() && self.version == Version::V4 {
            (logical + 7) & !7
        } else {
            logical
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        let header_size = self.version.header_size();
        if src.len() < header_size {
            return Ok(None);
        }

        let mut header_bytes = src[..header_size].to_vec();
        if let Some(crypt) = self.crypt_in.as_mut() {
            match crypt.decrypt(&mut header_bytes, false) {
                Ok(()) => {}
                Err(ProtocolError::NoCommandAvailable) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let header = CommandHeader::parse(self.version, &header_bytes)?;
        let logical = header.size as usize;
        let physical = self.physical_size(logical);
        if physical > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        if src.len() < physical {
            return Ok(None);
        }

        let mut frame = src.split_to(physical);
        if let Some(crypt) = self.crypt_in.as_mut() {
            crypt.decrypt(&mut frame[..], true)?;
        }
        let data = frame[header_size..logical].to_vec();
        Ok(Some(Command {
            command: header.command,
            flag: header.flag,
            data,
        }))
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<()> {
        let mut frame = build_frame(
            self.version,
            cmd.command,
            cmd.flag,
            &cmd.data,
            self.crypt_out.is_some(),
        )?;
        if let Some(crypt) = self.crypt_out.as_mut() {
            crypt.encrypt(&mut frame, true)?;
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ConsoleCipher, LegacyCipher, OnlineCipher, StreamKeyFile, SEED_SIZE};

    fn codec_pair(version: Version) -> (CommandCodec, CommandCodec) {
        (CommandCodec::new(version), CommandCodec::new(version))
    }

    fn install(version: Version, sender: &mut CommandCodec, receiver: &mut CommandCodec) {
        match version {
            Version::V4 => {
                let key = StreamKeyFile::test_key(5);
                let seed = [7u8; SEED_SIZE];
                sender.set_ciphers(None, Some(Box::new(OnlineCipher::new(&key, &seed))));
                receiver.set_ciphers(Some(Box::new(OnlineCipher::new(&key, &seed))), None);
            }
            Version::V3Cube | Version::V3Box => {
                sender.set_ciphers(None, Some(Box::new(ConsoleCipher::new(0x44))));
                receiver.set_ciphers(Some(Box::new(ConsoleCipher::new(0x44))), None);
            }
            _ => {
                sender.set_ciphers(None, Some(Box::new(LegacyCipher::new(0x44))));
                receiver.set_ciphers(Some(Box::new(LegacyCipher::new(0x44))), None);
            }
        }
    }

    #[test]
    fn encrypted_round_trip_every_version() {
        for version in crate::core::types::ALL_VERSIONS {
            let (mut sender, mut receiver) = codec_pair(version);
            install(version, &mut sender, &mut receiver);

            let cmd = Command::new(0x60, 0, b"subcmd".to_vec());
            let mut wire = BytesMut::new();
            sender.encode(cmd.clone(), &mut wire).unwrap();

            let padding = version.encrypted_padding();
            assert_eq!(wire.len() % padding, 0, "{version:?} padding");

            let decoded = receiver.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded.command, cmd.command);
            assert_eq!(decoded.flag, cmd.flag);
            // Decoded payload may carry the pad bytes the size field covers.
            assert!(decoded.data.starts_with(&cmd.data));
            assert!(wire.is_empty());
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let (mut sender, mut receiver) = codec_pair(Version::V4);
        install(Version::V4, &mut sender, &mut receiver);

        let cmd = Command::new(0x93, 1, vec![0xAB; 24]);
        let mut wire = BytesMut::new();
        sender.encode(cmd, &mut wire).unwrap();

        let full = wire.clone();
        let mut partial = BytesMut::from(&full[..10]);
        assert!(receiver.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[10..]);
        let decoded = receiver.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.command, 0x93);
        assert_eq!(decoded.flag, 1);
    }

    #[test]
    fn repeated_peek_does_not_skew_the_stream() {
        // Feeding the same buffered header repeatedly (as a transport
        // would while a frame trickles in) must not advance crypt_in.
        let (mut sender, mut receiver) = codec_pair(Version::V3Cube);
        install(Version::V3Cube, &mut sender, &mut receiver);

        let mut wire = BytesMut::new();
        sender.encode(Command::new(0x61, 0, vec![1, 2, 3, 4]), &mut wire).unwrap();
        sender.encode(Command::new(0x62, 2, vec![5, 6, 7, 8]), &mut wire).unwrap();

        let full = wire.clone();
        let mut buf = BytesMut::from(&full[..6]);
        for _ in 0..4 {
            assert!(receiver.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&full[6..]);
        let first = receiver.decode(&mut buf).unwrap().unwrap();
        let second = receiver.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command, 0x61);
        assert_eq!(second.command, 0x62);
        assert_eq!(second.data, vec![5, 6, 7, 8]);
    }

    #[test]
    fn unencrypted_frames_are_not_padded() {
        let (mut sender, mut receiver) = codec_pair(Version::V4);
        let cmd = Command::new(0x03, 0, vec![9; 5]);
        let mut wire = BytesMut::new();
        sender.encode(cmd.clone(), &mut wire).unwrap();
        assert_eq!(wire.len(), 8 + 5);
        let decoded = receiver.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.data, cmd.data);
    }
}
