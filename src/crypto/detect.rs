//! # Multi-Key Detection (v4)
//!
//! This file is part of the crossplay-gateway project.
//!
//! v4 client builds ship with different key files, and the server cannot
//! know which one a connection uses until the client speaks. The detector
//! holds every candidate key and, on the first inbound block, tries each
//! one: if the trial decryption yields a plausible header whose command is
//! one of the expected initial commands, the detector commits to that key
//! and behaves as a normal v4 cipher from then on.
//!
//! The imitator drives the outbound stream of the same channel: it waits
//! for the detector's commitment and then builds the matching cipher over
//! the server-side seed.
//!
//! If no candidate matches within a bounded byte count the channel fails
//! and the session is terminated.

use crate::core::types::Version;
use crate::crypto::online::{OnlineCipher, StreamKeyFile, SEED_SIZE};
use crate::crypto::Cipher;
use crate::error::{ProtocolError, Result};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Commands a freshly connected v4 client may legitimately send first.
pub const EXPECTED_INITIAL_COMMANDS: &[u16] = &[0x93, 0x05];

/// Give up on detection after this many inbound bytes.
pub const DETECTION_LIMIT: usize = 0x800;

/// Process-wide candidate keyset. Installed once at startup, read-only
/// afterwards.
static DETECTION_KEYSET: OnceCell<Vec<Arc<StreamKeyFile>>> = OnceCell::new();

pub fn install_detection_keyset(keys: Vec<Arc<StreamKeyFile>>) {
    if DETECTION_KEYSET.set(keys).is_err() {
        warn!("detection keyset was already installed; ignoring new keys");
    }
}

pub fn detection_keyset() -> Vec<Arc<StreamKeyFile>> {
    DETECTION_KEYSET.get().cloned().unwrap_or_default()
}

pub struct MultiKeyDetector {
    candidates: Vec<Arc<StreamKeyFile>>,
    client_seed: [u8; SEED_SIZE],
    expected_first_commands: &'static [u16],
    committed: Option<(Arc<StreamKeyFile>, OnlineCipher)>,
    bytes_examined: usize,
    failed: bool,
}

impl MultiKeyDetector {
    pub fn new(candidates: Vec<Arc<StreamKeyFile>>, client_seed: [u8; SEED_SIZE]) -> Self {
        MultiKeyDetector {
            candidates,
            client_seed,
            expected_first_commands: EXPECTED_INITIAL_COMMANDS,
            committed: None,
            bytes_examined: 0,
            failed: false,
        }
    }

    /// The key this detector committed to, if any.
    pub fn committed_key(&self) -> Option<Arc<StreamKeyFile>> {
        self.committed.as_ref().map(|(k, _)| k.clone())
    }

    fn try_commit(&mut self, first_block: &[u8]) -> bool {
        for key in &self.candidates {
            let mut trial = OnlineCipher::new(key, &self.client_seed);
            let mut plain = [0u8; 8];
            plain.copy_from_slice(&first_block[..8]);
            // Trial decryptions never advance; only the winner's state is
            // kept.
            if trial.decrypt(&mut plain, false).is_err() {
                continue;
            }
            let size = u16::from_le_bytes([plain[0], plain[1]]) as usize;
            let command = u16::from_le_bytes([plain[2], plain[3]]);
            if size >= Version::V4.header_size()
                && size <= crate::core::packet::MAX_FRAME_SIZE
                && self.expected_first_commands.contains(&command)
            {
                debug!(key = %key.name, command, "cipher detection committed");
                self.committed = Some((key.clone(), trial));
                return true;
            }
        }
        false
    }
}

impl Cipher for MultiKeyDetector {
    fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        match self.committed.as_mut() {
            Some((_, cipher)) => cipher.encrypt(data, advance),
            None => Err(ProtocolError::CipherDetectionFailed),
        }
    }

    fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        if self.failed {
            return Err(ProtocolError::CipherDetectionFailed);
        }
        if self.committed.is_none() {
            if data.len() < 8 {
                return Err(ProtocolError::NoCommandAvailable);
            }
            self.bytes_examined += data.len();
            if !self.try_commit(data) {
                if self.bytes_examined >= DETECTION_LIMIT {
                    self.failed = true;
                }
                warn!(
                    candidates = self.candidates.len(),
                    examined = self.bytes_examined,
                    "no candidate key matched the initial command"
                );
                return Err(ProtocolError::CipherDetectionFailed);
            }
        }
        let (_, cipher) = self.committed.as_mut().expect("committed above");
        cipher.decrypt(data, advance)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        match self.committed.as_mut() {
            Some((_, cipher)) => cipher.skip(len),
            None => Err(ProtocolError::CipherDetectionFailed),
        }
    }

    fn block_size(&self) -> usize {
        8
    }
}

/// Shared handle to a detector, so an imitator (and the proxy, which later
/// moves the detector onto the upstream leg) can observe its commitment.
pub type SharedDetector = Arc<Mutex<MultiKeyDetector>>;

pub fn shared_detector(
    candidates: Vec<Arc<StreamKeyFile>>,
    client_seed: [u8; SEED_SIZE],
) -> SharedDetector {
    Arc::new(Mutex::new(MultiKeyDetector::new(candidates, client_seed)))
}

/// Cipher adapter that forwards to a shared detector.
pub struct SharedDetectorCipher(pub SharedDetector);

impl Cipher for SharedDetectorCipher {
    fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| ProtocolError::HandshakeError("detector lock poisoned".into()))?;
        guard.encrypt(data, advance)
    }

    fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| ProtocolError::HandshakeError("detector lock poisoned".into()))?;
        guard.decrypt(data, advance)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| ProtocolError::HandshakeError("detector lock poisoned".into()))?;
        guard.skip(len)
    }

    fn block_size(&self) -> usize {
        8
    }
}

/// Outbound cipher that aligns itself with a detector's commitment. Until
/// the detector commits, nothing can be encrypted on this stream.
pub struct MultiKeyImitator {
    detector: SharedDetector,
    seed: [u8; SEED_SIZE],
    cipher: Option<OnlineCipher>,
}

impl MultiKeyImitator {
    pub fn new(detector: SharedDetector, seed: [u8; SEED_SIZE]) -> Self {
        MultiKeyImitator {
            detector,
            seed,
            cipher: None,
        }
    }

    fn ensure_cipher(&mut self) -> Result<&mut OnlineCipher> {
        if self.cipher.is_none() {
            let key = {
                let guard = self
                    .detector
                    .lock()
                    .map_err(|_| ProtocolError::HandshakeError("detector lock poisoned".into()))?;
                guard.committed_key()
            };
            match key {
                Some(key) => self.cipher = Some(OnlineCipher::new(&key, &self.seed)),
                None => return Err(ProtocolError::CipherDetectionFailed),
            }
        }
        Ok(self.cipher.as_mut().expect("installed above"))
    }
}

impl Cipher for MultiKeyImitator {
    fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        self.ensure_cipher()?.encrypt(data, advance)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure_cipher()?.skip(len)
    }

    fn block_size(&self) -> usize {
        8
    }
}
