//! # Stream-Cipher Suite
//!
//! This file is part of the crossplay-gateway project.
//!
//! Three keystream generators cover every client generation: the legacy
//! 57-word generator for the v1/v2 line, the 521-word generator for the v3
//! consoles, and the key-file-driven 1042-word generator for v4. All three
//! XOR their keystream over command bytes, advancing in 4-byte blocks
//! (8-byte on v4), and advance identically on send and receive.
//!
//! A channel installs two independent cipher states, one per direction.
//! Header bytes that are only peeked are decrypted without advancing the
//! keystream; implementations guarantee that by running non-advancing
//! operations on a copy of their state.

pub mod console;
pub mod detect;
pub mod legacy;
pub mod online;

pub use console::ConsoleCipher;
pub use detect::{MultiKeyDetector, MultiKeyImitator, SharedDetector};
pub use legacy::LegacyCipher;
pub use online::{OnlineCipher, StreamKeyFile, SEED_SIZE};

use crate::error::Result;

/// A symmetric keystream cipher. `decrypt` defaults to `encrypt` because
/// the transform is an XOR; the multi-key detector overrides it to observe
/// inbound plaintext.
pub trait Cipher: Send {
    /// XOR the keystream over `data`. When `advance` is false the cipher
    /// state is left exactly as it was.
    fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()>;

    fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<()> {
        self.encrypt(data, advance)
    }

    /// Advance the keystream by `len` bytes without touching any buffer.
    fn skip(&mut self, len: usize) -> Result<()>;

    /// Granularity of keystream advancement in bytes (4 or 8).
    fn block_size(&self) -> usize;
}

/// XOR `data` against words drawn from `next_word`, one word per 4 bytes.
/// Trailing bytes shorter than a word still consume a whole word, matching
/// the block-granular advancement of every variant.
pub(crate) fn xor_words<F: FnMut() -> u32>(data: &mut [u8], mut next_word: F) {
    for chunk in data.chunks_mut(4) {
        let key = next_word().to_le_bytes();
        for (b, k) in chunk.iter_mut().zip(key.iter()) {
            *b ^= k;
        }
    }
}
