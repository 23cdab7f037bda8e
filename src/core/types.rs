//! # Version Tags
//!
//! This file is part of the crossplay-gateway project.
//!
//! It defines the closed enumeration of client variants and the pure
//! functions derived from it: wire endianness and protocol generation.
//! Generation governs header shape, item layout, and subcommand numbering;
//! endianness governs how multi-byte integers are laid out on the wire.

use serde::{Deserialize, Serialize};

/// A client software variant. Every connection is tagged with one of these;
/// the tag may be refined after initial detection (e.g. a proxy session
/// that learns the exact variant from the login opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Earliest network prototype. Uses its own subcommand numbering.
    ProtoA,
    /// Second prototype. Uses the other pre-v1 subcommand numbering.
    ProtoB,
    /// First retail version.
    V1,
    /// PC-family second version.
    V2,
    /// Third-generation console variant; the only big-endian client.
    V3Cube,
    /// Third-generation set-top variant; little-endian sibling of V3Cube.
    V3Box,
    /// Fourth and final online version. 8-byte headers, key-file ciphers.
    V4,
}

/// Protocol generation, derived from the version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Generation {
    PreV1,
    V1,
    V2,
    V3,
    V4,
}

pub const ALL_VERSIONS: [Version; 7] = [
    Version::ProtoA,
    Version::ProtoB,
    Version::V1,
    Version::V2,
    Version::V3Cube,
    Version::V3Box,
    Version::V4,
];

impl Version {
    /// Whether this client writes multi-byte integers big-endian.
    pub fn is_big_endian(self) -> bool {
        matches!(self, Version::V3Cube)
    }

    pub fn generation(self) -> Generation {
        match self {
            Version::ProtoA | Version::ProtoB => Generation::PreV1,
            Version::V1 => Generation::V1,
            Version::V2 => Generation::V2,
            Version::V3Cube | Version::V3Box => Generation::V3,
            Version::V4 => Generation::V4,
        }
    }

    pub fn is_pre_v1(self) -> bool {
        self.generation() == Generation::PreV1
    }

    /// V4 interposes a 32-bit flag after the 16-bit command; everything
    /// else fits the header in four bytes.
    pub fn header_size(self) -> usize {
        if self == Version::V4 {
            8
        } else {
            4
        }
    }

    /// Encrypted frames round up to this many bytes on the wire.
    pub fn encrypted_padding(self) -> usize {
        if self == Version::V4 {
            8
        } else {
            4
        }
    }

    /// Mags on the pre-v3 retail line use a packed legacy layout instead of
    /// the canonical stat words.
    pub fn uses_legacy_mag_format(self) -> bool {
        self.generation() <= Generation::V2
    }

    pub fn name(self) -> &'static str {
        match self {
            Version::ProtoA => "proto-a",
            Version::ProtoB => "proto-b",
            Version::V1 => "v1",
            Version::V2 => "v2",
            Version::V3Cube => "v3-cube",
            Version::V3Box => "v3-box",
            Version::V4 => "v4",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_cube_variant_is_big_endian() {
        for v in ALL_VERSIONS {
            assert_eq!(v.is_big_endian(), v == Version::V3Cube);
        }
    }

    #[test]
    fn generation_ordering() {
        assert!(Version::ProtoA.generation() < Version::V1.generation());
        assert!(Version::V2.generation() < Version::V3Box.generation());
        assert!(Version::V3Cube.generation() < Version::V4.generation());
        assert_eq!(Version::V3Cube.generation(), Version::V3Box.generation());
    }

    #[test]
    fn header_sizes() {
        assert_eq!(Version::V4.header_size(), 8);
        assert_eq!(Version::V3Cube.header_size(), 4);
        assert_eq!(Version::ProtoA.header_size(), 4);
    }
}
