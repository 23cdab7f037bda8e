//! # Text Fields
//!
//! This file is part of the crossplay-gateway project.
//!
//! Bounded string fields with a language-tagged encoding. Fields shorter
//! than the bound are null-padded on encode and truncated at the first null
//! on decode. Decoded names may carry a legacy language marker (`"\tJ"` or
//! `"\tE"`) which is stripped before the text reaches application logic.

use crate::error::{ProtocolError, Result};

/// Encoding of a bounded text field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// Plain 7-bit text, one byte per unit.
    Ascii,
    /// Legacy single-byte encoding whose high half depends on the language.
    LegacySingleByte,
    /// 16-bit units, little-endian.
    Utf16,
}

/// Language tag carried alongside legacy text fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Japanese,
    English,
}

impl Language {
    pub fn from_byte(b: u8) -> Language {
        if b == 0 {
            Language::Japanese
        } else {
            Language::English
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Language::Japanese => "\tJ",
            Language::English => "\tE",
        }
    }
}

/// Strip a leading legacy language marker, returning the marker's language
/// when one was present.
pub fn strip_language_marker(s: &str) -> (&str, Option<Language>) {
    if let Some(rest) = s.strip_prefix("\tJ") {
        (rest, Some(Language::Japanese))
    } else if let Some(rest) = s.strip_prefix("\tE") {
        (rest, Some(Language::English))
    } else {
        (s, None)
    }
}

/// Decode a fixed-width text field: truncate at the first null, then strip
/// any leading language marker.
pub fn decode_fixed(raw: &[u8], encoding: TextEncoding) -> String {
    let s = match encoding {
        TextEncoding::Ascii | TextEncoding::LegacySingleByte => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            raw[..end].iter().map(|&b| b as char).collect::<String>()
        }
        TextEncoding::Utf16 => {
            let mut units = Vec::with_capacity(raw.len() / 2);
            for pair in raw.chunks_exact(2) {
                let u = u16::from_le_bytes([pair[0], pair[1]]);
                if u == 0 {
                    break;
                }
                units.push(u);
            }
            String::from_utf16_lossy(&units)
        }
    };
    strip_language_marker(&s).0.to_string()
}

/// Encode text into a fixed-width field, null-padding to `width`. Text that
/// does not fit is truncated; the field always fills exactly `width` bytes.
pub fn encode_fixed(s: &str, width: usize, encoding: TextEncoding) -> Vec<u8> {
    let mut out = vec![0u8; width];
    match encoding {
        TextEncoding::Ascii | TextEncoding::LegacySingleByte => {
            for (i, ch) in s.chars().take(width).enumerate() {
                out[i] = if ch.is_ascii() { ch as u8 } else { b'?' };
            }
        }
        TextEncoding::Utf16 => {
            let units: Vec<u16> = s.encode_utf16().collect();
            for (i, u) in units.iter().take(width / 2).enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
            }
        }
    }
    out
}

/// Encode with a language marker prepended, as v4 clients expect for
/// character names.
pub fn encode_fixed_with_marker(
    s: &str,
    lang: Language,
    width: usize,
    encoding: TextEncoding,
) -> Vec<u8> {
    let tagged = format!("{}{}", lang.marker(), s);
    encode_fixed(&tagged, width, encoding)
}

/// Parse a hexadecimal serial-number field as captured from a login
/// command.
pub fn parse_serial_number(s: &str) -> Result<u32> {
    u32::from_str_radix(s.trim_end_matches('\0').trim(), 16)
        .map_err(|_| ProtocolError::InvalidField("serial_number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii_with_null_padding() {
        let enc = encode_fixed("Guild", 16, TextEncoding::Ascii);
        assert_eq!(enc.len(), 16);
        assert_eq!(&enc[..5], b"Guild");
        assert!(enc[5..].iter().all(|&b| b == 0));
        assert_eq!(decode_fixed(&enc, TextEncoding::Ascii), "Guild");
    }

    #[test]
    fn strips_language_markers() {
        let enc = encode_fixed("\tEHunter", 16, TextEncoding::Ascii);
        assert_eq!(decode_fixed(&enc, TextEncoding::Ascii), "Hunter");
        let (s, lang) = strip_language_marker("\tJランサー");
        assert_eq!(lang, Some(Language::Japanese));
        assert_eq!(s, "ランサー");
    }

    #[test]
    fn utf16_fields_truncate_at_null() {
        let enc = encode_fixed("Mira", 16, TextEncoding::Utf16);
        assert_eq!(enc.len(), 16);
        assert_eq!(decode_fixed(&enc, TextEncoding::Utf16), "Mira");
    }

    #[test]
    fn serial_numbers_parse_as_hex() {
        assert_eq!(parse_serial_number("0012ABCD").unwrap(), 0x0012ABCD);
        assert!(parse_serial_number("not hex").is_err());
    }
}
