use encoding_rs::Encoding;
use unicode_normalization::UnicodeNormalization;

use crate::error::UsmError;

/// Chunk bodies are padded out to this alignment inside the stream section.
pub const CHUNK_ALIGN: usize = 0x20;
/// The pre-stream region is padded out to CD sector boundaries.
pub const SECTOR_SIZE: usize = 0x800;

pub const CONTENTS_END_BANNER: &[u8] = b"#CONTENTS END   ===============\0";
pub const HEADER_END_BANNER: &[u8] = b"#HEADER END     ===============\0";
pub const METADATA_END_BANNER: &[u8] = b"#METADATA END   ===============\0";

/// Convert to a filesystem-friendly slug: normalize, lowercase, drop
/// everything that isn't alphanumeric, `_`, `.`, `,`, `+`, or `-`, and
/// collapse whitespace/dash runs into single dashes.
pub fn slugify(value: &str, allow_unicode: bool) -> String {
    let normalized: String = if allow_unicode {
        value.nfkc().collect()
    } else {
        value.nfkd().filter(char::is_ascii).collect()
    };

    let mut result = String::with_capacity(normalized.len());
    let mut pending_dash = false;
    for c in normalized.to_lowercase().chars() {
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
            continue;
        }
        if !(c.is_alphanumeric() || matches!(c, '_' | '.' | ',' | '+')) {
            continue;
        }
        if pending_dash {
            result.push('-');
            pending_dash = false;
        }
        result.push(c);
    }

    result.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// Round `value` up to the next multiple of `align`.
pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Padding needed to bring `value` to the next multiple of `align`,
/// zero if already aligned.
pub fn align_padding(value: usize, align: usize) -> usize {
    round_up(value, align) - value
}

/// Parse a cipher key given on the command line, either decimal or hex
/// (with or without a `0x` prefix).
pub fn parse_key(text: &str) -> Result<u64, UsmError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text
            .parse::<u64>()
            .or_else(|_| u64::from_str_radix(text, 16)),
    };

    parsed.map_err(|_| UsmError::InvalidKey(format!("Couldn't parse key '{}'", text)))
}

/// Resolve a WHATWG encoding label like `shift-jis` or `utf-8`.
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding, UsmError> {
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| UsmError::Custom(format!("Unknown encoding '{}'", label)))
}

pub fn bytes_to_hex(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for byte in data {
        result.push_str(&format!("{:02x} ", byte));
    }

    result
}

#[cfg(test)]
mod tools_tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Movie File.usm", true), "movie-file.usm");
        assert_eq!(slugify("  --weird__ ", true), "weird");
        assert_eq!(slugify("op_0x01 (final).ivf", true), "op_0x01-final.ivf");
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify("a - -  b", true), "a-b");
    }

    #[test]
    fn round_up_multiples() {
        assert_eq!(round_up(0x30, 0x20), 0x40);
        assert_eq!(round_up(0x40, 0x20), 0x40);
        assert_eq!(align_padding(0x30, 0x20), 0x10);
        assert_eq!(align_padding(0x40, 0x20), 0);
    }

    #[test]
    fn parse_key_formats() {
        assert_eq!(parse_key("1234").unwrap(), 1234);
        assert_eq!(parse_key("0xDEADBEEF").unwrap(), 0xDEADBEEF);
        assert_eq!(parse_key("DEADBEEF").unwrap(), 0xDEADBEEF);
        assert!(parse_key("xyz").is_err());
    }
}
