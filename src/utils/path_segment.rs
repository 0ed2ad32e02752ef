//! File-name safe encoding of type names and ids
//!
//! Ids come from callers and may contain `/`, `..` or other characters that
//! must not reach the filesystem verbatim. Bytes outside `[A-Za-z0-9_-]`
//! are written as `%XX`, which keeps common ids readable on disk and makes
//! the mapping reversible for id listings.

/// Encode an arbitrary string as a single path segment
pub fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Decode a segment produced by [`encode`]; `None` if it is not valid
pub fn decode(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ids_stay_readable() {
        assert_eq!(encode("user-42_a"), "user-42_a");
    }

    #[test]
    fn test_path_characters_are_escaped() {
        let encoded = encode("../etc/passwd");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('.'));
        assert_eq!(decode(&encoded).as_deref(), Some("../etc/passwd"));
    }

    #[test]
    fn test_unicode_round_trip() {
        let raw = "café ☕";
        assert_eq!(decode(&encode(raw)).as_deref(), Some(raw));
    }

    #[test]
    fn test_decode_rejects_truncated_escape() {
        assert_eq!(decode("abc%4"), None);
    }
}
