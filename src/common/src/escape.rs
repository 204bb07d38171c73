//! Escape policy for measurement names and tags.
//!
//! The storage engine persists series keys already escaped, so a parsed
//! measurement or tag that still contains a separator byte is malformed
//! upstream data; callers drop such series rather than re-escape them.

use crate::key::Tags;

const MEASUREMENT_ESCAPE_CODES: [u8; 2] = [b',', b' '];
const TAG_ESCAPE_CODES: [u8; 3] = [b',', b' ', b'='];

/// need_measurement_escape returns true if the raw measurement name would
/// require escaping to round-trip through a series key.
pub fn need_measurement_escape(name: &[u8]) -> bool {
    MEASUREMENT_ESCAPE_CODES
        .iter()
        .any(|c| name.contains(c))
}

/// need_tags_escape returns true if any tag key or value would require
/// escaping to round-trip through a series key.
pub fn need_tags_escape(tags: &Tags) -> bool {
    tags.iter().any(|t| {
        TAG_ESCAPE_CODES
            .iter()
            .any(|c| t.key.contains(c) || t.value.contains(c))
    })
}

pub fn need_escape(name: &[u8], tags: &Tags) -> bool {
    need_measurement_escape(name) || need_tags_escape(tags)
}

/// valid_key_tokens returns true if the measurement and every tag key and
/// value are valid UTF-8 containing no control characters.
pub fn valid_key_tokens(name: &[u8], tags: &Tags) -> bool {
    if !valid_token(name) {
        return false;
    }
    tags.iter().all(|t| valid_token(&t.key) && valid_token(&t.value))
}

fn valid_token(token: &[u8]) -> bool {
    match std::str::from_utf8(token) {
        Ok(s) => !s.chars().any(|c| c.is_control()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Tag;

    fn tags(pairs: &[(&[u8], &[u8])]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| Tag {
                key: k.to_vec(),
                value: v.to_vec(),
            })
            .collect()
    }

    #[test]
    fn test_need_escape() {
        assert!(!need_escape(b"cpu", &tags(&[(b"host", b"a")])));
        assert!(need_escape(b"cpu load", &tags(&[])));
        assert!(need_escape(b"cpu,load", &tags(&[])));
        assert!(need_escape(b"cpu", &tags(&[(b"host", b"a=b")])));
        assert!(need_escape(b"cpu", &tags(&[(b"ho st", b"a")])));
    }

    #[test]
    fn test_valid_key_tokens() {
        assert!(valid_key_tokens(b"cpu", &tags(&[(b"host", b"a")])));
        assert!(!valid_key_tokens(b"cpu", &tags(&[(b"host", b"a\x01")])));
        assert!(!valid_key_tokens(b"cpu\x7f", &tags(&[])));
        assert!(!valid_key_tokens(&[0xff, 0xfe], &tags(&[])));
    }
}
