//! RFC 3986 percent-encoding, scoped to the unreserved character set.
//!
//! `percent_encode(percent_decode(s)?) == s` for any `s` whose bytes are
//! either unreserved or well-formed `%XX` triplets (spec §8).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercentError(pub String);

impl fmt::Display for PercentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid percent-encoding: {}", self.0)
    }
}

impl std::error::Error for PercentError {}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Encodes every byte outside the unreserved set as an uppercase `%XX`.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        if is_unreserved(*byte) {
            out.push(*byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Decodes `%XX` triplets back to bytes; passes unreserved bytes through.
pub fn percent_decode(input: &str) -> Result<String, PercentError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| PercentError(input.to_owned()))?;
            let hex_str = std::str::from_utf8(hex).map_err(|_| PercentError(input.to_owned()))?;
            let value = u8::from_str_radix(hex_str, 16).map_err(|_| PercentError(input.to_owned()))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| PercentError(input.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreserved_bytes_pass_through() {
        assert_eq!(percent_encode("abc-XYZ_09.~"), "abc-XYZ_09.~");
    }

    #[test]
    fn reserved_bytes_are_escaped() {
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn decode_then_encode_round_trips() {
        for s in ["hello", "a%20b", "My%20token%201", "c%2Fd"] {
            let decoded = percent_decode(s).unwrap();
            assert_eq!(percent_encode(&decoded), s);
        }
    }

    #[test]
    fn rejects_truncated_escape() {
        assert!(percent_decode("abc%2").is_err());
    }
}
