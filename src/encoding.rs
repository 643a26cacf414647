//! Percent-encoding shared by SAS tokens and topic strings.
//!
//! Everything outside the RFC 3986 unreserved set is escaped, `/` included.
//! Spaces become `%20`, never `+`, and decoding leaves a literal `+` alone:
//! MQTT topics derived from these strings must not contain `+`.

use std::borrow::Cow;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Unreserved characters (`A-Z a-z 0-9 - . _ ~`) pass through; the safe set is empty.
const QUOTE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes `input`.
pub fn quote(input: &str) -> String {
    utf8_percent_encode(input, QUOTE_SET).to_string()
}

/// Decodes percent escapes in `input`. Invalid UTF-8 sequences are replaced.
pub fn unquote(input: &str) -> String {
    match percent_decode_str(input).decode_utf8_lossy() {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_reserved() {
        assert_eq!(
            quote("myhub.azure-devices.net/devices/dev1"),
            "myhub.azure-devices.net%2Fdevices%2Fdev1"
        );
        assert_eq!(quote("a b"), "a%20b");
        assert_eq!(quote("a+b=c&d"), "a%2Bb%3Dc%26d");
        assert_eq!(quote("unreserved-._~"), "unreserved-._~");
    }

    #[test]
    fn test_quote_never_emits_plus() {
        for sample in ["a b c", "+++", "x+y z", "$rid=1&a=b", "ünï cødé"] {
            assert!(!quote(sample).contains('+'), "{sample}");
        }
    }

    #[test]
    fn test_round_trip() {
        for sample in ["", "simple", "with space", "slash/and?query=1&x", "+plus+", "ünï cødé", "%41"] {
            assert_eq!(unquote(&quote(sample)), sample);
        }
    }

    #[test]
    fn test_unquote_keeps_plus() {
        assert_eq!(unquote("a+b"), "a+b");
        assert_eq!(unquote("a%20b"), "a b");
    }
}
