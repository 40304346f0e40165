//! Credential Generation
//!
//! Passwords are drawn from the operating system's CSPRNG and encoded with the URL-safe
//! base64 alphabet (`A-Z a-z 0-9 - _`) without padding, so they survive shells, URIs and
//! `.env` files without quoting. Every call produces a fresh password.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Length used when no (or an unusable) length is requested
pub const DEFAULT_PASSWORD_LENGTH: usize = 32;

/// Longest password handed out; longer requests count as unusable
pub const MAX_PASSWORD_LENGTH: usize = 4096;

/// Generate a password of exactly `length` characters
///
/// A `length` of 0 or above [`MAX_PASSWORD_LENGTH`] yields [`DEFAULT_PASSWORD_LENGTH`].
#[must_use]
pub fn generate_password(length: usize) -> String {
    let length = if (1..=MAX_PASSWORD_LENGTH).contains(&length) {
        length
    } else {
        DEFAULT_PASSWORD_LENGTH
    };

    // 3 bytes encode to 4 characters
    let mut bytes = vec![0u8; length.div_ceil(4) * 3];
    OsRng.fill_bytes(&mut bytes);

    let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
    encoded.truncate(length);
    encoded
}

/// Interpret a user-supplied length argument
///
/// Anything that is not an integer in `1..=MAX_PASSWORD_LENGTH` falls back to
/// [`DEFAULT_PASSWORD_LENGTH`].
#[must_use]
pub fn parse_length(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| (1..=MAX_PASSWORD_LENGTH).contains(n))
        .unwrap_or(DEFAULT_PASSWORD_LENGTH)
}

/// A freshly generated login, printed once and never stored
#[derive(Clone)]
pub struct GeneratedCredential {
    pub username: String,
    pub password: String,
}

impl GeneratedCredential {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into(), password: generate_password(DEFAULT_PASSWORD_LENGTH) }
    }
}

impl std::fmt::Debug for GeneratedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_url_safe(s: &str) -> bool {
        s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    #[test]
    fn test_default_length() {
        assert_eq!(generate_password(0).len(), 32);
        assert_eq!(generate_password(DEFAULT_PASSWORD_LENGTH).len(), 32);
    }

    #[test]
    fn test_requested_lengths() {
        for len in [1, 2, 3, 4, 5, 7, 16, 31, 33, 64, 100, 257] {
            let pw = generate_password(len);
            assert_eq!(pw.len(), len, "length {len}");
            assert!(is_url_safe(&pw), "{pw} is not URL-safe");
        }
    }

    #[test]
    fn test_no_padding_or_standard_alphabet() {
        for _ in 0..200 {
            let pw = generate_password(32);
            assert!(!pw.contains('='));
            assert!(!pw.contains('+'));
            assert!(!pw.contains('/'));
        }
    }

    #[test]
    fn test_no_collisions_across_ten_thousand_calls() {
        let mut seen = HashSet::with_capacity(10_000);
        for _ in 0..10_000 {
            assert!(seen.insert(generate_password(32)), "duplicate password generated");
        }
    }

    #[test]
    fn test_parse_length() {
        assert_eq!(parse_length(None), 32);
        assert_eq!(parse_length(Some("16")), 16);
        assert_eq!(parse_length(Some(" 48 ")), 48);
        assert_eq!(parse_length(Some("0")), 32);
        assert_eq!(parse_length(Some("-5")), 32);
        assert_eq!(parse_length(Some("abc")), 32);
        assert_eq!(parse_length(Some("")), 32);
    }

    #[test]
    fn test_oversized_lengths_fall_back_to_default() {
        assert_eq!(parse_length(Some("4096")), MAX_PASSWORD_LENGTH);
        assert_eq!(parse_length(Some("4097")), 32);
        assert_eq!(parse_length(Some("100000000000")), 32);
        assert_eq!(parse_length(Some("9223372036854775807")), 32);
        assert_eq!(parse_length(Some("99999999999999999999")), 32);

        assert_eq!(generate_password(parse_length(Some("9223372036854775807"))).len(), 32);
        assert_eq!(generate_password(usize::MAX).len(), 32);
        assert_eq!(generate_password(MAX_PASSWORD_LENGTH + 1).len(), 32);

        let longest = generate_password(MAX_PASSWORD_LENGTH);
        assert_eq!(longest.len(), MAX_PASSWORD_LENGTH);
        assert!(is_url_safe(&longest));
    }

    #[test]
    fn test_credential_is_fresh_and_redacted() {
        let a = GeneratedCredential::new("bob");
        let b = GeneratedCredential::new("bob");
        assert_ne!(a.password, b.password);
        let debug = format!("{a:?}");
        assert!(debug.contains("bob"));
        assert!(!debug.contains(&a.password));
    }
}
