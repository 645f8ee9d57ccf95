//! Canonical identifier shape (spec §4.2, §6.1).
//!
//! Every identifier exchanged at any boundary — API, database, disk config,
//! logs — is lowercase hex in the canonical 36-char dashed grouping
//! `8-4-4-4-12`. `normalize` is the only operation permitted to coerce a
//! different shape into the canonical one, and only for the one-time
//! 32-char legacy upgrade path described in spec §9.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid id: {0:?}")]
    InvalidShape(String),
}

impl IdError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

fn dashed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("canonical id regex is valid")
    })
}

fn bare_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{32}$").expect("bare hex id regex is valid"))
}

/// Generate a new canonical id (v4-shape UUID, dashed, lowercase).
pub fn generate() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `is_valid(s)` accepts exactly the canonical dashed form.
pub fn is_valid(s: &str) -> bool {
    dashed_re().is_match(s)
}

/// Accepts both the dashed form and a 32-char lowercase hex form and
/// returns the dashed form. The only id operation permitted to coerce.
pub fn normalize(s: &str) -> Result<String, IdError> {
    if dashed_re().is_match(s) {
        return Ok(s.to_string());
    }
    if bare_hex_re().is_match(s) {
        let mut out = String::with_capacity(36);
        out.push_str(&s[0..8]);
        out.push('-');
        out.push_str(&s[8..12]);
        out.push('-');
        out.push_str(&s[12..16]);
        out.push('-');
        out.push_str(&s[16..20]);
        out.push('-');
        out.push_str(&s[20..32]);
        return Ok(out);
    }
    Err(IdError::InvalidShape(s.to_string()))
}

/// Validate an id argument at a store/API boundary, returning the spec's
/// `invalid_id` classification on mismatch.
pub fn require_valid(s: &str) -> Result<(), IdError> {
    if is_valid(s) {
        Ok(())
    } else {
        Err(IdError::InvalidShape(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..50 {
            assert!(is_valid(&generate()));
        }
    }

    #[test]
    fn normalize_is_left_inverse_to_emission() {
        let emitted = generate();
        assert_eq!(normalize(&emitted).unwrap(), emitted);
        assert_eq!(
            normalize(&normalize(&emitted).unwrap()).unwrap(),
            normalize(&emitted).unwrap()
        );
    }

    #[test]
    fn normalize_inserts_dashes_for_bare_hex() {
        let bare = "0123456789abcdef0123456789abcdef";
        let dashed = normalize(bare).unwrap();
        assert_eq!(dashed, "01234567-89ab-cdef-0123-456789abcdef");
        assert!(is_valid(&dashed));
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(normalize("not-an-id").is_err());
        assert!(normalize("0123456789abcdef0123456789abcdeg").is_err());
        assert!(!is_valid("0123456789abcdef0123456789abcdef"));
    }
}
