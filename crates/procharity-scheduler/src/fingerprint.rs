//! Content fingerprint — the narrow equality key used to suppress redundant writes.
//!
//! Covers exactly `title`, `description` and `deadline`. Changes to bonus,
//! location, link, organization or category leave the fingerprint unchanged,
//! so such edits are never written back on their own.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use procharity_core::types::TaskFields;

/// Opaque, comparable digest of a task's narrative fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(fields: &TaskFields) -> Self {
        fingerprint(&fields.title, &fields.description, fields.deadline)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Deterministic across processes and releases.
///
/// Each string is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
/// An absent deadline hashes a distinct tag and never equals a concrete one.
pub fn fingerprint(title: &str, description: &str, deadline: Option<DateTime<Utc>>) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in [title, description] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    match deadline {
        None => hasher.update([0u8]),
        Some(at) => {
            hasher.update([1u8]);
            hasher.update(at.timestamp().to_le_bytes());
            hasher.update(at.timestamp_subsec_nanos().to_le_bytes());
        }
    }
    Fingerprint(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fields() -> TaskFields {
        TaskFields {
            title: "Design a flyer".into(),
            name_organization: "Fund".into(),
            deadline: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            category_id: 1,
            bonus: 5,
            location: "Moscow".into(),
            link: "https://example.org/1".into(),
            description: "A4, two colours".into(),
        }
    }

    #[test]
    fn test_ignores_non_narrative_fields() {
        let a = fields();
        let mut b = fields();
        b.bonus = 9;
        b.location = "Remote".into();
        b.link = "https://example.org/other".into();
        b.name_organization = "Other fund".into();
        b.category_id = 42;
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_narrative_fields_change_it() {
        let a = fields();
        let mut b = fields();
        b.description.push('!');
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));

        let mut c = fields();
        c.deadline = Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&c));
    }

    #[test]
    fn test_absent_deadline_is_distinct() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_ne!(fingerprint("t", "d", None), fingerprint("t", "d", Some(epoch)));
        assert_eq!(fingerprint("t", "d", None), fingerprint("t", "d", None));
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(fingerprint("ab", "c", None), fingerprint("a", "bc", None));
    }
}
