//! Subject identifier types and generation.
//!
//! Two identifier kinds reference a subject:
//!
//! - [`SubjectId`] — opaque, random, never derived from PII or creation order.
//!   Generation is purely local; collisions are resolved by the caller drawing
//!   a fresh value.
//! - [`DisplayCode`] — short sequential code for human-facing listings.
//!   Generation is stateful with respect to the store (next = current max + 1),
//!   which is why assignment is serialized at the write path.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IdentError;

/// Opaque subject identifier: `c-` plus eight lowercase hex characters.
///
/// Immutable once assigned. Carries no information about the person or the
/// order of registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Prefix shared by every subject id.
    pub const PREFIX: &'static str = "c-";

    /// Draw a fresh random subject id.
    pub fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self(format!("c-{suffix:08x}"))
    }

    /// Parse and validate an externally supplied subject id.
    pub fn parse(input: &str) -> Result<Self, IdentError> {
        let suffix = input
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdentError::MalformedSubjectId {
                input: input.to_string(),
            })?;
        let valid = suffix.len() == 8
            && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(IdentError::MalformedSubjectId {
                input: input.to_string(),
            });
        }
        Ok(Self(input.to_string()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sequential human-readable code: `A-` plus a zero-padded sequence number.
///
/// Stored as the raw sequence number; serialization uses the formatted
/// text so the code reads the same everywhere it appears. Immutable once
/// assigned. Unique always; gap-free only under a single writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayCode(u32);

impl Serialize for DisplayCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DisplayCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

impl DisplayCode {
    /// Prefix shared by every display code.
    pub const PREFIX: &'static str = "A-";

    /// Code for a given sequence number.
    pub fn from_sequence(sequence: u32) -> Self {
        Self(sequence)
    }

    /// The code one past the current maximum sequence.
    ///
    /// Stateful: `current_max` must come from the store, under whatever
    /// serialization the caller provides.
    pub fn next(current_max: u32) -> Self {
        Self(current_max + 1)
    }

    /// The numeric sequence component.
    pub fn sequence(self) -> u32 {
        self.0
    }

    /// Parse and validate an externally supplied display code.
    pub fn parse(input: &str) -> Result<Self, IdentError> {
        let digits = input
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdentError::MalformedDisplayCode {
                input: input.to_string(),
            })?;
        let sequence: u32 = digits.parse().map_err(|_| IdentError::MalformedDisplayCode {
            input: input.to_string(),
        })?;
        if sequence == 0 {
            return Err(IdentError::MalformedDisplayCode {
                input: input.to_string(),
            });
        }
        Ok(Self(sequence))
    }
}

impl std::fmt::Display for DisplayCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A-{:03}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_subject_id_has_expected_shape() {
        let id = SubjectId::generate();
        assert!(id.as_str().starts_with("c-"));
        assert_eq!(id.as_str().len(), 10);
        // Round-trips through the validator.
        assert_eq!(SubjectId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn generated_subject_ids_do_not_repeat_in_practice() {
        let ids: HashSet<String> = (0..1000)
            .map(|_| SubjectId::generate().as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn subject_id_rejects_malformed_input() {
        assert!(SubjectId::parse("c-").is_err());
        assert!(SubjectId::parse("c-XYZ").is_err());
        assert!(SubjectId::parse("c-DEADBEEF").is_err());
        assert!(SubjectId::parse("c-0123456").is_err()); // too short
        assert!(SubjectId::parse("A-001").is_err());
        assert!(SubjectId::parse("山田健太").is_err());
        assert!(SubjectId::parse("c-0123abcd").is_ok());
    }

    #[test]
    fn display_code_formats_with_padding() {
        assert_eq!(DisplayCode::from_sequence(1).to_string(), "A-001");
        assert_eq!(DisplayCode::from_sequence(42).to_string(), "A-042");
        assert_eq!(DisplayCode::from_sequence(1000).to_string(), "A-1000");
    }

    #[test]
    fn display_code_next_increments_max() {
        assert_eq!(DisplayCode::next(0), DisplayCode::from_sequence(1));
        assert_eq!(DisplayCode::next(41), DisplayCode::from_sequence(42));
    }

    #[test]
    fn display_code_parse_round_trip() {
        let code = DisplayCode::parse("A-007").unwrap();
        assert_eq!(code.sequence(), 7);
        assert_eq!(code.to_string(), "A-007");

        // Unpadded large sequences still parse.
        assert_eq!(DisplayCode::parse("A-1234").unwrap().sequence(), 1234);
    }

    #[test]
    fn display_code_serializes_as_text() {
        let json = serde_json::to_string(&DisplayCode::from_sequence(7)).unwrap();
        assert_eq!(json, "\"A-007\"");
        let back: DisplayCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence(), 7);
    }

    #[test]
    fn display_code_rejects_malformed_input() {
        assert!(DisplayCode::parse("A-").is_err());
        assert!(DisplayCode::parse("A-abc").is_err());
        assert!(DisplayCode::parse("A-000").is_err());
        assert!(DisplayCode::parse("c-0123abcd").is_err());
        assert!(DisplayCode::parse("001").is_err());
    }
}
