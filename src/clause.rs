//! Identifier shape detection and reusable lookup clauses.
//!
//! Every subsystem that references a subject by an already-disambiguated
//! identifier (opaque id, display code, or resolved official name) builds its
//! lookup through here instead of re-inspecting string contents at each call
//! site. Detection is purely syntactic: prefix tests classify the input into
//! an explicit shape tag once, and everything downstream branches on the tag.
//!
//! No fuzzy matching happens here. Ambiguity handling is confined to the
//! client resolver; a clause matches exactly or not at all.

use serde::{Deserialize, Serialize};

/// Syntactic shape of an identifier string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierShape {
    /// Opaque subject id (`c-` prefix).
    OpaqueId,
    /// Sequential display code (`A-` prefix).
    DisplayCode,
    /// Anything else is treated as an official name.
    Name,
}

/// Classify an identifier string by cheap prefix tests.
///
/// Detection order: opaque-id prefix first, then display-code prefix, then
/// the name fallback.
pub fn classify(input: &str) -> IdentifierShape {
    if input.starts_with(crate::ident::SubjectId::PREFIX) {
        IdentifierShape::OpaqueId
    } else if input.starts_with(crate::ident::DisplayCode::PREFIX) {
        IdentifierShape::DisplayCode
    } else {
        IdentifierShape::Name
    }
}

/// Parameterized lookup predicate executed by the store.
///
/// The name branch is exact equality on the official registered name. Human
/// free-form input must go through the client resolver first; by the time a
/// clause is built, which subject is meant has already been decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupClause {
    BySubjectId(String),
    ByDisplayCode(String),
    ByName(String),
}

impl LookupClause {
    /// Build the clause for an identifier, branching on its detected shape.
    pub fn for_identifier(input: &str) -> Self {
        let input = input.trim();
        match classify(input) {
            IdentifierShape::OpaqueId => Self::BySubjectId(input.to_string()),
            IdentifierShape::DisplayCode => Self::ByDisplayCode(input.to_string()),
            IdentifierShape::Name => Self::ByName(input.to_string()),
        }
    }

    /// The indexed field this clause matches against.
    pub fn field(&self) -> &'static str {
        match self {
            Self::BySubjectId(_) => "subjectId",
            Self::ByDisplayCode(_) => "displayCode",
            Self::ByName(_) => "name",
        }
    }

    /// The bound parameter value.
    pub fn param(&self) -> &str {
        match self {
            Self::BySubjectId(v) | Self::ByDisplayCode(v) | Self::ByName(v) => v,
        }
    }
}

impl std::fmt::Display for LookupClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = \"{}\"", self.field(), self.param())
    }
}
