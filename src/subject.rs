//! Core data model: subjects and their identity records.
//!
//! A [`SubjectRow`] is the canonical anchor for one care recipient and holds
//! only operational attributes. Everything that identifies the person lives
//! in the [`IdentityRecord`] owned by the subject. Rows created before the
//! split carry their name and date of birth directly on the subject (the
//! legacy state); the migration engine moves that data into identity records.
//!
//! Every row is keyed by a [`NodeId`] so that legacy rows, which have no
//! subject id yet, remain addressable.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ident::{DisplayCode, SubjectId};

/// Unique, niche-optimized internal key for a subject row.
///
/// Uses `NonZeroU64` so that `Option<NodeId>` is the same size as `NodeId`.
/// Node ids are a storage detail and never leave the store layer's API
/// surface as subject references; callers use [`SubjectId`] or
/// [`DisplayCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// Create a `NodeId` from a raw `u64`. Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(NodeId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Thread-safe node id allocator.
///
/// Produces monotonically increasing ids starting from 1. The durable
/// backend persists the high-water mark so allocation resumes correctly
/// after a restart.
#[derive(Debug)]
pub struct NodeAllocator {
    next: AtomicU64,
}

impl NodeAllocator {
    /// Create a new allocator that starts from id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create an allocator that resumes from a given id.
    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocate the next node id.
    pub fn next_id(&self) -> NodeId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        // Hitting zero would require 2^64 allocations.
        NodeId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// The next id that would be allocated, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for NodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the UNIX epoch.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Stored subject row: operational data plus assigned identifiers.
///
/// The `legacy_*` fields are populated only for rows imported before the
/// PII split. They are deliberately kept in place after migration as a
/// rollback safety net; a later cleanup pass removes them once the split
/// model is verified in production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRow {
    pub node: NodeId,
    pub subject_id: Option<SubjectId>,
    pub display_code: Option<DisplayCode>,
    pub blood_type: Option<String>,
    pub legacy_name: Option<String>,
    pub legacy_reading: Option<String>,
    pub legacy_dob: Option<String>,
    pub legacy_aliases: Vec<String>,
    pub created_at: u64,
    pub migrated_at: Option<u64>,
}

impl SubjectRow {
    /// A row in the pre-split legacy state.
    pub fn legacy(node: NodeId, client: LegacyClient) -> Self {
        Self {
            node,
            subject_id: None,
            display_code: None,
            blood_type: client.blood_type,
            legacy_name: Some(client.name),
            legacy_reading: client.reading,
            legacy_dob: client.dob,
            legacy_aliases: client.aliases,
            created_at: now_secs(),
            migrated_at: None,
        }
    }

    /// Whether this row still awaits migration.
    pub fn is_legacy(&self) -> bool {
        self.subject_id.is_none()
    }
}

/// Personally-identifying information, owned by exactly one subject.
///
/// Created with its subject (or during migration) and destroyed with it.
/// Mutated only through the identity update operation, never as a side
/// effect of care-data writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Official registered name.
    pub name: String,
    /// Phonetic reading (kana).
    pub reading: Option<String>,
    /// Date of birth, ISO 8601.
    pub dob: Option<String>,
    /// Registered alternate names and nicknames.
    pub aliases: Vec<String>,
    pub created_at: u64,
}

/// Canonical combined view of a migrated subject and its identity record.
///
/// This is the handle safety-critical paths operate on; it exists only for
/// subjects that have completed the split (or were created post-split).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectView {
    pub subject_id: SubjectId,
    pub display_code: DisplayCode,
    pub blood_type: Option<String>,
    pub name: String,
    pub reading: Option<String>,
    pub dob: Option<String>,
    pub aliases: Vec<String>,
}

impl SubjectView {
    /// Assemble a view from a migrated row and its identity record.
    ///
    /// Returns `None` while the row is in the legacy state or is missing its
    /// identity record (the crash window the migration repair pass closes).
    pub fn assemble(row: &SubjectRow, identity: Option<&IdentityRecord>) -> Option<Self> {
        let subject_id = row.subject_id.clone()?;
        let display_code = row.display_code?;
        let identity = identity?;
        Some(Self {
            subject_id,
            display_code,
            blood_type: row.blood_type.clone(),
            name: identity.name.clone(),
            reading: identity.reading.clone(),
            dob: identity.dob.clone(),
            aliases: identity.aliases.clone(),
        })
    }
}

/// Redacted listing entry.
///
/// Carries no identifying fields at all: the absence is enforced by the
/// type, not by masking values at display time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectSummary {
    pub subject_id: Option<SubjectId>,
    pub display_code: Option<DisplayCode>,
    pub blood_type: Option<String>,
}

impl SubjectSummary {
    pub fn from_row(row: &SubjectRow) -> Self {
        Self {
            subject_id: row.subject_id.clone(),
            display_code: row.display_code,
            blood_type: row.blood_type.clone(),
        }
    }
}

/// Listing entry including identity fields, for callers cleared to see PII.
///
/// Name falls back to the legacy field for rows not yet migrated, so the
/// listing stays complete while a migration is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub subject_id: Option<SubjectId>,
    pub display_code: Option<DisplayCode>,
    pub blood_type: Option<String>,
    pub name: Option<String>,
    pub reading: Option<String>,
    pub dob: Option<String>,
    pub aliases: Vec<String>,
}

impl SubjectProfile {
    pub fn from_row(row: &SubjectRow, identity: Option<&IdentityRecord>) -> Self {
        match identity {
            Some(identity) => Self {
                subject_id: row.subject_id.clone(),
                display_code: row.display_code,
                blood_type: row.blood_type.clone(),
                name: Some(identity.name.clone()),
                reading: identity.reading.clone(),
                dob: identity.dob.clone(),
                aliases: identity.aliases.clone(),
            },
            None => Self {
                subject_id: row.subject_id.clone(),
                display_code: row.display_code,
                blood_type: row.blood_type.clone(),
                name: row.legacy_name.clone(),
                reading: row.legacy_reading.clone(),
                dob: row.legacy_dob.clone(),
                aliases: row.legacy_aliases.clone(),
            },
        }
    }
}

/// Input for registering a new subject post-split.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSubject {
    pub name: String,
    pub reading: Option<String>,
    pub dob: Option<String>,
    pub blood_type: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Input for seeding a pre-split legacy row, e.g. from a data import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyClient {
    pub name: String,
    pub reading: Option<String>,
    pub dob: Option<String>,
    pub blood_type: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Partial update to an identity record. `None` fields are left unchanged;
/// `add_aliases` entries are appended if not already present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityPatch {
    pub name: Option<String>,
    pub reading: Option<String>,
    pub dob: Option<String>,
    #[serde(default)]
    pub add_aliases: Vec<String>,
}

impl IdentityPatch {
    /// Apply the patch to an identity record.
    pub fn apply(&self, identity: &mut IdentityRecord) {
        if let Some(name) = &self.name {
            identity.name = name.clone();
        }
        if let Some(reading) = &self.reading {
            identity.reading = Some(reading.clone());
        }
        if let Some(dob) = &self.dob {
            identity.dob = Some(dob.clone());
        }
        for alias in &self.add_aliases {
            if !identity.aliases.contains(alias) {
                identity.aliases.push(alias.clone());
            }
        }
    }
}

/// A candidate record proposed by the extraction collaborator.
///
/// The subject name in here is a machine guess over narrative text. The
/// write path re-resolves it through the client resolver rather than
/// trusting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedRecord {
    pub name: String,
    pub reading: Option<String>,
    pub dob: Option<String>,
    pub blood_type: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}
