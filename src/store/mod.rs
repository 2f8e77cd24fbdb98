//! Identity store: the two-entity data model behind the case database.
//!
//! Two backends serve different deployments:
//!
//! - [`MemBackend`] — concurrent hashmaps (DashMap); tests and ephemeral runs
//! - [`DurableBackend`] — ACID transactions (redb); production data
//!
//! [`CaseStore`] composes them behind one API. Subject rows and identity
//! records are keyed by [`NodeId`]; the unique indexes on `subjectId` and
//! `displayCode` and the lookup indexes on identity name/reading are
//! maintained on every write. Point lookups report absence as `Ok(None)`,
//! never as an error.

pub mod durable;
pub mod mem;

use std::path::Path;

use crate::clause::LookupClause;
use crate::error::StoreError;
use crate::subject::{IdentityRecord, NodeId, SubjectRow, SubjectView};

pub use durable::DurableBackend;
pub use mem::MemBackend;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage for subjects and identity records, memory-backed or durable.
#[derive(Debug)]
pub enum CaseStore {
    Memory(MemBackend),
    Durable(DurableBackend),
}

impl CaseStore {
    /// Create a memory-only store (no persistence).
    pub fn memory() -> Self {
        Self::Memory(MemBackend::new())
    }

    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        Ok(Self::Durable(DurableBackend::open(data_dir)?))
    }

    /// Allocate the next internal node id.
    pub fn alloc_node(&self) -> StoreResult<NodeId> {
        match self {
            Self::Memory(b) => Ok(b.alloc_node()),
            Self::Durable(b) => b.alloc_node(),
        }
    }

    /// Atomically insert a subject row, its identity record, and all index
    /// entries. All-or-nothing: a concurrent reader can never observe the
    /// subject without its identity record.
    pub fn insert_subject_with_identity(
        &self,
        row: &SubjectRow,
        identity: &IdentityRecord,
    ) -> StoreResult<()> {
        match self {
            Self::Memory(b) => b.insert_subject_with_identity(row, identity),
            Self::Durable(b) => b.insert_subject_with_identity(row, identity),
        }
    }

    /// Insert a row in the pre-split legacy state. No index entries exist
    /// for legacy rows; they are found by scanning nodes.
    pub fn insert_legacy(&self, row: &SubjectRow) -> StoreResult<()> {
        match self {
            Self::Memory(b) => b.insert_legacy(row),
            Self::Durable(b) => b.insert_legacy(row),
        }
    }

    /// Write a subject row, maintaining the `subjectId` and `displayCode`
    /// indexes. Fails with a conflict if either identifier is already bound
    /// to a different node; on failure nothing is written.
    pub fn put_subject(&self, row: &SubjectRow) -> StoreResult<()> {
        match self {
            Self::Memory(b) => b.put_subject(row),
            Self::Durable(b) => b.put_subject(row),
        }
    }

    /// Write the identity record owned by a subject, maintaining the
    /// name/reading lookup indexes.
    pub fn put_identity(&self, node: NodeId, identity: &IdentityRecord) -> StoreResult<()> {
        match self {
            Self::Memory(b) => b.put_identity(node, identity),
            Self::Durable(b) => b.put_identity(node, identity),
        }
    }

    pub fn get_subject(&self, node: NodeId) -> StoreResult<Option<SubjectRow>> {
        match self {
            Self::Memory(b) => b.get_subject(node),
            Self::Durable(b) => b.get_subject(node),
        }
    }

    pub fn get_identity(&self, node: NodeId) -> StoreResult<Option<IdentityRecord>> {
        match self {
            Self::Memory(b) => b.get_identity(node),
            Self::Durable(b) => b.get_identity(node),
        }
    }

    /// Point lookup through the unique `subjectId` index.
    pub fn node_by_subject_id(&self, subject_id: &str) -> StoreResult<Option<NodeId>> {
        match self {
            Self::Memory(b) => b.node_by_subject_id(subject_id),
            Self::Durable(b) => b.node_by_subject_id(subject_id),
        }
    }

    /// Point lookup through the unique `displayCode` index.
    pub fn node_by_display_code(&self, code: &str) -> StoreResult<Option<NodeId>> {
        match self {
            Self::Memory(b) => b.node_by_display_code(code),
            Self::Durable(b) => b.node_by_display_code(code),
        }
    }

    /// Exact-match lookup through the identity name index.
    pub fn nodes_by_name(&self, name: &str) -> StoreResult<Vec<NodeId>> {
        match self {
            Self::Memory(b) => b.nodes_by_name(name),
            Self::Durable(b) => b.nodes_by_name(name),
        }
    }

    /// All node ids in stable ascending order.
    pub fn nodes(&self) -> StoreResult<Vec<NodeId>> {
        match self {
            Self::Memory(b) => b.nodes(),
            Self::Durable(b) => b.nodes(),
        }
    }

    pub fn count_subjects(&self) -> StoreResult<usize> {
        match self {
            Self::Memory(b) => b.count_subjects(),
            Self::Durable(b) => b.count_subjects(),
        }
    }

    pub fn count_identities(&self) -> StoreResult<usize> {
        match self {
            Self::Memory(b) => b.count_identities(),
            Self::Durable(b) => b.count_identities(),
        }
    }

    /// Highest numeric display-code suffix currently assigned, 0 if none.
    pub fn max_display_sequence(&self) -> StoreResult<u32> {
        match self {
            Self::Memory(b) => b.max_display_sequence(),
            Self::Durable(b) => b.max_display_sequence(),
        }
    }

    /// Create any missing index structures and backfill entries from
    /// existing rows. Idempotent: re-running against a fully indexed store
    /// is a no-op, never an error.
    pub fn ensure_indexes(&self) -> StoreResult<()> {
        match self {
            Self::Memory(b) => b.ensure_indexes(),
            Self::Durable(b) => b.ensure_indexes(),
        }
    }

    /// Every subject row that owns an identity record, paired with it.
    pub fn identity_entries(&self) -> StoreResult<Vec<(SubjectRow, IdentityRecord)>> {
        match self {
            Self::Memory(b) => b.identity_entries(),
            Self::Durable(b) => b.identity_entries(),
        }
    }

    /// Whether this store survives process exit.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Durable(_))
    }

    // -----------------------------------------------------------------------
    // Derived operations
    // -----------------------------------------------------------------------

    /// Combined view of a migrated subject. `Ok(None)` while the row is
    /// still legacy or its identity record is missing.
    pub fn view(&self, node: NodeId) -> StoreResult<Option<SubjectView>> {
        let Some(row) = self.get_subject(node)? else {
            return Ok(None);
        };
        let identity = self.get_identity(node)?;
        Ok(SubjectView::assemble(&row, identity.as_ref()))
    }

    /// Execute a lookup clause. This is the single detection rule every
    /// feature shares; the name branch is exact equality only.
    ///
    /// If several subjects were registered under the same official name,
    /// the earliest registered one is returned; disambiguating such input
    /// is the resolver's job, upstream of clause building.
    pub fn find_one(&self, clause: &LookupClause) -> StoreResult<Option<SubjectView>> {
        match clause {
            LookupClause::BySubjectId(id) => match self.node_by_subject_id(id)? {
                Some(node) => self.view(node),
                None => Ok(None),
            },
            LookupClause::ByDisplayCode(code) => match self.node_by_display_code(code)? {
                Some(node) => self.view(node),
                None => Ok(None),
            },
            LookupClause::ByName(name) => {
                let mut nodes = self.nodes_by_name(name)?;
                nodes.sort();
                for node in nodes {
                    if let Some(view) = self.view(node)? {
                        return Ok(Some(view));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Number of rows still in the legacy state.
    pub fn count_unmigrated(&self) -> StoreResult<usize> {
        let mut count = 0;
        for node in self.nodes()? {
            if let Some(row) = self.get_subject(node)? {
                if row.is_legacy() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// All rows with their identity records, ordered for listings:
    /// migrated rows by display-code sequence, legacy rows after them by
    /// node id.
    pub fn list_rows(&self) -> StoreResult<Vec<(SubjectRow, Option<IdentityRecord>)>> {
        let mut entries = Vec::new();
        for node in self.nodes()? {
            if let Some(row) = self.get_subject(node)? {
                let identity = self.get_identity(node)?;
                entries.push((row, identity));
            }
        }
        entries.sort_by_key(|(row, _)| {
            (
                row.display_code.map_or(u32::MAX, |c| c.sequence()),
                row.node.get(),
            )
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{DisplayCode, SubjectId};
    use crate::subject::{now_secs, LegacyClient};

    fn migrated_row(store: &CaseStore, seq: u32) -> SubjectRow {
        let node = store.alloc_node().unwrap();
        SubjectRow {
            node,
            subject_id: Some(SubjectId::generate()),
            display_code: Some(DisplayCode::from_sequence(seq)),
            blood_type: None,
            legacy_name: None,
            legacy_reading: None,
            legacy_dob: None,
            legacy_aliases: vec![],
            created_at: now_secs(),
            migrated_at: None,
        }
    }

    fn identity(name: &str) -> IdentityRecord {
        IdentityRecord {
            name: name.to_string(),
            reading: None,
            dob: None,
            aliases: vec![],
            created_at: now_secs(),
        }
    }

    #[test]
    fn find_one_by_each_clause_shape() {
        let store = CaseStore::memory();
        let row = migrated_row(&store, 1);
        store
            .insert_subject_with_identity(&row, &identity("山田健太"))
            .unwrap();

        let sid = row.subject_id.clone().unwrap();
        let by_id = store
            .find_one(&LookupClause::BySubjectId(sid.as_str().into()))
            .unwrap()
            .unwrap();
        assert_eq!(by_id.name, "山田健太");

        let by_code = store
            .find_one(&LookupClause::ByDisplayCode("A-001".into()))
            .unwrap()
            .unwrap();
        assert_eq!(by_code.subject_id, sid);

        let by_name = store
            .find_one(&LookupClause::ByName("山田健太".into()))
            .unwrap()
            .unwrap();
        assert_eq!(by_name.subject_id, sid);
    }

    #[test]
    fn find_one_misses_return_none() {
        let store = CaseStore::memory();
        assert!(store
            .find_one(&LookupClause::BySubjectId("c-00000000".into()))
            .unwrap()
            .is_none());
        assert!(store
            .find_one(&LookupClause::ByName("不在者".into()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_names_resolve_to_earliest_node() {
        let store = CaseStore::memory();
        let first = migrated_row(&store, 1);
        let second = migrated_row(&store, 2);
        store
            .insert_subject_with_identity(&first, &identity("山田健太"))
            .unwrap();
        store
            .insert_subject_with_identity(&second, &identity("山田健太"))
            .unwrap();

        let found = store
            .find_one(&LookupClause::ByName("山田健太".into()))
            .unwrap()
            .unwrap();
        assert_eq!(found.subject_id, first.subject_id.clone().unwrap());
    }

    #[test]
    fn unmigrated_rows_are_counted_and_listed_last() {
        let store = CaseStore::memory();
        let migrated = migrated_row(&store, 1);
        store
            .insert_subject_with_identity(&migrated, &identity("山田健太"))
            .unwrap();

        let legacy_node = store.alloc_node().unwrap();
        store
            .insert_legacy(&SubjectRow::legacy(
                legacy_node,
                LegacyClient {
                    name: "佐々木真理".into(),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert_eq!(store.count_unmigrated().unwrap(), 1);
        assert_eq!(store.count_subjects().unwrap(), 2);

        let rows = store.list_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].0.is_legacy());
        assert!(rows[1].0.is_legacy());
    }
}
