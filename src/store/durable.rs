//! ACID-durable backend backed by redb.
//!
//! One database file holds the subject rows, identity records, and index
//! tables. Rows are bincode-encoded. Every write goes through a transaction;
//! the combined subject + identity insert commits atomically so readers
//! never observe a half-created pair.

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::store::StoreResult;
use crate::subject::{IdentityRecord, NodeAllocator, NodeId, SubjectRow};

/// Subject rows: node id → bincode [`SubjectRow`].
const SUBJECTS: TableDefinition<u64, &[u8]> = TableDefinition::new("subjects");
/// Identity records, keyed by the owning subject's node id.
const IDENTITIES: TableDefinition<u64, &[u8]> = TableDefinition::new("identities");
/// Unique index: subject id → node id.
const SUBJECT_ID_INDEX: TableDefinition<&str, u64> = TableDefinition::new("subject_id_index");
/// Unique index: display code → node id.
const DISPLAY_CODE_INDEX: TableDefinition<&str, u64> = TableDefinition::new("display_code_index");
/// Lookup index: identity name → node ids.
const NAME_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("identity_name_index");
/// Lookup index: identity reading → node ids.
const READING_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("identity_reading_index");

fn tx_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Redb {
        message: e.to_string(),
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization {
        message: format!("failed to serialize record: {e}"),
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
        message: format!("failed to deserialize record: {e}"),
    })
}

/// Durable backend using redb.
///
/// All writes go through transactions. Reads use MVCC snapshots.
pub struct DurableBackend {
    db: Arc<Database>,
    allocator: NodeAllocator,
}

impl DurableBackend {
    /// Open or create the database in the given directory. All tables are
    /// created up front so later read transactions never race table
    /// creation; creating a table that already exists is a no-op.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("anshin.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Unavailable {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        let txn = db.begin_write().map_err(tx_err)?;
        {
            txn.open_table(SUBJECTS).map_err(tx_err)?;
            txn.open_table(IDENTITIES).map_err(tx_err)?;
            txn.open_table(SUBJECT_ID_INDEX).map_err(tx_err)?;
            txn.open_table(DISPLAY_CODE_INDEX).map_err(tx_err)?;
            txn.open_multimap_table(NAME_INDEX).map_err(tx_err)?;
            txn.open_multimap_table(READING_INDEX).map_err(tx_err)?;
        }
        txn.commit().map_err(tx_err)?;

        // Resume node allocation past the highest persisted row. An id handed
        // out but never written is recomputed identically next open, which is
        // harmless: nothing ever referenced it.
        let read = db.begin_read().map_err(tx_err)?;
        let subjects = read.open_table(SUBJECTS).map_err(tx_err)?;
        let next = subjects
            .last()
            .map_err(tx_err)?
            .map(|(key, _)| key.value() + 1)
            .unwrap_or(1);

        Ok(Self {
            db: Arc::new(db),
            allocator: NodeAllocator::starting_from(next),
        })
    }

    pub fn alloc_node(&self) -> StoreResult<NodeId> {
        Ok(self.allocator.next_id())
    }

    /// Check-and-claim a unique index slot inside an open write transaction.
    fn claim_unique(
        table: &mut redb::Table<'_, &'static str, u64>,
        index: &'static str,
        key: &str,
        node: NodeId,
    ) -> StoreResult<()> {
        if let Some(existing) = table.get(key).map_err(tx_err)? {
            if existing.value() != node.get() {
                return Err(StoreError::Conflict {
                    index,
                    value: key.to_string(),
                });
            }
        }
        table.insert(key, node.get()).map_err(tx_err)?;
        Ok(())
    }

    /// Write a subject row and its unique-index entries into an open
    /// transaction. Extracted so the combined insert shares one commit.
    fn write_subject_in(txn: &redb::WriteTransaction, row: &SubjectRow) -> StoreResult<()> {
        let mut id_index = txn.open_table(SUBJECT_ID_INDEX).map_err(tx_err)?;
        let mut code_index = txn.open_table(DISPLAY_CODE_INDEX).map_err(tx_err)?;
        if let Some(subject_id) = &row.subject_id {
            Self::claim_unique(&mut id_index, "subjectId", subject_id.as_str(), row.node)?;
        }
        if let Some(code) = &row.display_code {
            Self::claim_unique(&mut code_index, "displayCode", &code.to_string(), row.node)?;
        }
        let mut subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
        subjects
            .insert(row.node.get(), encode(row)?.as_slice())
            .map_err(tx_err)?;
        Ok(())
    }

    /// Write an identity record and rebind its lookup-index entries inside
    /// an open transaction.
    fn write_identity_in(
        txn: &redb::WriteTransaction,
        node: NodeId,
        identity: &IdentityRecord,
    ) -> StoreResult<()> {
        let mut identities = txn.open_table(IDENTITIES).map_err(tx_err)?;
        let mut names = txn.open_multimap_table(NAME_INDEX).map_err(tx_err)?;
        let mut readings = txn.open_multimap_table(READING_INDEX).map_err(tx_err)?;

        let old: Option<IdentityRecord> = identities
            .get(node.get())
            .map_err(tx_err)?
            .map(|guard| decode(guard.value()))
            .transpose()?;
        if let Some(old) = old {
            names.remove(old.name.as_str(), node.get()).map_err(tx_err)?;
            if let Some(reading) = &old.reading {
                readings.remove(reading.as_str(), node.get()).map_err(tx_err)?;
            }
        }

        names.insert(identity.name.as_str(), node.get()).map_err(tx_err)?;
        if let Some(reading) = &identity.reading {
            readings.insert(reading.as_str(), node.get()).map_err(tx_err)?;
        }
        identities
            .insert(node.get(), encode(identity)?.as_slice())
            .map_err(tx_err)?;
        Ok(())
    }

    pub fn insert_subject_with_identity(
        &self,
        row: &SubjectRow,
        identity: &IdentityRecord,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(tx_err)?;
        Self::write_subject_in(&txn, row)?;
        Self::write_identity_in(&txn, row.node, identity)?;
        txn.commit().map_err(tx_err)?;
        Ok(())
    }

    pub fn insert_legacy(&self, row: &SubjectRow) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(tx_err)?;
        {
            let mut subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
            subjects
                .insert(row.node.get(), encode(row)?.as_slice())
                .map_err(tx_err)?;
        }
        txn.commit().map_err(tx_err)?;
        Ok(())
    }

    pub fn put_subject(&self, row: &SubjectRow) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(tx_err)?;
        Self::write_subject_in(&txn, row)?;
        txn.commit().map_err(tx_err)?;
        Ok(())
    }

    pub fn put_identity(&self, node: NodeId, identity: &IdentityRecord) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(tx_err)?;
        Self::write_identity_in(&txn, node, identity)?;
        txn.commit().map_err(tx_err)?;
        Ok(())
    }

    pub fn get_subject(&self, node: NodeId) -> StoreResult<Option<SubjectRow>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
        subjects
            .get(node.get())
            .map_err(tx_err)?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    pub fn get_identity(&self, node: NodeId) -> StoreResult<Option<IdentityRecord>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let identities = txn.open_table(IDENTITIES).map_err(tx_err)?;
        identities
            .get(node.get())
            .map_err(tx_err)?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    pub fn node_by_subject_id(&self, subject_id: &str) -> StoreResult<Option<NodeId>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let index = txn.open_table(SUBJECT_ID_INDEX).map_err(tx_err)?;
        Ok(index
            .get(subject_id)
            .map_err(tx_err)?
            .and_then(|guard| NodeId::new(guard.value())))
    }

    pub fn node_by_display_code(&self, code: &str) -> StoreResult<Option<NodeId>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let index = txn.open_table(DISPLAY_CODE_INDEX).map_err(tx_err)?;
        Ok(index
            .get(code)
            .map_err(tx_err)?
            .and_then(|guard| NodeId::new(guard.value())))
    }

    pub fn nodes_by_name(&self, name: &str) -> StoreResult<Vec<NodeId>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let index = txn.open_multimap_table(NAME_INDEX).map_err(tx_err)?;
        let mut nodes = Vec::new();
        for value in index.get(name).map_err(tx_err)? {
            let guard = value.map_err(tx_err)?;
            if let Some(node) = NodeId::new(guard.value()) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn nodes(&self) -> StoreResult<Vec<NodeId>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
        let mut nodes = Vec::new();
        for entry in subjects.iter().map_err(tx_err)? {
            let (key, _) = entry.map_err(tx_err)?;
            if let Some(node) = NodeId::new(key.value()) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn count_subjects(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
        Ok(subjects.len().map_err(tx_err)? as usize)
    }

    pub fn count_identities(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let identities = txn.open_table(IDENTITIES).map_err(tx_err)?;
        Ok(identities.len().map_err(tx_err)? as usize)
    }

    pub fn max_display_sequence(&self) -> StoreResult<u32> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let index = txn.open_table(DISPLAY_CODE_INDEX).map_err(tx_err)?;
        let mut max = 0;
        for entry in index.iter().map_err(tx_err)? {
            let (key, _) = entry.map_err(tx_err)?;
            if let Ok(code) = crate::ident::DisplayCode::parse(key.value()) {
                max = max.max(code.sequence());
            }
        }
        Ok(max)
    }

    pub fn ensure_indexes(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(tx_err)?;
        {
            let subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
            let mut id_index = txn.open_table(SUBJECT_ID_INDEX).map_err(tx_err)?;
            let mut code_index = txn.open_table(DISPLAY_CODE_INDEX).map_err(tx_err)?;
            for entry in subjects.iter().map_err(tx_err)? {
                let (_, value) = entry.map_err(tx_err)?;
                let row: SubjectRow = decode(value.value())?;
                if let Some(subject_id) = &row.subject_id {
                    Self::claim_unique(&mut id_index, "subjectId", subject_id.as_str(), row.node)?;
                }
                if let Some(code) = &row.display_code {
                    Self::claim_unique(&mut code_index, "displayCode", &code.to_string(), row.node)?;
                }
            }

            let identities = txn.open_table(IDENTITIES).map_err(tx_err)?;
            let mut names = txn.open_multimap_table(NAME_INDEX).map_err(tx_err)?;
            let mut readings = txn.open_multimap_table(READING_INDEX).map_err(tx_err)?;
            for entry in identities.iter().map_err(tx_err)? {
                let (key, value) = entry.map_err(tx_err)?;
                let Some(node) = NodeId::new(key.value()) else {
                    continue;
                };
                let identity: IdentityRecord = decode(value.value())?;
                names.insert(identity.name.as_str(), node.get()).map_err(tx_err)?;
                if let Some(reading) = &identity.reading {
                    readings.insert(reading.as_str(), node.get()).map_err(tx_err)?;
                }
            }
        }
        txn.commit().map_err(tx_err)?;
        Ok(())
    }

    pub fn identity_entries(&self) -> StoreResult<Vec<(SubjectRow, IdentityRecord)>> {
        let txn = self.db.begin_read().map_err(tx_err)?;
        let subjects = txn.open_table(SUBJECTS).map_err(tx_err)?;
        let identities = txn.open_table(IDENTITIES).map_err(tx_err)?;
        let mut entries = Vec::new();
        for entry in identities.iter().map_err(tx_err)? {
            let (key, value) = entry.map_err(tx_err)?;
            let identity: IdentityRecord = decode(value.value())?;
            if let Some(row_guard) = subjects.get(key.value()).map_err(tx_err)? {
                let row: SubjectRow = decode(row_guard.value())?;
                entries.push((row, identity));
            }
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for DurableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBackend").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{DisplayCode, SubjectId};
    use crate::subject::now_secs;
    use tempfile::TempDir;

    fn subject(backend: &DurableBackend, id: &str, seq: u32) -> SubjectRow {
        SubjectRow {
            node: backend.alloc_node().unwrap(),
            subject_id: Some(SubjectId::parse(id).unwrap()),
            display_code: Some(DisplayCode::from_sequence(seq)),
            blood_type: Some("A".into()),
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
            reading: Some("やまだけんた".into()),
            dob: Some("1990-01-15".into()),
            aliases: vec!["けんちゃん".into()],
            created_at: now_secs(),
        }
    }

    #[test]
    fn insert_and_point_lookups() {
        let dir = TempDir::new().unwrap();
        let backend = DurableBackend::open(dir.path()).unwrap();
        let row = subject(&backend, "c-00000001", 1);
        backend
            .insert_subject_with_identity(&row, &identity("山田健太"))
            .unwrap();

        assert_eq!(
            backend.node_by_subject_id("c-00000001").unwrap(),
            Some(row.node)
        );
        assert_eq!(backend.node_by_display_code("A-001").unwrap(), Some(row.node));
        assert_eq!(backend.nodes_by_name("山田健太").unwrap(), vec![row.node]);
        assert_eq!(backend.count_identities().unwrap(), 1);
    }

    #[test]
    fn conflict_aborts_whole_transaction() {
        let dir = TempDir::new().unwrap();
        let backend = DurableBackend::open(dir.path()).unwrap();
        backend
            .insert_subject_with_identity(&subject(&backend, "c-00000001", 1), &identity("山田健太"))
            .unwrap();

        // Same display code, different subject: nothing may be written.
        let clashing = subject(&backend, "c-00000002", 1);
        let err = backend
            .insert_subject_with_identity(&clashing, &identity("佐々木真理"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { index: "displayCode", .. }));

        assert!(backend.node_by_subject_id("c-00000002").unwrap().is_none());
        assert!(backend.get_subject(clashing.node).unwrap().is_none());
        assert_eq!(backend.count_identities().unwrap(), 1);
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let node;
        {
            let backend = DurableBackend::open(dir.path()).unwrap();
            let row = subject(&backend, "c-00000001", 1);
            node = row.node;
            backend
                .insert_subject_with_identity(&row, &identity("山田健太"))
                .unwrap();
        }

        let backend = DurableBackend::open(dir.path()).unwrap();
        let row = backend.get_subject(node).unwrap().unwrap();
        assert_eq!(row.display_code, Some(DisplayCode::from_sequence(1)));
        assert_eq!(backend.max_display_sequence().unwrap(), 1);

        // Allocation resumes past persisted rows.
        assert!(backend.alloc_node().unwrap().get() > node.get());
    }

    #[test]
    fn identity_rewrite_rebinds_name_index() {
        let dir = TempDir::new().unwrap();
        let backend = DurableBackend::open(dir.path()).unwrap();
        let row = subject(&backend, "c-00000001", 1);
        backend
            .insert_subject_with_identity(&row, &identity("山田健太"))
            .unwrap();

        let mut renamed = identity("山田健太郎");
        renamed.reading = Some("やまだけんたろう".into());
        backend.put_identity(row.node, &renamed).unwrap();

        assert!(backend.nodes_by_name("山田健太").unwrap().is_empty());
        assert_eq!(backend.nodes_by_name("山田健太郎").unwrap(), vec![row.node]);
    }

    #[test]
    fn ensure_indexes_backfills_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = DurableBackend::open(dir.path()).unwrap();
        let row = subject(&backend, "c-00000001", 1);
        backend
            .insert_subject_with_identity(&row, &identity("山田健太"))
            .unwrap();

        backend.ensure_indexes().unwrap();
        backend.ensure_indexes().unwrap();
        assert_eq!(
            backend.node_by_subject_id("c-00000001").unwrap(),
            Some(row.node)
        );
    }
}
