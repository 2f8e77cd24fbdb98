//! In-memory storage backed by DashMap.
//!
//! Mirrors the durable backend's semantics, including unique-index conflict
//! detection, without touching disk. All data is lost on process exit.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::store::StoreResult;
use crate::subject::{IdentityRecord, NodeAllocator, NodeId, SubjectRow};

/// Concurrent in-memory backend using sharded hashmaps.
#[derive(Debug, Default)]
pub struct MemBackend {
    subjects: DashMap<u64, SubjectRow>,
    identities: DashMap<u64, IdentityRecord>,
    subject_id_index: DashMap<String, u64>,
    display_code_index: DashMap<String, u64>,
    name_index: DashMap<String, Vec<u64>>,
    reading_index: DashMap<String, Vec<u64>>,
    allocator: NodeAllocator,
}

impl MemBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&self) -> NodeId {
        self.allocator.next_id()
    }

    /// Claim a unique index slot for `node`. Returns whether the entry was
    /// newly inserted, or a conflict if another node holds it.
    fn claim_unique(
        map: &DashMap<String, u64>,
        index: &'static str,
        key: &str,
        node: NodeId,
    ) -> StoreResult<bool> {
        match map.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                if *existing.get() == node.get() {
                    Ok(false)
                } else {
                    Err(StoreError::Conflict {
                        index,
                        value: key.to_string(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(node.get());
                Ok(true)
            }
        }
    }

    fn index_lookup(map: &DashMap<String, Vec<u64>>, key: &str, node: NodeId) {
        let mut nodes = map.entry(key.to_string()).or_default();
        if !nodes.contains(&node.get()) {
            nodes.push(node.get());
        }
    }

    fn unindex_lookup(map: &DashMap<String, Vec<u64>>, key: &str, node: NodeId) {
        if let Some(mut nodes) = map.get_mut(key) {
            nodes.retain(|n| *n != node.get());
        }
    }

    pub fn insert_subject_with_identity(
        &self,
        row: &SubjectRow,
        identity: &IdentityRecord,
    ) -> StoreResult<()> {
        self.put_subject(row)?;
        self.put_identity(row.node, identity)
    }

    pub fn insert_legacy(&self, row: &SubjectRow) -> StoreResult<()> {
        self.subjects.insert(row.node.get(), row.clone());
        Ok(())
    }

    pub fn put_subject(&self, row: &SubjectRow) -> StoreResult<()> {
        let mut claimed_id: Option<&str> = None;
        if let Some(subject_id) = &row.subject_id {
            if Self::claim_unique(
                &self.subject_id_index,
                "subjectId",
                subject_id.as_str(),
                row.node,
            )? {
                claimed_id = Some(subject_id.as_str());
            }
        }
        if let Some(code) = &row.display_code {
            let code_key = code.to_string();
            if let Err(conflict) =
                Self::claim_unique(&self.display_code_index, "displayCode", &code_key, row.node)
            {
                // Roll back the id claim so the failed write leaves no trace.
                if let Some(id_key) = claimed_id {
                    self.subject_id_index.remove(id_key);
                }
                return Err(conflict);
            }
        }
        self.subjects.insert(row.node.get(), row.clone());
        Ok(())
    }

    pub fn put_identity(&self, node: NodeId, identity: &IdentityRecord) -> StoreResult<()> {
        if let Some(old) = self.identities.get(&node.get()).map(|r| r.value().clone()) {
            Self::unindex_lookup(&self.name_index, &old.name, node);
            if let Some(reading) = &old.reading {
                Self::unindex_lookup(&self.reading_index, reading, node);
            }
        }
        Self::index_lookup(&self.name_index, &identity.name, node);
        if let Some(reading) = &identity.reading {
            Self::index_lookup(&self.reading_index, reading, node);
        }
        self.identities.insert(node.get(), identity.clone());
        Ok(())
    }

    pub fn get_subject(&self, node: NodeId) -> StoreResult<Option<SubjectRow>> {
        Ok(self.subjects.get(&node.get()).map(|r| r.value().clone()))
    }

    pub fn get_identity(&self, node: NodeId) -> StoreResult<Option<IdentityRecord>> {
        Ok(self.identities.get(&node.get()).map(|r| r.value().clone()))
    }

    pub fn node_by_subject_id(&self, subject_id: &str) -> StoreResult<Option<NodeId>> {
        Ok(self
            .subject_id_index
            .get(subject_id)
            .and_then(|n| NodeId::new(*n)))
    }

    pub fn node_by_display_code(&self, code: &str) -> StoreResult<Option<NodeId>> {
        Ok(self
            .display_code_index
            .get(code)
            .and_then(|n| NodeId::new(*n)))
    }

    pub fn nodes_by_name(&self, name: &str) -> StoreResult<Vec<NodeId>> {
        Ok(self
            .name_index
            .get(name)
            .map(|nodes| nodes.iter().copied().filter_map(NodeId::new).collect())
            .unwrap_or_default())
    }

    pub fn nodes(&self) -> StoreResult<Vec<NodeId>> {
        let mut nodes: Vec<NodeId> = self
            .subjects
            .iter()
            .filter_map(|entry| NodeId::new(*entry.key()))
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    pub fn count_subjects(&self) -> StoreResult<usize> {
        Ok(self.subjects.len())
    }

    pub fn count_identities(&self) -> StoreResult<usize> {
        Ok(self.identities.len())
    }

    pub fn max_display_sequence(&self) -> StoreResult<u32> {
        Ok(self
            .subjects
            .iter()
            .filter_map(|entry| entry.value().display_code.map(|c| c.sequence()))
            .max()
            .unwrap_or(0))
    }

    pub fn ensure_indexes(&self) -> StoreResult<()> {
        for entry in self.subjects.iter() {
            let row = entry.value();
            if let Some(subject_id) = &row.subject_id {
                Self::claim_unique(
                    &self.subject_id_index,
                    "subjectId",
                    subject_id.as_str(),
                    row.node,
                )?;
            }
            if let Some(code) = &row.display_code {
                Self::claim_unique(
                    &self.display_code_index,
                    "displayCode",
                    &code.to_string(),
                    row.node,
                )?;
            }
        }
        for entry in self.identities.iter() {
            let node = NodeId::new(*entry.key());
            let identity = entry.value();
            if let Some(node) = node {
                Self::index_lookup(&self.name_index, &identity.name, node);
                if let Some(reading) = &identity.reading {
                    Self::index_lookup(&self.reading_index, reading, node);
                }
            }
        }
        Ok(())
    }

    pub fn identity_entries(&self) -> StoreResult<Vec<(SubjectRow, IdentityRecord)>> {
        let mut entries = Vec::with_capacity(self.identities.len());
        for identity in self.identities.iter() {
            if let Some(row) = self.subjects.get(identity.key()) {
                entries.push((row.clone(), identity.value().clone()));
            }
        }
        entries.sort_by_key(|(row, _)| row.node.get());
        Ok(entries)
    }
}
