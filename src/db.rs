//! Case database facade: the public surface of the identity layer.
//!
//! `CaseDb` owns the store and the display-code write lock, and exposes the
//! operations every front end uses: registration, point lookups, listings,
//! resolution, migration, and the write path for machine-proposed records.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::clause::LookupClause;
use crate::error::{AnshinResult, IdentError, StoreError};
use crate::ident::{DisplayCode, SubjectId};
use crate::migrate::{MigrationEngine, MigrationReport};
use crate::resolve::{MatchType, Resolution, Resolver};
use crate::store::CaseStore;
use crate::subject::{
    now_secs, IdentityPatch, IdentityRecord, LegacyClient, NewSubject, NodeId, ProposedRecord,
    SubjectProfile, SubjectRow, SubjectSummary, SubjectView,
};

/// Configuration for the case database.
#[derive(Debug, Clone)]
pub struct CaseDbConfig {
    /// Data directory for persistence. `None` for memory-only mode.
    pub data_dir: Option<PathBuf>,
    /// Collision retries before identifier generation is declared broken.
    pub max_id_retries: usize,
}

impl Default for CaseDbConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_id_retries: 8,
        }
    }
}

/// Outcome of admitting a record proposed by the extraction collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdmitOutcome {
    /// The proposed name resolved to exactly one subject.
    Matched {
        match_type: MatchType,
        subject: SubjectView,
    },
    /// The proposed name was ambiguous; a human must confirm before the
    /// record can be attached to anyone.
    NeedsConfirmation {
        suggested_name: Option<String>,
        candidates: Vec<String>,
    },
    /// No subject cleared the threshold.
    Unmatched,
}

/// The client identity resolution and pseudonymization layer.
pub struct CaseDb {
    config: CaseDbConfig,
    store: CaseStore,
    /// Serializes the read-max/write-new-code step of display-code
    /// assignment. The store's uniqueness check remains as backstop.
    code_lock: Mutex<()>,
}

impl CaseDb {
    /// Open the database with the given configuration.
    pub fn new(config: CaseDbConfig) -> AnshinResult<Self> {
        let store = match &config.data_dir {
            Some(dir) => CaseStore::open(dir)?,
            None => CaseStore::memory(),
        };
        store.ensure_indexes()?;
        tracing::info!(
            persistent = store.is_persistent(),
            "case database opened"
        );
        Ok(Self {
            config,
            store,
            code_lock: Mutex::new(()),
        })
    }

    /// Direct access to the store, for read-only collaborators.
    pub fn store(&self) -> &CaseStore {
        &self.store
    }

    pub fn config(&self) -> &CaseDbConfig {
        &self.config
    }

    /// Atomically register a subject and its identity record.
    ///
    /// The subject id is drawn fresh on every collision; the display code is
    /// computed inside the write lock so concurrent registrations cannot
    /// observe the same current maximum.
    pub fn create_subject_with_identity(&self, new: NewSubject) -> AnshinResult<SubjectView> {
        let _serial = self
            .code_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let node = self.store.alloc_node()?;
        let identity = IdentityRecord {
            name: new.name.clone(),
            reading: new.reading.clone(),
            dob: new.dob.clone(),
            aliases: new.aliases.clone(),
            created_at: now_secs(),
        };

        for _ in 0..self.config.max_id_retries {
            let subject_id = SubjectId::generate();
            let display_code = DisplayCode::next(self.store.max_display_sequence()?);
            let row = SubjectRow {
                node,
                subject_id: Some(subject_id.clone()),
                display_code: Some(display_code),
                blood_type: new.blood_type.clone(),
                legacy_name: None,
                legacy_reading: None,
                legacy_dob: None,
                legacy_aliases: Vec::new(),
                created_at: now_secs(),
                migrated_at: None,
            };
            match self.store.insert_subject_with_identity(&row, &identity) {
                Ok(()) => {
                    tracing::info!(code = %display_code, "registered subject");
                    return Ok(SubjectView {
                        subject_id,
                        display_code,
                        blood_type: row.blood_type,
                        name: identity.name,
                        reading: identity.reading,
                        dob: identity.dob,
                        aliases: identity.aliases,
                    });
                }
                Err(StoreError::Conflict { index, value }) => {
                    tracing::warn!(index, value = %value, "identifier collision, redrawing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(IdentError::ConflictExhausted {
            attempts: self.config.max_id_retries,
        }
        .into())
    }

    /// Point lookup by opaque subject id. `Ok(None)` when absent.
    pub fn get_by_subject_id(&self, id: &SubjectId) -> AnshinResult<Option<SubjectView>> {
        Ok(self
            .store
            .find_one(&LookupClause::BySubjectId(id.as_str().to_string()))?)
    }

    /// Point lookup by display code. `Ok(None)` when absent.
    pub fn get_by_display_code(&self, code: &DisplayCode) -> AnshinResult<Option<SubjectView>> {
        Ok(self
            .store
            .find_one(&LookupClause::ByDisplayCode(code.to_string()))?)
    }

    /// Redacted listing. The entry type carries no identifying fields, so
    /// PII cannot leak from this call no matter how the result is
    /// serialized.
    pub fn list_subjects(&self) -> AnshinResult<Vec<SubjectSummary>> {
        Ok(self
            .store
            .list_rows()?
            .iter()
            .map(|(row, _)| SubjectSummary::from_row(row))
            .collect())
    }

    /// Listing including identity fields, for callers cleared to see PII.
    pub fn list_subjects_with_pii(&self) -> AnshinResult<Vec<SubjectProfile>> {
        Ok(self
            .store
            .list_rows()?
            .iter()
            .map(|(row, identity)| SubjectProfile::from_row(row, identity.as_ref()))
            .collect())
    }

    /// Resolve a free-form identifier string. See [`Resolver::resolve`].
    pub fn resolve(&self, input: &str) -> AnshinResult<Resolution> {
        Resolver::new(&self.store).resolve(input)
    }

    /// Build the lookup clause for an already-disambiguated identifier.
    pub fn clause_for(identifier: &str) -> LookupClause {
        LookupClause::for_identifier(identifier)
    }

    /// Execute a lookup clause.
    pub fn lookup(&self, clause: &LookupClause) -> AnshinResult<Option<SubjectView>> {
        Ok(self.store.find_one(clause)?)
    }

    /// Convert all legacy rows into the split model. Idempotent; intended
    /// as an operational action, safe to re-run after partial failure.
    pub fn run_migration(&self) -> AnshinResult<MigrationReport> {
        let _serial = self
            .code_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        MigrationEngine::new(&self.store, self.config.max_id_retries).run()
    }

    /// Seed a row in the pre-split legacy state, as from a data import.
    pub fn import_legacy(&self, client: LegacyClient) -> AnshinResult<NodeId> {
        let node = self.store.alloc_node()?;
        let row = SubjectRow::legacy(node, client);
        self.store.insert_legacy(&row)?;
        tracing::info!(node = node.get(), "imported legacy row");
        Ok(node)
    }

    /// Update identity fields through the one sanctioned mutation path.
    pub fn update_identity(
        &self,
        id: &SubjectId,
        patch: IdentityPatch,
    ) -> AnshinResult<SubjectView> {
        let node = self
            .store
            .node_by_subject_id(id.as_str())?
            .ok_or_else(|| StoreError::NotFound {
                identifier: id.to_string(),
            })?;
        let mut identity =
            self.store
                .get_identity(node)?
                .ok_or_else(|| StoreError::NotFound {
                    identifier: id.to_string(),
                })?;
        patch.apply(&mut identity);
        self.store.put_identity(node, &identity)?;

        let row = self
            .store
            .get_subject(node)?
            .ok_or_else(|| StoreError::NotFound {
                identifier: id.to_string(),
            })?;
        SubjectView::assemble(&row, Some(&identity)).ok_or_else(|| {
            StoreError::NotFound {
                identifier: id.to_string(),
            }
            .into()
        })
    }

    /// Admit a record proposed by the extraction collaborator.
    ///
    /// The proposed name is re-resolved here rather than trusted, even
    /// though it came from an automated process. Only an exact or alias
    /// match may be attached without a human in the loop.
    pub fn admit_proposed(&self, proposed: &ProposedRecord) -> AnshinResult<AdmitOutcome> {
        let resolution = self.resolve(&proposed.name)?;
        Ok(match resolution.match_type {
            MatchType::Exact | MatchType::Alias => match resolution.subject {
                Some(subject) => AdmitOutcome::Matched {
                    match_type: resolution.match_type,
                    subject,
                },
                None => AdmitOutcome::Unmatched,
            },
            MatchType::Fuzzy => AdmitOutcome::NeedsConfirmation {
                suggested_name: resolution.suggested_name,
                candidates: resolution.candidates,
            },
            MatchType::NotFound => AdmitOutcome::Unmatched,
        })
    }

    /// Summary statistics.
    pub fn info(&self) -> AnshinResult<CaseDbInfo> {
        Ok(CaseDbInfo {
            subject_count: self.store.count_subjects()?,
            identity_count: self.store.count_identities()?,
            unmigrated_count: self.store.count_unmigrated()?,
            persistent: self.store.is_persistent(),
        })
    }
}

impl std::fmt::Debug for CaseDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseDb")
            .field("config", &self.config)
            .finish()
    }
}

/// Summary statistics about the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDbInfo {
    pub subject_count: usize,
    pub identity_count: usize,
    pub unmigrated_count: usize,
    pub persistent: bool,
}

impl std::fmt::Display for CaseDbInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "anshin case database")?;
        writeln!(f, "  subjects:   {}", self.subject_count)?;
        writeln!(f, "  identities: {}", self.identity_count)?;
        writeln!(f, "  unmigrated: {}", self.unmigrated_count)?;
        writeln!(f, "  persistent: {}", self.persistent)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn memory_db() -> CaseDb {
        CaseDb::new(CaseDbConfig::default()).unwrap()
    }

    fn subject(name: &str) -> NewSubject {
        NewSubject {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn create_assigns_sequential_codes() {
        let db = memory_db();
        let first = db.create_subject_with_identity(subject("山田健太")).unwrap();
        let second = db.create_subject_with_identity(subject("佐々木真理")).unwrap();
        assert_eq!(first.display_code.to_string(), "A-001");
        assert_eq!(second.display_code.to_string(), "A-002");
        assert_ne!(first.subject_id, second.subject_id);
    }

    #[test]
    fn created_subject_has_exactly_one_identity() {
        let db = memory_db();
        db.create_subject_with_identity(subject("山田健太")).unwrap();
        let info = db.info().unwrap();
        assert_eq!(info.subject_count, 1);
        assert_eq!(info.identity_count, 1);
        assert_eq!(info.unmigrated_count, 0);
    }

    #[test]
    fn point_lookups_round_trip() {
        let db = memory_db();
        let created = db.create_subject_with_identity(subject("山田健太")).unwrap();

        let by_id = db.get_by_subject_id(&created.subject_id).unwrap().unwrap();
        assert_eq!(by_id.name, "山田健太");

        let by_code = db
            .get_by_display_code(&created.display_code)
            .unwrap()
            .unwrap();
        assert_eq!(by_code.subject_id, created.subject_id);

        let absent = SubjectId::parse("c-00000000").unwrap();
        assert!(db.get_by_subject_id(&absent).unwrap().is_none());
    }

    #[test]
    fn redacted_listing_serializes_without_pii_fields() {
        let db = memory_db();
        db.create_subject_with_identity(NewSubject {
            name: "山田健太".into(),
            dob: Some("1990-01-15".into()),
            ..Default::default()
        })
        .unwrap();

        let listing = db.list_subjects().unwrap();
        assert_eq!(listing.len(), 1);
        let json = serde_json::to_value(&listing[0]).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert!(!keys.iter().any(|k| k.as_str() == "name"));
        assert!(!keys.iter().any(|k| k.as_str() == "dob"));
        assert!(!keys.iter().any(|k| k.as_str() == "aliases"));
    }

    #[test]
    fn pii_listing_contains_names() {
        let db = memory_db();
        db.create_subject_with_identity(subject("山田健太")).unwrap();
        let listing = db.list_subjects_with_pii().unwrap();
        assert_eq!(listing[0].name.as_deref(), Some("山田健太"));
    }

    #[test]
    fn concurrent_creations_yield_distinct_codes() {
        use std::sync::Arc;
        let db = Arc::new(memory_db());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    db.create_subject_with_identity(NewSubject {
                        name: format!("利用者{i}"),
                        ..Default::default()
                    })
                    .unwrap()
                    .display_code
                })
            })
            .collect();

        let codes: HashSet<u32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().sequence())
            .collect();
        assert_eq!(codes.len(), 8);
        // Serialized assignment also keeps the range gap-free.
        assert_eq!(codes, (1..=8).collect::<HashSet<u32>>());
    }

    #[test]
    fn update_identity_rebinds_resolution() {
        let db = memory_db();
        let created = db.create_subject_with_identity(subject("山田健太")).unwrap();

        let updated = db
            .update_identity(
                &created.subject_id,
                IdentityPatch {
                    name: Some("山田健太郎".into()),
                    add_aliases: vec!["けんちゃん".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "山田健太郎");

        let resolution = db.resolve("山田健太郎").unwrap();
        assert_eq!(resolution.match_type, MatchType::Exact);
        let alias_hit = db.resolve("けんちゃん").unwrap();
        assert_eq!(alias_hit.match_type, MatchType::Alias);
    }

    #[test]
    fn update_identity_unknown_subject_is_not_found() {
        let db = memory_db();
        let absent = SubjectId::parse("c-00000000").unwrap();
        let err = db
            .update_identity(&absent, IdentityPatch::default())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AnshinError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn admit_proposed_requires_resolution() {
        let db = memory_db();
        db.create_subject_with_identity(subject("山田健太")).unwrap();
        db.create_subject_with_identity(subject("山田健太郎")).unwrap();

        let exact = db
            .admit_proposed(&ProposedRecord {
                name: "山田健太".into(),
                reading: None,
                dob: None,
                blood_type: None,
                aliases: vec![],
            })
            .unwrap();
        assert!(matches!(exact, AdmitOutcome::Matched { .. }));

        let ambiguous = db
            .admit_proposed(&ProposedRecord {
                name: "山田健".into(),
                reading: None,
                dob: None,
                blood_type: None,
                aliases: vec![],
            })
            .unwrap();
        assert!(matches!(ambiguous, AdmitOutcome::NeedsConfirmation { .. }));

        let unknown = db
            .admit_proposed(&ProposedRecord {
                name: "鈴木一郎".into(),
                reading: None,
                dob: None,
                blood_type: None,
                aliases: vec![],
            })
            .unwrap();
        assert!(matches!(unknown, AdmitOutcome::Unmatched));
    }
}
