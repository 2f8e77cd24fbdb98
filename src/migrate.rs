//! Migration of legacy unsplit rows into the pseudonymized model.
//!
//! A legacy row carries name and date of birth directly on the subject and
//! has no subject id. The engine assigns identifiers and moves the PII into
//! an owned identity record, exactly once per subject. The absence of a
//! subject id is both the eligibility test and the idempotency guard, so no
//! separate migration-status bookkeeping exists.
//!
//! Writing the identifiers is what marks a row migrated. A crash between
//! that write and the identity write leaves the row migrated but
//! identity-less; the repair pass at the end of every run closes that
//! window from the legacy fields, which are deliberately kept in place as a
//! rollback safety net.

use serde::{Deserialize, Serialize};

use crate::error::{AnshinResult, IdentError, MigrateError, StoreError};
use crate::ident::{DisplayCode, SubjectId};
use crate::store::CaseStore;
use crate::subject::{now_secs, IdentityRecord, SubjectRow};

/// One subject that could not be migrated in this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub node: u64,
    pub reason: String,
}

/// Outcome summary of one migration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Rows fully converted in this run.
    pub migrated: usize,
    /// Legacy rows that cannot be converted (no name to move).
    pub skipped: usize,
    /// Rows found migrated but identity-less and completed from their
    /// legacy fields.
    pub repaired: usize,
    pub errors: Vec<MigrationFailure>,
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "migration report")?;
        writeln!(f, "  migrated: {}", self.migrated)?;
        writeln!(f, "  skipped:  {}", self.skipped)?;
        writeln!(f, "  repaired: {}", self.repaired)?;
        writeln!(f, "  errors:   {}", self.errors.len())?;
        for failure in &self.errors {
            writeln!(f, "    node {}: {}", failure.node, failure.reason)?;
        }
        Ok(())
    }
}

/// One-shot batch conversion of legacy rows. Re-runnable: already-migrated
/// rows are never reprocessed, and a failed row simply stays legacy for the
/// next run.
pub struct MigrationEngine<'a> {
    store: &'a CaseStore,
    max_id_retries: usize,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(store: &'a CaseStore, max_id_retries: usize) -> Self {
        Self {
            store,
            max_id_retries,
        }
    }

    /// Run the batch. Per-subject failures are collected, not fatal.
    pub fn run(&self) -> AnshinResult<MigrationReport> {
        self.store.ensure_indexes()?;

        let mut report = MigrationReport::default();
        let mut current_seq = self.store.max_display_sequence()?;

        let eligible: Vec<SubjectRow> = {
            let mut rows = Vec::new();
            for node in self.store.nodes()? {
                if let Some(row) = self.store.get_subject(node)? {
                    if row.is_legacy() {
                        rows.push(row);
                    }
                }
            }
            rows
        };
        tracing::info!(eligible = eligible.len(), "starting migration run");

        for row in eligible {
            let Some(name) = row.legacy_name.clone() else {
                tracing::warn!(node = row.node.get(), "legacy row has no name, skipping");
                report.skipped += 1;
                continue;
            };

            match self.assign_identifiers(&row, &mut current_seq) {
                Ok(migrated_row) => {
                    let identity = IdentityRecord {
                        name,
                        reading: row.legacy_reading.clone(),
                        dob: row.legacy_dob.clone(),
                        aliases: row.legacy_aliases.clone(),
                        created_at: now_secs(),
                    };
                    // A crash or failure here leaves the row migrated but
                    // identity-less; the repair pass below picks it up.
                    match self.store.put_identity(row.node, &identity) {
                        Ok(()) => {
                            tracing::info!(
                                node = row.node.get(),
                                code = %migrated_row
                                    .display_code
                                    .map(|c| c.to_string())
                                    .unwrap_or_default(),
                                "migrated subject"
                            );
                            report.migrated += 1;
                        }
                        Err(e) => report.errors.push(MigrationFailure {
                            node: row.node.get(),
                            reason: format!("identity write failed: {e}"),
                        }),
                    }
                }
                Err(reason) => report.errors.push(MigrationFailure {
                    node: row.node.get(),
                    reason,
                }),
            }
        }

        self.repair_identity_less(&mut report)?;

        tracing::info!(
            migrated = report.migrated,
            skipped = report.skipped,
            repaired = report.repaired,
            errors = report.errors.len(),
            "migration run finished"
        );
        Ok(report)
    }

    /// Write a fresh subject id and the next display code onto the row.
    /// Subject-id collisions retry with a fresh draw; display-code
    /// collisions re-read the current maximum.
    fn assign_identifiers(
        &self,
        row: &SubjectRow,
        current_seq: &mut u32,
    ) -> Result<SubjectRow, String> {
        for _ in 0..self.max_id_retries {
            let mut candidate = row.clone();
            candidate.subject_id = Some(SubjectId::generate());
            candidate.display_code = Some(DisplayCode::next(*current_seq));
            candidate.migrated_at = Some(now_secs());

            match self.store.put_subject(&candidate) {
                Ok(()) => {
                    *current_seq += 1;
                    return Ok(candidate);
                }
                Err(StoreError::Conflict {
                    index: "subjectId", ..
                }) => continue,
                Err(StoreError::Conflict {
                    index: "displayCode",
                    ..
                }) => {
                    *current_seq = self
                        .store
                        .max_display_sequence()
                        .map_err(|e| e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Err(IdentError::ConflictExhausted {
            attempts: self.max_id_retries,
        }
        .to_string())
    }

    /// Complete rows left migrated but identity-less by a previous
    /// interrupted run.
    fn repair_identity_less(&self, report: &mut MigrationReport) -> AnshinResult<()> {
        for node in self.store.nodes()? {
            let Some(row) = self.store.get_subject(node)? else {
                continue;
            };
            if row.is_legacy() || self.store.get_identity(node)?.is_some() {
                continue;
            }
            let Some(name) = row.legacy_name.clone() else {
                report.errors.push(MigrationFailure {
                    node: node.get(),
                    reason: MigrateError::MissingLegacyName { node: node.get() }.to_string(),
                });
                continue;
            };
            let identity = IdentityRecord {
                name,
                reading: row.legacy_reading.clone(),
                dob: row.legacy_dob.clone(),
                aliases: row.legacy_aliases.clone(),
                created_at: now_secs(),
            };
            match self.store.put_identity(node, &identity) {
                Ok(()) => {
                    tracing::info!(node = node.get(), "repaired identity-less subject");
                    report.repaired += 1;
                }
                Err(e) => report.errors.push(MigrationFailure {
                    node: node.get(),
                    reason: format!("identity repair failed: {e}"),
                }),
            }
        }
        Ok(())
    }
}
