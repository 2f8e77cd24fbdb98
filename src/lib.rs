//! # anshin
//!
//! A knowledge-graph case database for disability support work, centred on
//! the one decision it must never get wrong: which stored person a
//! human-typed reference means. Emergency contraindications, care
//! instructions, and the audit trail are all keyed off that decision.
//!
//! ## Architecture
//!
//! - **Identifier generation** (`ident`): opaque random subject ids and
//!   sequential display codes
//! - **Identity store** (`store`): subjects split from their PII-bearing
//!   identity records, in-memory (DashMap) or durable (redb)
//! - **Migration** (`migrate`): one-shot, re-runnable conversion of legacy
//!   unsplit rows
//! - **Resolution** (`resolve`): free-form input to exactly one subject,
//!   refusing to guess on ambiguity
//! - **Lookup clauses** (`clause`): the single identifier-shape detection
//!   rule shared by every feature
//!
//! ## Library usage
//!
//! ```no_run
//! use anshin::db::{CaseDb, CaseDbConfig};
//! use anshin::resolve::MatchType;
//! use anshin::subject::NewSubject;
//!
//! let db = CaseDb::new(CaseDbConfig::default()).unwrap();
//! db.create_subject_with_identity(NewSubject {
//!     name: "山田健太".into(),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let resolution = db.resolve("山田さん").unwrap();
//! if resolution.match_type == MatchType::Fuzzy {
//!     // Ask the person typing to confirm resolution.suggested_name
//!     // before touching anything.
//! }
//! ```

pub mod clause;
pub mod db;
pub mod error;
pub mod ident;
pub mod migrate;
pub mod resolve;
pub mod store;
pub mod subject;

pub use clause::{classify, IdentifierShape, LookupClause};
pub use db::{AdmitOutcome, CaseDb, CaseDbConfig, CaseDbInfo};
pub use error::{AnshinError, AnshinResult, IdentError, MigrateError, StoreError};
pub use ident::{DisplayCode, SubjectId};
pub use migrate::{MigrationFailure, MigrationReport};
pub use resolve::{MatchType, Resolution};
pub use subject::{
    IdentityPatch, IdentityRecord, LegacyClient, NewSubject, ProposedRecord, SubjectProfile,
    SubjectSummary, SubjectView,
};
