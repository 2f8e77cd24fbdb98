//! Rich diagnostic error types for the anshin case database.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the anshin case database.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum AnshinError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Ident(#[from] IdentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Migrate(#[from] MigrateError),
}

// ---------------------------------------------------------------------------
// Identifier errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum IdentError {
    #[error("malformed subject id: \"{input}\"")]
    #[diagnostic(
        code(anshin::ident::malformed_subject_id),
        help(
            "Subject ids have the form `c-` followed by eight lowercase hex \
             characters, e.g. `c-3fa29c01`. Check for typos or pass a display \
             code (`A-001`) instead."
        )
    )]
    MalformedSubjectId { input: String },

    #[error("malformed display code: \"{input}\"")]
    #[diagnostic(
        code(anshin::ident::malformed_display_code),
        help(
            "Display codes have the form `A-` followed by a zero-padded \
             sequence number, e.g. `A-001`."
        )
    )]
    MalformedDisplayCode { input: String },

    #[error("identifier generation exhausted after {attempts} collision retries")]
    #[diagnostic(
        code(anshin::ident::conflict_exhausted),
        help(
            "Every freshly generated subject id collided with an existing one. \
             This should be astronomically unlikely and indicates the random \
             number source is broken. Treat as an operational alarm."
        )
    )]
    ConflictExhausted { attempts: usize },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(anshin::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(anshin::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption. If the problem persists, restore \
             from backup and file a bug report."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(anshin::store::serde),
        help(
            "Failed to serialize or deserialize a stored record. This usually \
             means the stored data format has changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("unique index conflict on {index}: \"{value}\" is already assigned")]
    #[diagnostic(
        code(anshin::store::conflict),
        help(
            "The identifier is already bound to a different subject. Generated \
             ids are retried automatically; if you passed an explicit value, \
             pick another."
        )
    )]
    Conflict { index: &'static str, value: String },

    #[error("subject not found: {identifier}")]
    #[diagnostic(
        code(anshin::store::not_found),
        help(
            "No subject matches this identifier. Verify it with `anshin resolve` \
             before retrying; never fall back to a guessed subject."
        )
    )]
    NotFound { identifier: String },

    #[error("store unavailable: {message}")]
    #[diagnostic(
        code(anshin::store::unavailable),
        help(
            "The underlying store could not be reached within the timeout. \
             This is retryable and does not indicate missing data."
        )
    )]
    Unavailable { message: String },
}

// ---------------------------------------------------------------------------
// Migration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MigrateError {
    #[error("subject at node {node} has no legacy name to migrate")]
    #[diagnostic(
        code(anshin::migrate::missing_name),
        help(
            "A legacy subject row without a name cannot produce an identity \
             record. The row is skipped; fix the source data and re-run."
        )
    )]
    MissingLegacyName { node: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ident(#[from] IdentError),
}

/// Convenience alias for functions returning anshin results.
pub type AnshinResult<T> = std::result::Result<T, AnshinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_error_converts_to_anshin_error() {
        let err = IdentError::ConflictExhausted { attempts: 8 };
        let top: AnshinError = err.into();
        assert!(matches!(
            top,
            AnshinError::Ident(IdentError::ConflictExhausted { .. })
        ));
    }

    #[test]
    fn store_error_converts_to_anshin_error() {
        let err = StoreError::NotFound {
            identifier: "c-deadbeef".into(),
        };
        let top: AnshinError = err.into();
        assert!(matches!(top, AnshinError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn migrate_error_wraps_store_error() {
        let store_err = StoreError::Conflict {
            index: "subjectId",
            value: "c-00000000".into(),
        };
        let migrate_err: MigrateError = store_err.into();
        assert!(matches!(migrate_err, MigrateError::Store(StoreError::Conflict { .. })));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = StoreError::Conflict {
            index: "displayCode",
            value: "A-003".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("displayCode"));
        assert!(msg.contains("A-003"));
    }
}
