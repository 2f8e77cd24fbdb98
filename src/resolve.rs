//! Client resolver: free-form identifier strings to canonical subjects.
//!
//! This is the only component allowed to decide that a human-typed string
//! refers to a particular subject. Every feature that accepts a typed name
//! routes through [`Resolver::resolve`]; nothing else re-implements the
//! matching rules.
//!
//! A result is acted on automatically only for the `exact` and `alias`
//! classes. A `fuzzy` result is a request for confirmation: the caller must
//! present the suggested official name back to the person typing and get an
//! explicit yes before touching the subject's data. Two candidates tied at
//! the top score always degrade to `fuzzy`, even when both matched exactly,
//! because silently picking between two equally plausible people is the one
//! failure mode this component exists to prevent.

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::clause::{classify, IdentifierShape, LookupClause};
use crate::error::AnshinResult;
use crate::store::CaseStore;
use crate::subject::{IdentityRecord, SubjectView};

/// Courtesy suffixes stripped from input before matching. The stored
/// official name is never altered, only the comparison copy of the input.
const HONORIFIC_SUFFIXES: &[&str] = &["さん", "くん", "ちゃん", "様", "氏", "殿", "San", "-san"];

/// Fixed score table. Precedence is total: a higher rule always beats a
/// lower one, and the classification thresholds below refer to these values.
const SCORE_EXACT_NAME: u8 = 100;
const SCORE_EXACT_READING: u8 = 95;
const SCORE_EXACT_ALIAS: u8 = 90;
const SCORE_NAME_SUBSTRING: u8 = 50;
const SCORE_READING_SUBSTRING: u8 = 40;
const SCORE_ALIAS_SUBSTRING: u8 = 30;
const SCORE_SURNAME_PREFIX: u8 = 25;

/// Minimum score a candidate needs to be reported at all.
const FUZZY_THRESHOLD: u8 = SCORE_SURNAME_PREFIX;

/// How many candidate names a fuzzy result lists.
const MAX_CANDIDATES: usize = 3;

/// Classification of a resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Input equals an official name or reading verbatim. Auto-actionable.
    Exact,
    /// Input equals a registered alternate name. Auto-actionable, but
    /// reported distinctly for the audit trail.
    Alias,
    /// Partial or ambiguous evidence. Requires explicit confirmation.
    Fuzzy,
    /// Nothing cleared the minimum threshold.
    NotFound,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchType::Exact => write!(f, "exact"),
            MatchType::Alias => write!(f, "alias"),
            MatchType::Fuzzy => write!(f, "fuzzy"),
            MatchType::NotFound => write!(f, "not_found"),
        }
    }
}

/// Outcome of resolving one identifier string.
///
/// `subject` is populated only for the auto-actionable classes. A fuzzy
/// outcome deliberately carries names, not subject handles: the caller has
/// to come back with a confirmed official name before it can act.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub match_type: MatchType,
    pub subject: Option<SubjectView>,
    pub suggested_name: Option<String>,
    pub candidates: Vec<String>,
    pub input: String,
}

impl Resolution {
    fn not_found(input: &str) -> Self {
        Self {
            match_type: MatchType::NotFound,
            subject: None,
            suggested_name: None,
            candidates: Vec::new(),
            input: input.to_string(),
        }
    }

    fn actionable(match_type: MatchType, subject: SubjectView, input: &str) -> Self {
        Self {
            match_type,
            subject: Some(subject),
            suggested_name: None,
            candidates: Vec::new(),
            input: input.to_string(),
        }
    }

    fn fuzzy(suggested: String, candidates: Vec<String>, input: &str) -> Self {
        Self {
            match_type: MatchType::Fuzzy,
            subject: None,
            suggested_name: Some(suggested),
            candidates,
            input: input.to_string(),
        }
    }
}

/// Strip whitespace, apply NFKC, and remove one recognized honorific suffix.
///
/// Idempotent: normalizing an already-normalized string is a no-op.
pub fn normalize(input: &str) -> String {
    let mut cleaned: String = input.trim().nfkc().collect();
    for suffix in HONORIFIC_SUFFIXES {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped.trim_end().trim_end_matches('-').to_string();
            break;
        }
    }
    cleaned
}

/// Leading 2- and 3-character prefixes of the cleaned input, treated as
/// surname guesses for names entered family-name-first.
fn surname_candidates(clean: &str) -> Vec<String> {
    let chars: Vec<char> = clean.chars().collect();
    let mut candidates = Vec::new();
    if chars.len() >= 2 {
        candidates.push(chars[..2].iter().collect());
    }
    if chars.len() >= 3 {
        candidates.push(chars[..3].iter().collect());
    }
    candidates
}

/// Score one identity record against the raw and cleaned input.
/// Returns 0 when nothing matches.
fn score_identity(raw: &str, clean: &str, surnames: &[String], identity: &IdentityRecord) -> u8 {
    let name = identity.name.as_str();
    let reading = identity.reading.as_deref();

    if name == raw || name == clean {
        return SCORE_EXACT_NAME;
    }
    if reading.is_some_and(|r| r == raw || r == clean) {
        return SCORE_EXACT_READING;
    }
    if identity.aliases.iter().any(|a| a == raw || a == clean) {
        return SCORE_EXACT_ALIAS;
    }
    if name.contains(clean) || clean.contains(name) {
        return SCORE_NAME_SUBSTRING;
    }
    if reading.is_some_and(|r| r.contains(clean) || clean.contains(r)) {
        return SCORE_READING_SUBSTRING;
    }
    if identity
        .aliases
        .iter()
        .any(|a| a.contains(clean) || clean.contains(a))
    {
        return SCORE_ALIAS_SUBSTRING;
    }
    if surnames.iter().any(|s| name.starts_with(s.as_str())) {
        return SCORE_SURNAME_PREFIX;
    }
    0
}

/// Resolves human-entered identifiers against the identity store.
pub struct Resolver<'a> {
    store: &'a CaseStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a CaseStore) -> Self {
        Self { store }
    }

    /// Map one identifier string to exactly one canonical subject, or
    /// refuse to guess.
    ///
    /// Opaque ids and display codes are point lookups; everything else runs
    /// the name-matching pipeline over migrated subjects.
    pub fn resolve(&self, input: &str) -> AnshinResult<Resolution> {
        let raw = input.trim();
        if raw.is_empty() {
            return Ok(Resolution::not_found(input));
        }

        match classify(raw) {
            IdentifierShape::OpaqueId => {
                return Ok(
                    match self
                        .store
                        .find_one(&LookupClause::BySubjectId(raw.to_string()))?
                    {
                        Some(view) => Resolution::actionable(MatchType::Exact, view, input),
                        None => Resolution::not_found(input),
                    },
                );
            }
            IdentifierShape::DisplayCode => {
                return Ok(
                    match self
                        .store
                        .find_one(&LookupClause::ByDisplayCode(raw.to_string()))?
                    {
                        Some(view) => Resolution::actionable(MatchType::Exact, view, input),
                        None => Resolution::not_found(input),
                    },
                );
            }
            IdentifierShape::Name => {}
        }

        let mut clean = normalize(raw);
        if clean.is_empty() {
            // The input was nothing but an honorific.
            clean = raw.to_string();
        }
        let surnames = surname_candidates(&clean);

        let mut scored: Vec<(u8, u64, SubjectView)> = Vec::new();
        for (row, identity) in self.store.identity_entries()? {
            let score = score_identity(raw, &clean, &surnames, &identity);
            if score < FUZZY_THRESHOLD {
                continue;
            }
            if let Some(view) = SubjectView::assemble(&row, Some(&identity)) {
                scored.push((score, row.node.get(), view));
            }
        }
        if scored.is_empty() {
            return Ok(Resolution::not_found(input));
        }

        // Highest score first; node id keeps ordering stable across runs.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let top_score = scored[0].0;
        let tied: Vec<&SubjectView> = scored
            .iter()
            .take_while(|(score, _, _)| *score == top_score)
            .map(|(_, _, view)| view)
            .collect();

        if tied.len() > 1 {
            // Equally plausible candidates: refuse to pick, whatever the score.
            let names: Vec<String> = tied.iter().map(|v| v.name.clone()).collect();
            tracing::info!(
                input_shape = "name",
                candidates = names.len(),
                "resolution tie forced to fuzzy"
            );
            return Ok(Resolution::fuzzy(names[0].clone(), names, input));
        }

        let best = scored[0].2.clone();
        match top_score {
            SCORE_EXACT_NAME | SCORE_EXACT_READING => {
                Ok(Resolution::actionable(MatchType::Exact, best, input))
            }
            SCORE_EXACT_ALIAS => Ok(Resolution::actionable(MatchType::Alias, best, input)),
            _ => {
                let candidates: Vec<String> = scored
                    .iter()
                    .take(MAX_CANDIDATES)
                    .map(|(_, _, view)| view.name.clone())
                    .collect();
                Ok(Resolution::fuzzy(best.name.clone(), candidates, input))
            }
        }
    }
}
