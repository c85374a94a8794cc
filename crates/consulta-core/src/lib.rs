use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod generate;
pub mod prompt;
pub mod retrieval;

pub use generate::{generate_answer_text, GenerationError, GenerationParams, Generator};
pub use prompt::{compose_prompt, ComposerConfig};
pub use retrieval::{ContextSelection, KeywordSelector, RelevanceStrategy};

/// Failures scoped to a single query; none of them are fatal to the process.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("a generation request is already in flight for query {0}")]
    ConcurrentRequest(QueryId),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocumentId(pub Ulid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryId(pub Ulid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryId(pub Ulid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AnswerId(pub Ulid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse an identifier from its canonical ULID string form.
            ///
            /// # Errors
            /// Returns [`QueryError::Validation`] when the value is not a valid ULID.
            pub fn parse(value: &str) -> Result<Self, QueryError> {
                Ulid::from_string(value)
                    .map(Self)
                    .map_err(|err| QueryError::Validation(format!("invalid identifier: {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id!(DocumentId);
impl_id!(CategoryId);
impl_id!(QueryId);
impl_id!(AnswerId);

/// Regulatory instrument class, as published by the issuing authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Ley,
    Decreto,
    Resolucion,
    Circular,
    Directiva,
    Otro,
}

impl DocumentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ley => "ley",
            Self::Decreto => "decreto",
            Self::Resolucion => "resolucion",
            Self::Circular => "circular",
            Self::Directiva => "directiva",
            Self::Otro => "otro",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ley" => Some(Self::Ley),
            "decreto" => Some(Self::Decreto),
            "resolucion" => Some(Self::Resolucion),
            "circular" => Some(Self::Circular),
            "directiva" => Some(Self::Directiva),
            "otro" => Some(Self::Otro),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Lifecycle state of a query. `Pending → InProgress → Answered` is the
/// success path; `Failed` is re-attemptable via a fresh generation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Pending,
    InProgress,
    Answered,
    Failed,
}

impl QueryState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Answered => "answered",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "answered" => Some(Self::Answered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Display for QueryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One regulatory document in the corpus. Only `active` documents are
/// eligible for context retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub text: String,
    pub kind: DocumentKind,
    pub number: Option<String>,
    pub category_id: Option<CategoryId>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub id: QueryId,
    pub submitter_id: String,
    pub question: String,
    pub category_id: Option<CategoryId>,
    pub priority: Priority,
    pub state: QueryState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One generation attempt's artifact. A query may accumulate several rows
/// across retries; the canonical answer is the newest one and exists iff the
/// query has reached `answered` at least once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub query_id: QueryId,
    pub content: String,
    pub referenced_document_ids: Vec<DocumentId>,
    pub generated_automatically: bool,
    pub confidence: Option<f32>,
    /// Digest of the active-document snapshot this attempt retrieved from.
    pub snapshot_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Answer {
    /// Validate answer-level invariants before persistence.
    ///
    /// # Errors
    /// Returns [`QueryError::Validation`] when the content is blank or the
    /// confidence lies outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.content.trim().is_empty() {
            return Err(QueryError::Validation(
                "answer content must not be empty".to_string(),
            ));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(QueryError::Validation(
                    "confidence must be in [0.0, 1.0]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_answer() -> Answer {
        Answer {
            id: AnswerId::new(),
            query_id: QueryId::new(),
            content: "Los plazos son...".to_string(),
            referenced_document_ids: vec![DocumentId::new()],
            generated_automatically: true,
            confidence: Some(0.8),
            snapshot_digest: "snap_0123456789abcdef".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn query_state_round_trips_through_strings() {
        for state in [
            QueryState::Pending,
            QueryState::InProgress,
            QueryState::Answered,
            QueryState::Failed,
        ] {
            assert_eq!(QueryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(QueryState::parse("archived"), None);
    }

    #[test]
    fn priority_defaults_to_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::parse("urgent"), Some(Priority::Urgent));
        assert_eq!(Priority::parse(""), None);
    }

    #[test]
    fn answer_validation_accepts_well_formed_answers() {
        assert_eq!(sample_answer().validate(), Ok(()));
    }

    #[test]
    fn answer_validation_rejects_blank_content() {
        let mut answer = sample_answer();
        answer.content = "   ".to_string();
        assert!(matches!(answer.validate(), Err(QueryError::Validation(_))));
    }

    #[test]
    fn answer_validation_rejects_out_of_range_confidence() {
        let mut answer = sample_answer();
        answer.confidence = Some(1.5);
        assert!(matches!(answer.validate(), Err(QueryError::Validation(_))));
    }

    #[test]
    fn ids_parse_their_display_form() {
        let id = QueryId::new();
        let parsed = match QueryId::parse(&id.to_string()) {
            Ok(parsed) => parsed,
            Err(err) => panic!("round-trip parse failed: {err}"),
        };
        assert_eq!(parsed, id);
        assert!(QueryId::parse("not-a-ulid").is_err());
    }
}
