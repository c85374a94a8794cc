//! Operation layer for the regulatory Q&A pipeline.
//!
//! Each operation opens the store, runs against the current snapshot, and
//! returns typed errors the outer surfaces can map onto their own status
//! codes. Generation goes through the [`Generator`] seam so the pipeline is
//! testable without a provider.

use std::collections::BTreeMap;
use std::path::PathBuf;

use consulta_core::{
    compose_prompt, generate_answer_text, Answer, AnswerId, Category, CategoryId, Document,
    DocumentId, DocumentKind, Generator, KeywordSelector, Priority, Query, QueryError, QueryId,
    QueryState, RelevanceStrategy,
};
use consulta_store_sqlite::{ConsultaStore, GateOutcome, SchemaStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, Time};

pub use consulta_core::{ComposerConfig, GenerationParams};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_MAX_CONTEXT_CHARS: usize = 24_000;

/// Confidence attached to answers generated from keyword-matched context.
const MATCHED_CONFIDENCE: f32 = 0.85;
/// Confidence attached when retrieval fell back to the whole corpus or
/// found nothing at all.
const FALLBACK_CONFIDENCE: f32 = 0.6;

/// Pipeline settings, loaded once at startup and passed in explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub composer: ComposerConfig,
    pub generation: GenerationParams,
    pub max_context_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            composer: ComposerConfig::default(),
            generation: GenerationParams::default(),
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

/// Capability for administrative operations. Holding a value of this type is
/// the authorization; the outer surface decides who gets one.
#[derive(Debug, Clone)]
pub struct AdminToken {
    actor: String,
}

impl AdminToken {
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self { actor: actor.into() }
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRequest {
    pub submitter_id: String,
    pub question: String,
    pub category_id: Option<CategoryId>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCategoryRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddDocumentRequest {
    pub title: String,
    pub text: String,
    pub kind: DocumentKind,
    pub number: Option<String>,
    pub category_id: Option<CategoryId>,
}

/// Lifecycle snapshot returned to submitters polling for their answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerStatus {
    pub query_id: QueryId,
    pub state: QueryState,
    pub answer: Option<Answer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryVolumeStats {
    pub total_queries: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub answered: u64,
    pub failed: u64,
    pub today: u64,
    pub this_week: u64,
    pub active_documents: u64,
    pub by_category: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

pub struct ConsultaApi<G> {
    db_path: PathBuf,
    generator: G,
    config: PipelineConfig,
    selector: KeywordSelector,
}

impl<G: Generator> ConsultaApi<G> {
    #[must_use]
    pub fn new(db_path: PathBuf, generator: G) -> Self {
        Self::with_config(db_path, generator, PipelineConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, generator: G, config: PipelineConfig) -> Self {
        Self { db_path, generator, config, selector: KeywordSelector }
    }

    fn open_store(&self) -> Result<ConsultaStore, QueryError> {
        let mut store = ConsultaStore::open(&self.db_path).map_err(storage_error)?;
        store.migrate().map_err(storage_error)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, QueryError> {
        let store = ConsultaStore::open(&self.db_path).map_err(storage_error)?;
        store.schema_status().map_err(storage_error)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, QueryError> {
        let mut store = ConsultaStore::open(&self.db_path).map_err(storage_error)?;
        let before = store.schema_status().map_err(storage_error)?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate().map_err(storage_error)?;
        let after = store.schema_status().map_err(storage_error)?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Register a new query in `pending` state.
    ///
    /// # Errors
    /// Returns [`QueryError::Validation`] for blank fields,
    /// [`QueryError::NotFound`] for an unknown category, and
    /// [`QueryError::Storage`] when persistence fails.
    pub fn submit(&self, input: SubmitRequest) -> Result<Query, QueryError> {
        let question = input.question.trim();
        if question.is_empty() {
            return Err(QueryError::Validation("question must not be empty".to_string()));
        }
        if input.submitter_id.trim().is_empty() {
            return Err(QueryError::Validation("submitter_id must not be empty".to_string()));
        }

        let store = self.open_store()?;
        if let Some(category_id) = input.category_id {
            if store.get_category(category_id).map_err(storage_error)?.is_none() {
                return Err(QueryError::NotFound(format!("category {category_id}")));
            }
        }

        let now = OffsetDateTime::now_utc();
        let query = Query {
            id: QueryId::new(),
            submitter_id: input.submitter_id,
            question: question.to_string(),
            category_id: input.category_id,
            priority: input.priority.unwrap_or_default(),
            state: QueryState::Pending,
            created_at: now,
            updated_at: now,
        };
        store.insert_query(&query).map_err(storage_error)?;
        tracing::info!(query_id = %query.id, submitter = %query.submitter_id, "query submitted");
        Ok(query)
    }

    /// Run one generation attempt for `id`. Not idempotent: the caller that
    /// wins the gate drives the query to `answered` or `failed`; concurrent
    /// callers get [`QueryError::ConcurrentRequest`].
    ///
    /// # Errors
    /// Returns [`QueryError::NotFound`] for unknown queries,
    /// [`QueryError::InvalidState`] for already-answered ones,
    /// [`QueryError::ConcurrentRequest`] when another attempt holds the gate,
    /// and [`QueryError::Generation`] when the provider fails (the query is
    /// then left in `failed`, re-attemptable).
    pub fn request_answer(&self, id: QueryId) -> Result<Answer, QueryError> {
        let store = self.open_store()?;
        let query = match store.begin_generation(id).map_err(storage_error)? {
            GateOutcome::Acquired(query) => query,
            GateOutcome::Busy => return Err(QueryError::ConcurrentRequest(id)),
            GateOutcome::AlreadyAnswered => {
                return Err(QueryError::InvalidState(format!("query {id} is already answered")));
            }
            GateOutcome::NotFound => return Err(QueryError::NotFound(format!("query {id}"))),
        };

        match self.run_generation(&store, &query) {
            Ok(answer) => {
                store.update_query_state(id, QueryState::Answered).map_err(storage_error)?;
                tracing::info!(query_id = %id, answer_id = %answer.id, "query answered");
                Ok(answer)
            }
            Err(err) => {
                store.update_query_state(id, QueryState::Failed).map_err(storage_error)?;
                tracing::warn!(query_id = %id, error = %err, "generation attempt failed");
                Err(err)
            }
        }
    }

    fn run_generation(&self, store: &ConsultaStore, query: &Query) -> Result<Answer, QueryError> {
        // Retrieval always reads the full active corpus; the query's category
        // only labels the prompt.
        let corpus = store.list_active_documents(None).map_err(storage_error)?;
        let snapshot_digest = compute_snapshot_digest(&corpus);
        let selection =
            self.selector.select(&query.question, &corpus, self.config.max_context_chars);

        let category_name = match query.category_id {
            Some(category_id) => store
                .get_category(category_id)
                .map_err(storage_error)?
                .map(|category| category.name),
            None => None,
        };

        let prompt = compose_prompt(
            &self.config.composer,
            &selection.text,
            category_name.as_deref(),
            &query.question,
        );
        let content = generate_answer_text(&self.generator, &prompt, &self.config.generation)?;

        let confidence = if selection.used_fallback || selection.is_empty() {
            FALLBACK_CONFIDENCE
        } else {
            MATCHED_CONFIDENCE
        };
        let answer = Answer {
            id: AnswerId::new(),
            query_id: query.id,
            content,
            referenced_document_ids: selection.referenced_document_ids,
            generated_automatically: true,
            confidence: Some(confidence),
            snapshot_digest,
            created_at: OffsetDateTime::now_utc(),
        };
        answer.validate()?;
        store.insert_answer(&answer).map_err(storage_error)?;
        Ok(answer)
    }

    /// # Errors
    /// Returns [`QueryError::NotFound`] for unknown queries.
    pub fn get_query(&self, id: QueryId) -> Result<Query, QueryError> {
        let store = self.open_store()?;
        store
            .get_query(id)
            .map_err(storage_error)?
            .ok_or_else(|| QueryError::NotFound(format!("query {id}")))
    }

    /// Current state plus the canonical answer. The payload is only present
    /// while the query sits in `answered`; a reopened or failed query has no
    /// canonical answer even when older attempt rows exist.
    ///
    /// # Errors
    /// Returns [`QueryError::NotFound`] for unknown queries.
    pub fn answer_status(&self, id: QueryId) -> Result<AnswerStatus, QueryError> {
        let store = self.open_store()?;
        let query = store
            .get_query(id)
            .map_err(storage_error)?
            .ok_or_else(|| QueryError::NotFound(format!("query {id}")))?;
        let answer = if query.state == QueryState::Answered {
            store.latest_answer(id).map_err(storage_error)?
        } else {
            None
        };
        Ok(AnswerStatus { query_id: id, state: query.state, answer })
    }

    /// # Errors
    /// Returns [`QueryError::Storage`] when the listing fails.
    pub fn list_queries(&self) -> Result<Vec<Query>, QueryError> {
        let store = self.open_store()?;
        store.list_queries().map_err(storage_error)
    }

    /// # Errors
    /// Returns [`QueryError::Storage`] when the listing fails.
    pub fn list_queries_for_submitter(&self, submitter_id: &str) -> Result<Vec<Query>, QueryError> {
        let store = self.open_store()?;
        store.list_queries_for_submitter(submitter_id).map_err(storage_error)
    }

    /// Administrative state override. Moving to `answered` requires a stored
    /// answer; every other transition is allowed, including reopening.
    ///
    /// # Errors
    /// Returns [`QueryError::NotFound`] for unknown queries and
    /// [`QueryError::InvalidState`] for `answered` without an answer.
    pub fn set_state(
        &self,
        token: &AdminToken,
        id: QueryId,
        state: QueryState,
    ) -> Result<Query, QueryError> {
        let store = self.open_store()?;
        let before = store
            .get_query(id)
            .map_err(storage_error)?
            .ok_or_else(|| QueryError::NotFound(format!("query {id}")))?;

        if state == QueryState::Answered
            && store.latest_answer(id).map_err(storage_error)?.is_none()
        {
            return Err(QueryError::InvalidState(format!(
                "query {id} cannot be marked answered without a stored answer"
            )));
        }

        store.update_query_state(id, state).map_err(storage_error)?;
        tracing::info!(
            query_id = %id,
            from = %before.state,
            to = %state,
            actor = token.actor(),
            "administrative state override"
        );
        store
            .get_query(id)
            .map_err(storage_error)?
            .ok_or_else(|| QueryError::NotFound(format!("query {id}")))
    }

    /// Workload counters, with `today` anchored at UTC midnight and
    /// `this_week` at the preceding Monday.
    ///
    /// # Errors
    /// Returns [`QueryError::Storage`] when any counter query fails.
    pub fn volume_stats(&self) -> Result<QueryVolumeStats, QueryError> {
        let store = self.open_store()?;
        let counters = store.counters().map_err(storage_error)?;

        let now = OffsetDateTime::now_utc();
        let today_start = now.replace_time(Time::MIDNIGHT);
        let week_start =
            today_start - Duration::days(i64::from(now.weekday().number_days_from_monday()));

        let today = store.count_queries_since(today_start).map_err(storage_error)?;
        let this_week = store.count_queries_since(week_start).map_err(storage_error)?;

        Ok(QueryVolumeStats {
            total_queries: counters.total_queries,
            pending: counters.pending,
            in_progress: counters.in_progress,
            answered: counters.answered,
            failed: counters.failed,
            today,
            this_week,
            active_documents: counters.active_documents,
            by_category: counters.by_category,
        })
    }

    /// # Errors
    /// Returns [`QueryError::Validation`] for a blank name.
    pub fn add_category(
        &self,
        token: &AdminToken,
        input: AddCategoryRequest,
    ) -> Result<Category, QueryError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(QueryError::Validation("category name must not be empty".to_string()));
        }

        let store = self.open_store()?;
        let category = Category {
            id: CategoryId::new(),
            name: name.to_string(),
            description: input.description,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_category(&category).map_err(storage_error)?;
        tracing::info!(category_id = %category.id, actor = token.actor(), "category added");
        Ok(category)
    }

    /// # Errors
    /// Returns [`QueryError::Storage`] when the listing fails.
    pub fn list_categories(&self) -> Result<Vec<Category>, QueryError> {
        let store = self.open_store()?;
        store.list_categories().map_err(storage_error)
    }

    /// Register a regulatory document; it joins the retrieval corpus
    /// immediately.
    ///
    /// # Errors
    /// Returns [`QueryError::Validation`] for blank title or text and
    /// [`QueryError::NotFound`] for an unknown category.
    pub fn add_document(
        &self,
        token: &AdminToken,
        input: AddDocumentRequest,
    ) -> Result<Document, QueryError> {
        if input.title.trim().is_empty() {
            return Err(QueryError::Validation("document title must not be empty".to_string()));
        }
        if input.text.trim().is_empty() {
            return Err(QueryError::Validation("document text must not be empty".to_string()));
        }

        let store = self.open_store()?;
        if let Some(category_id) = input.category_id {
            if store.get_category(category_id).map_err(storage_error)?.is_none() {
                return Err(QueryError::NotFound(format!("category {category_id}")));
            }
        }

        let now = OffsetDateTime::now_utc();
        let document = Document {
            id: DocumentId::new(),
            title: input.title,
            text: input.text,
            kind: input.kind,
            number: input.number,
            category_id: input.category_id,
            active: true,
            created_at: now,
            updated_at: now,
        };
        store.insert_document(&document).map_err(storage_error)?;
        tracing::info!(document_id = %document.id, actor = token.actor(), "document added");
        Ok(document)
    }

    /// # Errors
    /// Returns [`QueryError::Storage`] when the listing fails.
    pub fn list_documents(&self) -> Result<Vec<Document>, QueryError> {
        let store = self.open_store()?;
        store.list_documents().map_err(storage_error)
    }

    /// Flip a document in or out of the retrieval corpus.
    ///
    /// # Errors
    /// Returns [`QueryError::NotFound`] for unknown documents.
    pub fn set_document_active(
        &self,
        token: &AdminToken,
        id: DocumentId,
        active: bool,
    ) -> Result<Document, QueryError> {
        let store = self.open_store()?;
        if !store.set_document_active(id, active).map_err(storage_error)? {
            return Err(QueryError::NotFound(format!("document {id}")));
        }
        tracing::info!(document_id = %id, active, actor = token.actor(), "document eligibility changed");
        store
            .get_document(id)
            .map_err(storage_error)?
            .ok_or_else(|| QueryError::NotFound(format!("document {id}")))
    }
}

fn storage_error(err: anyhow::Error) -> QueryError {
    QueryError::Storage(format!("{err:#}"))
}

/// Digest of the active-document snapshot a generation attempt ran against.
/// Stable across row order; changes whenever any document is added, edited,
/// or toggled.
fn compute_snapshot_digest(documents: &[Document]) -> String {
    let mut hasher = Sha256::new();

    let mut lines = documents
        .iter()
        .map(|document| format!("{}:{}", document.id, document.updated_at.unix_timestamp()))
        .collect::<Vec<_>>();
    lines.sort_unstable();

    for line in lines {
        hasher.update(line.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}
