use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use consulta_core::{
    Answer, AnswerId, Category, CategoryId, Document, DocumentId, DocumentKind, Priority, Query,
    QueryId, QueryState,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  category_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
  document_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  text TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('ley','decreto','resolucion','circular','directiva','otro')),
  number TEXT,
  category_id TEXT,
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (category_id) REFERENCES categories(category_id)
);

CREATE TABLE IF NOT EXISTS queries (
  query_id TEXT PRIMARY KEY,
  submitter_id TEXT NOT NULL,
  question TEXT NOT NULL,
  category_id TEXT,
  priority TEXT NOT NULL CHECK (priority IN ('low','normal','high','urgent')),
  state TEXT NOT NULL CHECK (state IN ('pending','in_progress','answered','failed')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (category_id) REFERENCES categories(category_id)
);

CREATE TABLE IF NOT EXISTS answers (
  answer_id TEXT PRIMARY KEY,
  query_id TEXT NOT NULL,
  content TEXT NOT NULL,
  referenced_document_ids TEXT NOT NULL,
  generated_automatically INTEGER NOT NULL CHECK (generated_automatically IN (0,1)),
  confidence REAL,
  snapshot_digest TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (query_id) REFERENCES queries(query_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_active ON documents(active);
CREATE INDEX IF NOT EXISTS idx_documents_category ON documents(category_id);
CREATE INDEX IF NOT EXISTS idx_queries_state ON queries(state);
CREATE INDEX IF NOT EXISTS idx_queries_submitter ON queries(submitter_id);
CREATE INDEX IF NOT EXISTS idx_queries_created_at ON queries(created_at);
CREATE INDEX IF NOT EXISTS idx_answers_query ON answers(query_id);
";

pub struct ConsultaStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of the atomic generation gate. Exactly one concurrent caller for
/// a given query observes `Acquired`; every loser observes why it lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The caller won the gate; the query is now `in_progress`.
    Acquired(Query),
    /// Another generation attempt holds the gate.
    Busy,
    /// The query already reached `answered`.
    AlreadyAnswered,
    NotFound,
}

/// Per-category query counts for the workload report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreCounters {
    pub total_queries: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub answered: u64,
    pub failed: u64,
    pub active_documents: u64,
    pub by_category: BTreeMap<String, u64>,
}

impl ConsultaStore {
    /// Open the SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails, including name collisions.
    pub fn insert_category(&self, category: &Category) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO categories(category_id, name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    category.id.to_string(),
                    category.name,
                    category.description,
                    rfc3339(category.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert category {}", category.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            "SELECT category_id, name, description, created_at
             FROM categories ORDER BY category_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut categories = Vec::new();
        for row in rows {
            let (id, name, description, created_at) = row?;
            categories.push(Category {
                id: CategoryId(parse_ulid(&id)?),
                name,
                description,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(categories)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn get_category(&self, id: CategoryId) -> Result<Option<Category>> {
        let row = self
            .conn
            .prepare(
                "SELECT category_id, name, description, created_at
                 FROM categories WHERE category_id = ?1",
            )?
            .query_row(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some((raw_id, name, description, created_at)) => Ok(Some(Category {
                id: CategoryId(parse_ulid(&raw_id)?),
                name,
                description,
                created_at: parse_rfc3339(&created_at)?,
            })),
        }
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_document(&self, document: &Document) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO documents(
                    document_id, title, text, kind, number, category_id,
                    active, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    document.id.to_string(),
                    document.title,
                    document.text,
                    document.kind.as_str(),
                    document.number,
                    document.category_id.map(|id| id.to_string()),
                    i64::from(document.active),
                    rfc3339(document.created_at)?,
                    rfc3339(document.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to insert document {}", document.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_documents(&self) -> Result<Vec<Document>> {
        self.query_documents("SELECT * FROM documents ORDER BY document_id ASC")
    }

    /// The retrieval corpus: every active document in insertion order,
    /// optionally narrowed to one category.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_active_documents(&self, category: Option<CategoryId>) -> Result<Vec<Document>> {
        match category {
            None => self.query_documents(
                "SELECT * FROM documents WHERE active = 1 ORDER BY document_id ASC",
            ),
            Some(category_id) => {
                let mut stmt = self.conn.prepare(
                    "SELECT * FROM documents WHERE active = 1 AND category_id = ?1
                     ORDER BY document_id ASC",
                )?;
                let rows = stmt.query_map(params![category_id.to_string()], raw_document_row)?;

                let mut documents = Vec::new();
                for row in rows {
                    documents.push(document_from_raw(row?)?);
                }
                Ok(documents)
            }
        }
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = self
            .conn
            .prepare("SELECT * FROM documents WHERE document_id = ?1")?
            .query_row(params![id.to_string()], raw_document_row)
            .optional()?;

        match row {
            None => Ok(None),
            Some(raw) => Ok(Some(document_from_raw(raw)?)),
        }
    }

    fn query_documents(&self, sql: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], raw_document_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(document_from_raw(row?)?);
        }
        Ok(documents)
    }

    /// Flip a document's retrieval eligibility. Returns `false` when no such
    /// document exists.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_document_active(&self, id: DocumentId, active: bool) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE documents SET active = ?2, updated_at = ?3 WHERE document_id = ?1",
                params![id.to_string(), i64::from(active), now_rfc3339()?],
            )
            .with_context(|| format!("failed to update document {id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_query(&self, query: &Query) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO queries(
                    query_id, submitter_id, question, category_id,
                    priority, state, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    query.id.to_string(),
                    query.submitter_id,
                    query.question,
                    query.category_id.map(|id| id.to_string()),
                    query.priority.as_str(),
                    query.state.as_str(),
                    rfc3339(query.created_at)?,
                    rfc3339(query.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to insert query {}", query.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn get_query(&self, id: QueryId) -> Result<Option<Query>> {
        let row = self
            .conn
            .prepare("SELECT * FROM queries WHERE query_id = ?1")?
            .query_row(params![id.to_string()], raw_query_row)
            .optional()?;

        match row {
            None => Ok(None),
            Some(raw) => Ok(Some(query_from_raw(raw)?)),
        }
    }

    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_queries(&self) -> Result<Vec<Query>> {
        let mut stmt =
            self.conn.prepare("SELECT * FROM queries ORDER BY query_id ASC")?;
        let rows = stmt.query_map([], raw_query_row)?;

        let mut queries = Vec::new();
        for row in rows {
            queries.push(query_from_raw(row?)?);
        }
        Ok(queries)
    }

    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_queries_for_submitter(&self, submitter_id: &str) -> Result<Vec<Query>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM queries WHERE submitter_id = ?1 ORDER BY query_id ASC",
        )?;
        let rows = stmt.query_map(params![submitter_id], raw_query_row)?;

        let mut queries = Vec::new();
        for row in rows {
            queries.push(query_from_raw(row?)?);
        }
        Ok(queries)
    }

    /// Unconditionally move a query to `state`. Callers enforce transition
    /// legality; this is the primitive the admin override also uses.
    ///
    /// # Errors
    /// Returns an error when the update fails or the query does not exist.
    pub fn update_query_state(&self, id: QueryId, state: QueryState) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE queries SET state = ?2, updated_at = ?3 WHERE query_id = ?1",
                params![id.to_string(), state.as_str(), now_rfc3339()?],
            )
            .with_context(|| format!("failed to update state of query {id}"))?;
        if changed == 0 {
            return Err(anyhow!("query {id} does not exist"));
        }
        Ok(())
    }

    /// Atomically claim a query for generation. The conditional UPDATE is the
    /// whole gate: it succeeds for exactly one caller while the query sits in
    /// `pending` or `failed`, and everyone else inspects the row to learn why
    /// they lost.
    ///
    /// # Errors
    /// Returns an error when the gate update or the follow-up read fails.
    pub fn begin_generation(&self, id: QueryId) -> Result<GateOutcome> {
        let changed = self
            .conn
            .execute(
                "UPDATE queries SET state = 'in_progress', updated_at = ?2
                 WHERE query_id = ?1 AND state IN ('pending', 'failed')",
                params![id.to_string(), now_rfc3339()?],
            )
            .with_context(|| format!("failed to claim query {id} for generation"))?;

        let Some(query) = self.get_query(id)? else {
            return Ok(GateOutcome::NotFound);
        };

        if changed == 1 {
            return Ok(GateOutcome::Acquired(query));
        }

        match query.state {
            QueryState::Answered => Ok(GateOutcome::AlreadyAnswered),
            _ => Ok(GateOutcome::Busy),
        }
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_answer(&self, answer: &Answer) -> Result<()> {
        let referenced = serde_json::to_string(&answer.referenced_document_ids)
            .context("failed to serialize referenced document ids")?;
        self.conn
            .execute(
                "INSERT INTO answers(
                    answer_id, query_id, content, referenced_document_ids,
                    generated_automatically, confidence, snapshot_digest, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    answer.id.to_string(),
                    answer.query_id.to_string(),
                    answer.content,
                    referenced,
                    i64::from(answer.generated_automatically),
                    answer.confidence.map(f64::from),
                    answer.snapshot_digest,
                    rfc3339(answer.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert answer {}", answer.id))?;
        Ok(())
    }

    /// The canonical answer for a query: the newest row, since ULID primary
    /// keys sort by creation time.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn latest_answer(&self, query_id: QueryId) -> Result<Option<Answer>> {
        let row = self
            .conn
            .prepare(
                "SELECT * FROM answers WHERE query_id = ?1
                 ORDER BY answer_id DESC LIMIT 1",
            )?
            .query_row(params![query_id.to_string()], |row| {
                Ok(RawAnswerRow {
                    answer_id: row.get("answer_id")?,
                    query_id: row.get("query_id")?,
                    content: row.get("content")?,
                    referenced_document_ids: row.get("referenced_document_ids")?,
                    generated_automatically: row.get("generated_automatically")?,
                    confidence: row.get("confidence")?,
                    snapshot_digest: row.get("snapshot_digest")?,
                    created_at: row.get("created_at")?,
                })
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some(raw) => Ok(Some(answer_from_raw(raw)?)),
        }
    }

    /// Aggregate workload counters: totals per lifecycle state, the active
    /// corpus size, and per-category query counts (uncategorized queries are
    /// reported under `General`).
    ///
    /// # Errors
    /// Returns an error when any counter query fails.
    pub fn counters(&self) -> Result<StoreCounters> {
        let total_queries = self.count("SELECT COUNT(*) FROM queries", [])?;
        let pending = self.count_in_state(QueryState::Pending)?;
        let in_progress = self.count_in_state(QueryState::InProgress)?;
        let answered = self.count_in_state(QueryState::Answered)?;
        let failed = self.count_in_state(QueryState::Failed)?;
        let active_documents =
            self.count("SELECT COUNT(*) FROM documents WHERE active = 1", [])?;

        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(c.name, 'General') AS category, COUNT(*)
             FROM queries q LEFT JOIN categories c ON q.category_id = c.category_id
             GROUP BY category",
        )?;
        let rows =
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut by_category = BTreeMap::new();
        for row in rows {
            let (name, count) = row?;
            by_category.insert(name, u64::try_from(count).unwrap_or(0));
        }

        Ok(StoreCounters {
            total_queries,
            pending,
            in_progress,
            answered,
            failed,
            active_documents,
            by_category,
        })
    }

    /// Count queries created at or after `since`.
    ///
    /// # Errors
    /// Returns an error when the counter query fails.
    pub fn count_queries_since(&self, since: OffsetDateTime) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM queries WHERE created_at >= ?1",
            params![rfc3339(since)?],
        )
    }

    fn count_in_state(&self, state: QueryState) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM queries WHERE state = ?1",
            params![state.as_str()],
        )
    }

    fn count<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<u64> {
        let count = self
            .conn
            .query_row(sql, params, |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run counter query: {sql}"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

struct RawDocumentRow {
    document_id: String,
    title: String,
    text: String,
    kind: String,
    number: Option<String>,
    category_id: Option<String>,
    active: i64,
    created_at: String,
    updated_at: String,
}

fn raw_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDocumentRow> {
    Ok(RawDocumentRow {
        document_id: row.get("document_id")?,
        title: row.get("title")?,
        text: row.get("text")?,
        kind: row.get("kind")?,
        number: row.get("number")?,
        category_id: row.get("category_id")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn document_from_raw(raw: RawDocumentRow) -> Result<Document> {
    let kind = DocumentKind::parse(&raw.kind)
        .ok_or_else(|| anyhow!("unknown document kind in store: {}", raw.kind))?;
    Ok(Document {
        id: DocumentId(parse_ulid(&raw.document_id)?),
        title: raw.title,
        text: raw.text,
        kind,
        number: raw.number,
        category_id: raw.category_id.as_deref().map(parse_ulid).transpose()?.map(CategoryId),
        active: raw.active != 0,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
    })
}

struct RawQueryRow {
    query_id: String,
    submitter_id: String,
    question: String,
    category_id: Option<String>,
    priority: String,
    state: String,
    created_at: String,
    updated_at: String,
}

fn raw_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQueryRow> {
    Ok(RawQueryRow {
        query_id: row.get("query_id")?,
        submitter_id: row.get("submitter_id")?,
        question: row.get("question")?,
        category_id: row.get("category_id")?,
        priority: row.get("priority")?,
        state: row.get("state")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn query_from_raw(raw: RawQueryRow) -> Result<Query> {
    let priority = Priority::parse(&raw.priority)
        .ok_or_else(|| anyhow!("unknown priority in store: {}", raw.priority))?;
    let state = QueryState::parse(&raw.state)
        .ok_or_else(|| anyhow!("unknown query state in store: {}", raw.state))?;
    Ok(Query {
        id: QueryId(parse_ulid(&raw.query_id)?),
        submitter_id: raw.submitter_id,
        question: raw.question,
        category_id: raw.category_id.as_deref().map(parse_ulid).transpose()?.map(CategoryId),
        priority,
        state,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
    })
}

struct RawAnswerRow {
    answer_id: String,
    query_id: String,
    content: String,
    referenced_document_ids: String,
    generated_automatically: i64,
    confidence: Option<f64>,
    snapshot_digest: String,
    created_at: String,
}

fn answer_from_raw(raw: RawAnswerRow) -> Result<Answer> {
    let referenced_document_ids: Vec<DocumentId> =
        serde_json::from_str(&raw.referenced_document_ids)
            .context("failed to parse referenced document ids")?;
    #[allow(clippy::cast_possible_truncation)]
    let confidence = raw.confidence.map(|value| value as f32);
    Ok(Answer {
        id: AnswerId(parse_ulid(&raw.answer_id)?),
        query_id: QueryId(parse_ulid(&raw.query_id)?),
        content: raw.content,
        referenced_document_ids,
        generated_automatically: raw.generated_automatically != 0,
        confidence,
        snapshot_digest: raw.snapshot_digest,
        created_at: parse_rfc3339(&raw.created_at)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;

    fn open_migrated() -> Result<ConsultaStore> {
        let mut store = ConsultaStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn sample_category(name: &str) -> Category {
        Category {
            id: CategoryId::new(),
            name: name.to_string(),
            description: Some("fixture".to_string()),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn sample_document(category_id: Option<CategoryId>, text: &str) -> Document {
        let now = OffsetDateTime::now_utc();
        Document {
            id: DocumentId::new(),
            title: "Ley de Contrataciones".to_string(),
            text: text.to_string(),
            kind: DocumentKind::Ley,
            number: Some("30225".to_string()),
            category_id,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_query(category_id: Option<CategoryId>) -> Query {
        let now = OffsetDateTime::now_utc();
        Query {
            id: QueryId::new(),
            submitter_id: "user-1".to_string(),
            question: "¿Cuáles son los plazos de una licitación?".to_string(),
            category_id,
            priority: Priority::Normal,
            state: QueryState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_answer(query_id: QueryId, content: &str) -> Answer {
        Answer {
            id: AnswerId::new(),
            query_id,
            content: content.to_string(),
            referenced_document_ids: vec![DocumentId::new()],
            generated_automatically: true,
            confidence: Some(0.8),
            snapshot_digest: "snap_0123456789abcdef".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_schema_status() -> Result<()> {
        let mut store = ConsultaStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());

        Ok(())
    }

    #[test]
    fn categories_and_documents_round_trip() -> Result<()> {
        let store = open_migrated()?;

        let category = sample_category("Licitaciones");
        store.insert_category(&category)?;

        let document = sample_document(Some(category.id), "Artículo 1.- Objeto de la Ley.");
        store.insert_document(&document)?;

        assert_eq!(store.get_category(category.id)?, Some(category.clone()));
        assert_eq!(store.list_categories()?, vec![category]);
        assert_eq!(store.list_documents()?, vec![document]);

        Ok(())
    }

    #[test]
    fn duplicate_category_names_are_rejected() -> Result<()> {
        let store = open_migrated()?;
        store.insert_category(&sample_category("Licitaciones"))?;
        assert!(store.insert_category(&sample_category("Licitaciones")).is_err());
        Ok(())
    }

    #[test]
    fn only_active_documents_form_the_retrieval_corpus() -> Result<()> {
        let store = open_migrated()?;

        let category = sample_category("Licitaciones");
        store.insert_category(&category)?;

        let kept = sample_document(Some(category.id), "Norma vigente.");
        let uncategorized = sample_document(None, "Norma general.");
        let retired = sample_document(None, "Norma derogada.");
        store.insert_document(&kept)?;
        store.insert_document(&uncategorized)?;
        store.insert_document(&retired)?;

        assert!(store.set_document_active(retired.id, false)?);
        assert!(!store.set_document_active(DocumentId::new(), false)?);

        let corpus = store.list_active_documents(None)?;
        assert_eq!(corpus.len(), 2);

        let narrowed = store.list_active_documents(Some(category.id))?;
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].id, kept.id);

        Ok(())
    }

    #[test]
    fn queries_round_trip_and_filter_by_submitter() -> Result<()> {
        let store = open_migrated()?;

        let mine = sample_query(None);
        let mut theirs = sample_query(None);
        theirs.submitter_id = "user-2".to_string();
        store.insert_query(&mine)?;
        store.insert_query(&theirs)?;

        assert_eq!(store.get_query(mine.id)?, Some(mine.clone()));
        assert_eq!(store.get_query(QueryId::new())?, None);
        assert_eq!(store.list_queries()?.len(), 2);

        let filtered = store.list_queries_for_submitter("user-1")?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, mine.id);

        Ok(())
    }

    #[test]
    fn generation_gate_admits_exactly_one_claim() -> Result<()> {
        let store = open_migrated()?;
        let query = sample_query(None);
        store.insert_query(&query)?;

        let claimed = match store.begin_generation(query.id)? {
            GateOutcome::Acquired(claimed) => claimed,
            other => panic!("first claim should acquire the gate, got {other:?}"),
        };
        assert_eq!(claimed.state, QueryState::InProgress);

        assert_eq!(store.begin_generation(query.id)?, GateOutcome::Busy);
        assert_eq!(store.begin_generation(QueryId::new())?, GateOutcome::NotFound);

        Ok(())
    }

    #[test]
    fn gate_reopens_after_failure_but_not_after_answer() -> Result<()> {
        let store = open_migrated()?;
        let query = sample_query(None);
        store.insert_query(&query)?;

        assert!(matches!(store.begin_generation(query.id)?, GateOutcome::Acquired(_)));
        store.update_query_state(query.id, QueryState::Failed)?;
        assert!(matches!(store.begin_generation(query.id)?, GateOutcome::Acquired(_)));

        store.update_query_state(query.id, QueryState::Answered)?;
        assert_eq!(store.begin_generation(query.id)?, GateOutcome::AlreadyAnswered);

        Ok(())
    }

    #[test]
    fn latest_answer_returns_the_newest_row() -> Result<()> {
        let store = open_migrated()?;
        let query = sample_query(None);
        store.insert_query(&query)?;

        let older = sample_answer(query.id, "Primer intento.");
        store.insert_answer(&older)?;
        let newer = sample_answer(query.id, "Segundo intento.");
        store.insert_answer(&newer)?;

        let latest = store.latest_answer(query.id)?;
        assert_eq!(latest.map(|answer| answer.id), Some(newer.id));
        assert_eq!(store.latest_answer(QueryId::new())?, None);

        Ok(())
    }

    #[test]
    fn counters_report_states_and_categories() -> Result<()> {
        let store = open_migrated()?;

        let category = sample_category("Licitaciones");
        store.insert_category(&category)?;
        store.insert_document(&sample_document(Some(category.id), "Norma."))?;

        let categorized = sample_query(Some(category.id));
        store.insert_query(&categorized)?;
        let uncategorized = sample_query(None);
        store.insert_query(&uncategorized)?;
        store.update_query_state(uncategorized.id, QueryState::Answered)?;

        let counters = store.counters()?;
        assert_eq!(counters.total_queries, 2);
        assert_eq!(counters.pending, 1);
        assert_eq!(counters.answered, 1);
        assert_eq!(counters.active_documents, 1);
        assert_eq!(counters.by_category.get("Licitaciones"), Some(&1));
        assert_eq!(counters.by_category.get("General"), Some(&1));

        let yesterday = OffsetDateTime::now_utc() - time::Duration::days(1);
        assert_eq!(store.count_queries_since(yesterday)?, 2);
        let tomorrow = OffsetDateTime::now_utc() + time::Duration::days(1);
        assert_eq!(store.count_queries_since(tomorrow)?, 0);

        Ok(())
    }

    #[test]
    fn concurrent_gate_claims_admit_a_single_winner() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("consultakernel-gate-{}.sqlite3", Ulid::new()));
        let query = sample_query(None);
        {
            let mut init = ConsultaStore::open(&db_path)?;
            init.migrate()?;
            init.insert_query(&query)?;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = db_path.clone();
            let query_id = query.id;
            handles.push(thread::spawn(move || -> Result<GateOutcome> {
                let store = ConsultaStore::open(&path)?;
                store.begin_generation(query_id)
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                return Err(anyhow!("gate thread panicked"));
            };
            if matches!(outcome?, GateOutcome::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }

        Ok(())
    }
}
