use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use consulta_api::{
    AddCategoryRequest, AddDocumentRequest, AdminToken, ConsultaApi, SubmitRequest,
};
use consulta_core::{
    DocumentId, DocumentKind, GenerationError, GenerationParams, Generator, Priority, QueryId,
    QueryState,
};
use consulta_llm::{HttpCompletionClient, LlmConfig};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "consulta")]
#[command(about = "Regulatory Q&A CLI")]
struct Cli {
    #[arg(long, default_value = "./consulta_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
    Document {
        #[command(subcommand)]
        command: DocumentCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    Add(CategoryAddArgs),
    List,
}

#[derive(Debug, Args)]
struct CategoryAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DocumentCommand {
    Add(DocumentAddArgs),
    List,
    Activate(DocumentIdArgs),
    Deactivate(DocumentIdArgs),
}

#[derive(Debug, Args)]
struct DocumentAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    text: String,
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    number: Option<String>,
    #[arg(long)]
    category_id: Option<String>,
}

#[derive(Debug, Args)]
struct DocumentIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Submit(QuerySubmitArgs),
    Answer(QueryIdArgs),
    Status(QueryIdArgs),
    SetState(QuerySetStateArgs),
    List(QueryListArgs),
}

#[derive(Debug, Args)]
struct QuerySubmitArgs {
    #[arg(long)]
    submitter: String,
    #[arg(long)]
    question: String,
    #[arg(long)]
    category_id: Option<String>,
    #[arg(long, value_enum)]
    priority: Option<PriorityArg>,
}

#[derive(Debug, Args)]
struct QueryIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct QuerySetStateArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    state: StateArg,
}

#[derive(Debug, Args)]
struct QueryListArgs {
    #[arg(long)]
    submitter: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Ley,
    Decreto,
    Resolucion,
    Circular,
    Directiva,
    Otro,
}

impl From<KindArg> for DocumentKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Ley => Self::Ley,
            KindArg::Decreto => Self::Decreto,
            KindArg::Resolucion => Self::Resolucion,
            KindArg::Circular => Self::Circular,
            KindArg::Directiva => Self::Directiva,
            KindArg::Otro => Self::Otro,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
    Urgent,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
            PriorityArg::Urgent => Self::Urgent,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    InProgress,
    Answered,
    Failed,
}

impl From<StateArg> for QueryState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Pending => Self::Pending,
            StateArg::InProgress => Self::InProgress,
            StateArg::Answered => Self::Answered,
            StateArg::Failed => Self::Failed,
        }
    }
}

/// Placeholder for commands that never generate. Keeps provider setup out of
/// every invocation that only touches the store.
struct UnconfiguredGenerator;

impl Generator for UnconfiguredGenerator {
    fn complete(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        Err(GenerationError::Provider("no generation provider configured".to_string()))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn local_api(db: PathBuf) -> ConsultaApi<UnconfiguredGenerator> {
    ConsultaApi::new(db, UnconfiguredGenerator)
}

fn admin() -> AdminToken {
    AdminToken::new("cli")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(command, cli.db),
        Command::Category { command } => run_category(command, cli.db),
        Command::Document { command } => run_document(command, cli.db),
        Command::Query { command } => run_query(command, cli.db),
        Command::Stats => run_stats(cli.db),
    }
}

fn run_db(command: DbCommand, db: PathBuf) -> Result<()> {
    let api = local_api(db);
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_category(command: CategoryCommand, db: PathBuf) -> Result<()> {
    let api = local_api(db);
    match command {
        CategoryCommand::Add(args) => {
            let category = api.add_category(
                &admin(),
                AddCategoryRequest { name: args.name, description: args.description },
            )?;
            emit_json(serde_json::to_value(category)?)
        }
        CategoryCommand::List => {
            let categories = api.list_categories()?;
            emit_json(serde_json::json!({ "categories": categories }))
        }
    }
}

fn run_document(command: DocumentCommand, db: PathBuf) -> Result<()> {
    let api = local_api(db);
    match command {
        DocumentCommand::Add(args) => {
            let category_id = args
                .category_id
                .as_deref()
                .map(consulta_core::CategoryId::parse)
                .transpose()?;
            let document = api.add_document(
                &admin(),
                AddDocumentRequest {
                    title: args.title,
                    text: args.text,
                    kind: args.kind.into(),
                    number: args.number,
                    category_id,
                },
            )?;
            emit_json(serde_json::to_value(document)?)
        }
        DocumentCommand::List => {
            let documents = api.list_documents()?;
            emit_json(serde_json::json!({ "documents": documents }))
        }
        DocumentCommand::Activate(args) => {
            let id = DocumentId::parse(&args.id)?;
            let document = api.set_document_active(&admin(), id, true)?;
            emit_json(serde_json::to_value(document)?)
        }
        DocumentCommand::Deactivate(args) => {
            let id = DocumentId::parse(&args.id)?;
            let document = api.set_document_active(&admin(), id, false)?;
            emit_json(serde_json::to_value(document)?)
        }
    }
}

fn run_query(command: QueryCommand, db: PathBuf) -> Result<()> {
    match command {
        QueryCommand::Submit(args) => {
            let api = local_api(db);
            let category_id = args
                .category_id
                .as_deref()
                .map(consulta_core::CategoryId::parse)
                .transpose()?;
            let query = api.submit(SubmitRequest {
                submitter_id: args.submitter,
                question: args.question,
                category_id,
                priority: args.priority.map(Into::into),
            })?;
            emit_json(serde_json::to_value(query)?)
        }
        QueryCommand::Answer(args) => {
            let generator = HttpCompletionClient::new(LlmConfig::from_env()?);
            let api = ConsultaApi::new(db, generator);
            let id = QueryId::parse(&args.id)?;
            let answer = api.request_answer(id)?;
            emit_json(serde_json::to_value(answer)?)
        }
        QueryCommand::Status(args) => {
            let api = local_api(db);
            let id = QueryId::parse(&args.id)?;
            let status = api.answer_status(id)?;
            emit_json(serde_json::to_value(status)?)
        }
        QueryCommand::SetState(args) => {
            let api = local_api(db);
            let id = QueryId::parse(&args.id)?;
            let query = api.set_state(&admin(), id, args.state.into())?;
            emit_json(serde_json::to_value(query)?)
        }
        QueryCommand::List(args) => {
            let api = local_api(db);
            let queries = match args.submitter.as_deref() {
                Some(submitter) => api.list_queries_for_submitter(submitter)?,
                None => api.list_queries()?,
            };
            emit_json(serde_json::json!({ "queries": queries }))
        }
    }
}

fn run_stats(db: PathBuf) -> Result<()> {
    let api = local_api(db);
    let stats = api.volume_stats()?;
    emit_json(serde_json::to_value(stats)?)
}
