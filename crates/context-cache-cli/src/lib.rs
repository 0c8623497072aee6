//! Maintenance command surface over the context and conversation stores.
//!
//! Every command prints pretty JSON to stdout. Logs go to stderr so output
//! stays machine-readable.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use context_cache_core::{
    fingerprint, similarity, ConversationId, PromptNormalization, ResponseCacheSettings, Role,
    Settings, DEFAULT_TAG,
};
use context_cache_response::PromptClassifier;
use context_cache_store_sqlite::{SqliteContextStore, SqliteConversationStore};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "ctxcache")]
#[command(about = "Context and conversation cache maintenance CLI")]
pub struct Cli {
    #[arg(long, default_value = "./rag_context.sqlite3")]
    context_db: PathBuf,

    #[arg(long, default_value = "./conversation_memory.sqlite3")]
    conversation_db: PathBuf,

    /// TOML settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Context {
        #[command(subcommand)]
        command: Box<ContextCommand>,
    },
    Conversation {
        #[command(subcommand)]
        command: Box<ConversationCommand>,
    },
    Cache {
        #[command(subcommand)]
        command: Box<CacheCommand>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContextCommand {
    Store(ContextStoreArgs),
    Retrieve(ContextQueryArgs),
    Search(ContextSearchArgs),
    Summary(OwnerArgs),
    Clear(OwnerArgs),
    Stats,
    Sweep,
}

#[derive(Debug, Args)]
pub struct ContextStoreArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    content_json: String,
    #[arg(long, default_value = DEFAULT_TAG)]
    tag: String,
}

#[derive(Debug, Args)]
pub struct ContextQueryArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    query: String,
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ContextSearchArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    term: String,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct OwnerArgs {
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Subcommand)]
pub enum ConversationCommand {
    Start(StartArgs),
    Add(AddMessageArgs),
    History(HistoryArgs),
    Format(HistoryArgs),
    List(ListArgs),
    Show(ConversationIdArgs),
    Clear(ConversationIdArgs),
    Delete(ConversationIdArgs),
    Stats,
    Sweep,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
pub struct AddMessageArgs {
    #[arg(long)]
    conversation_id: String,
    #[arg(long)]
    role: RoleArg,
    #[arg(long)]
    content: String,
    #[arg(long)]
    metadata_json: Option<String>,
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    conversation_id: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    include_inactive: bool,
}

#[derive(Debug, Args)]
pub struct ConversationIdArgs {
    #[arg(long)]
    conversation_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    User,
    Assistant,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Classify {
        #[arg(long)]
        prompt: String,
    },
    /// Shows the prompt text that enters the response cache key.
    Normalize {
        #[arg(long)]
        prompt: String,
        /// One of `trim_lowercase`, `exact` or `collapsed`; defaults to the
        /// configured mode.
        #[arg(long)]
        mode: Option<String>,
    },
    Fingerprint {
        #[arg(long)]
        snapshot_json: String,
    },
    Similarity {
        #[arg(long)]
        left_json: String,
        #[arg(long)]
        right_json: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Serialize)]
struct Classification<'a> {
    prompt: &'a str,
    cacheable: bool,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when settings are invalid, a store cannot be opened, or
/// the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    tracing::debug!(command = ?cli.command, "dispatching command");

    match cli.command {
        Command::Context { command } => {
            let store = SqliteContextStore::open(&cli.context_db, settings.context)?;
            run_context(*command, &store)
        }
        Command::Conversation { command } => {
            let store = SqliteConversationStore::open(&cli.conversation_db, settings.conversation)?;
            run_conversation(*command, &store)
        }
        Command::Cache { command } => run_cache(*command, &settings.response_cache),
        Command::Config {
            command: ConfigCommand::Show,
        } => print_json(&settings),
    }
}

/// Executes a context command against an open store.
///
/// # Errors
/// Returns an error when argument decoding or the store operation fails.
pub fn run_context(command: ContextCommand, store: &SqliteContextStore) -> Result<()> {
    match command {
        ContextCommand::Store(args) => {
            let content = parse_json_arg("content-json", &args.content_json)?;
            let id = store.try_store(&args.owner, &content, &args.tag)?;
            print_json(&json!({ "id": id }))
        }
        ContextCommand::Retrieve(args) => {
            let results = store.try_retrieve(&args.owner, &args.query, args.limit)?;
            print_json(&results)
        }
        ContextCommand::Search(args) => {
            let results =
                store.try_search(&args.owner, &args.term, args.tag.as_deref(), args.limit)?;
            print_json(&results)
        }
        ContextCommand::Summary(args) => print_json(&store.try_summary(&args.owner)?),
        ContextCommand::Clear(args) => {
            let deleted = store.try_clear(&args.owner)?;
            print_json(&json!({ "owner": args.owner, "deleted": deleted }))
        }
        ContextCommand::Stats => print_json(&store.try_stats()?),
        ContextCommand::Sweep => {
            let deleted = store.try_sweep_expired()?;
            print_json(&json!({ "deleted": deleted }))
        }
    }
}

/// Executes a conversation command against an open store.
///
/// # Errors
/// Returns an error when argument decoding or the store operation fails.
pub fn run_conversation(command: ConversationCommand, store: &SqliteConversationStore) -> Result<()> {
    match command {
        ConversationCommand::Start(args) => {
            let id = store.try_start(&args.owner, args.title.as_deref())?;
            print_json(&json!({ "conversation_id": id }))
        }
        ConversationCommand::Add(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            let metadata = args
                .metadata_json
                .as_deref()
                .map(|raw| parse_json_arg("metadata-json", raw))
                .transpose()?;
            let message_id = store.try_add_message(
                conversation_id,
                map_role(args.role),
                &args.content,
                metadata.as_ref(),
                args.tag.as_deref(),
            )?;
            print_json(&json!({
                "conversation_id": conversation_id,
                "message_id": message_id,
            }))
        }
        ConversationCommand::History(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            print_json(&store.try_history(conversation_id, args.limit)?)
        }
        ConversationCommand::Format(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            let context = store.try_format_as_context(conversation_id, args.limit)?;
            print_json(&json!({ "conversation_id": conversation_id, "context": context }))
        }
        ConversationCommand::List(args) => {
            print_json(&store.try_list(&args.owner, args.include_inactive)?)
        }
        ConversationCommand::Show(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            let record = store
                .try_get(conversation_id)?
                .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;
            print_json(&record)
        }
        ConversationCommand::Clear(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            let cleared = store.try_clear(conversation_id)?;
            print_json(&json!({ "conversation_id": conversation_id, "cleared": cleared }))
        }
        ConversationCommand::Delete(args) => {
            let conversation_id = parse_conversation_id(&args.conversation_id)?;
            let deleted = store.try_delete(conversation_id)?;
            print_json(&json!({ "conversation_id": conversation_id, "deleted": deleted }))
        }
        ConversationCommand::Stats => print_json(&store.try_stats()?),
        ConversationCommand::Sweep => {
            let deleted = store.try_sweep_expired()?;
            print_json(&json!({ "deleted": deleted }))
        }
    }
}

fn run_cache(command: CacheCommand, settings: &ResponseCacheSettings) -> Result<()> {
    match command {
        CacheCommand::Classify { prompt } => {
            let classifier = PromptClassifier::standard()?;
            print_json(&Classification {
                prompt: &prompt,
                cacheable: classifier.is_cacheable(&prompt),
            })
        }
        CacheCommand::Normalize { prompt, mode } => {
            let mode = match mode.as_deref() {
                Some(raw) => PromptNormalization::parse(raw)
                    .ok_or_else(|| anyhow!("unknown normalization mode {raw}"))?,
                None => settings.normalization,
            };
            print_json(&json!({
                "mode": mode.as_str(),
                "normalized": mode.apply(&prompt),
            }))
        }
        CacheCommand::Fingerprint { snapshot_json } => {
            let snapshot = parse_json_arg("snapshot-json", &snapshot_json)?;
            print_json(&fingerprint(&snapshot))
        }
        CacheCommand::Similarity {
            left_json,
            right_json,
        } => {
            let left = fingerprint(&parse_json_arg("left-json", &left_json)?);
            let right = fingerprint(&parse_json_arg("right-json", &right_json)?);
            print_json(&json!({
                "left": left,
                "right": right,
                "similarity": similarity(&left, &right),
            }))
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Ok(Settings::load(path)?),
        None => Ok(Settings::default()),
    }
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{flag} must be valid JSON"))
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId> {
    Ok(raw.parse::<ConversationId>()?)
}

fn map_role(role: RoleArg) -> Role {
    match role {
        RoleArg::User => Role::User,
        RoleArg::Assistant => Role::Assistant,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
