//! # SQL Copilot CLI (`sqlcop`)
//!
//! The `sqlcop` binary drives the full flow: restore a backup, inspect its
//! schema, ask questions against it, ingest documents for retrieval chat,
//! and serve the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! sqlcop --config ./config/sqlcop.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sqlcop init` | Create the SQLite state database |
//! | `sqlcop restore <file.bak>` | Restore a backup, set the session's database |
//! | `sqlcop schema` | Print the current database's schema summary |
//! | `sqlcop ask "<question>"` | Answer a question via generated T-SQL |
//! | `sqlcop ingest <path-or-url>...` | Add documents/URLs to the vector index |
//! | `sqlcop sources` | List ingested sources |
//! | `sqlcop chat "<question>"` | Retrieval-augmented answer over documents |
//! | `sqlcop reset` | Start a fresh session |
//! | `sqlcop serve` | Start the HTTP JSON API |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use sql_copilot::answer;
use sql_copilot::config;
use sql_copilot::embedding::EmbeddingClient;
use sql_copilot::ingest;
use sql_copilot::llm::{AzureChatModel, ChatModel};
use sql_copilot::mssql::{MssqlExecutor, QueryExecutor};
use sql_copilot::rag;
use sql_copilot::restore;
use sql_copilot::schema::{self, SchemaSummary};
use sql_copilot::server;
use sql_copilot::session::Role;
use sql_copilot::store::Store;

/// SQL Copilot — chat with a restored SQL Server database.
#[derive(Parser)]
#[command(
    name = "sqlcop",
    about = "SQL Copilot — chat with a restored SQL Server database",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sqlcop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database.
    ///
    /// Creates the SQLite file and all required tables. Idempotent.
    Init,

    /// Restore a SQL Server backup and make it the session's database.
    Restore {
        /// Path to the `.bak` backup file.
        file: PathBuf,
    },

    /// Print the schema summary of the current database.
    Schema,

    /// Answer a question about the current database via generated T-SQL.
    Ask {
        /// The natural-language question.
        question: String,
    },

    /// Ingest documents or URLs into the session's vector index.
    Ingest {
        /// File paths or http(s) URLs.
        inputs: Vec<String>,
    },

    /// List ingested sources for the session.
    Sources,

    /// Retrieval-augmented chat over ingested documents.
    Chat {
        /// The natural-language question.
        question: String,
    },

    /// Discard the session: history, current database, and sources.
    Reset,

    /// Start the HTTP JSON API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            println!("State database initialized successfully.");
            store.close().await;
        }

        Commands::Restore { file } => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let mut session = store.load_or_create_session().await?;

            let outcome = restore::restore_backup_file(&cfg, &file).await?;
            store.set_current_db(&mut session, &outcome.database).await?;

            println!(
                "Restored {} as {}",
                file.display(),
                outcome.database
            );
            store.close().await;
        }

        Commands::Schema => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let session = store.load_or_create_session().await?;

            match schema::summarize(&cfg.mssql, session.current_db.as_deref()).await? {
                SchemaSummary::Tables(text) => println!("{}", text),
                SchemaSummary::NoDatabase => println!("{}", answer::NO_DATABASE_MSG),
                SchemaSummary::NoTables => println!("{}", answer::EMPTY_SCHEMA_MSG),
            }
            store.close().await;
        }

        Commands::Ask { question } => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let session = store.load_or_create_session().await?;

            store.append_turn(&session.id, Role::User, &question).await?;
            let history = store.turns(&session.id).await?;

            let summary = schema::summarize(&cfg.mssql, session.current_db.as_deref()).await?;
            let model = AzureChatModel::new(&cfg.model)?;
            let executor = MssqlExecutor::new(cfg.mssql.clone());

            let db_answer = answer::answer_db_question(
                &model as &dyn ChatModel,
                &executor as &dyn QueryExecutor,
                session.current_db.as_deref(),
                &summary,
                &history,
                cfg.model.max_result_rows,
            )
            .await?;

            store
                .append_turn(&session.id, Role::Assistant, db_answer.text())
                .await?;
            println!("{}", db_answer.text());
            store.close().await;
        }

        Commands::Ingest { inputs } => {
            if inputs.is_empty() {
                anyhow::bail!("Nothing to ingest: pass at least one file path or URL.");
            }

            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let mut session = store.load_or_create_session().await?;

            let report = ingest::ingest_sources(&cfg, &store, &mut session, &inputs).await?;

            for name in &report.added {
                println!("added: {}", name);
            }
            for name in &report.already_present {
                println!("already present: {}", name);
            }
            for (name, reason) in &report.failed {
                println!("failed: {} ({})", name, reason);
            }
            println!("chunks written: {}", report.chunks_written);
            store.close().await;
        }

        Commands::Sources => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let session = store.load_or_create_session().await?;

            match &session.collection {
                Some(collection) => {
                    let sources = store.sources(collection).await?;
                    if sources.is_empty() {
                        println!("No sources ingested.");
                    } else {
                        println!("{:<48} KIND", "SOURCE");
                        for (name, kind) in sources {
                            println!("{:<48} {}", name, kind);
                        }
                    }
                }
                None => println!("No sources ingested."),
            }
            store.close().await;
        }

        Commands::Chat { question } => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let session = store.load_or_create_session().await?;

            let model = AzureChatModel::new(&cfg.model)?;
            let embedder = EmbeddingClient::new(&cfg)?;

            store.append_turn(&session.id, Role::User, &question).await?;
            let history = store.turns(&session.id).await?;

            let mut stdout = std::io::stdout();
            let mut on_token = move |token: &str| {
                let _ = stdout.write_all(token.as_bytes());
                let _ = stdout.flush();
            };

            let response = rag::answer_with_documents(
                &cfg,
                &store,
                &session,
                &model as &dyn ChatModel,
                &embedder,
                &history,
                &mut on_token,
            )
            .await?;
            println!();

            store
                .append_turn(&session.id, Role::Assistant, &response)
                .await?;
            store.close().await;
        }

        Commands::Reset => {
            let store = Store::connect(&cfg).await?;
            store.migrate().await?;
            let session = store.load_or_create_session().await?;
            store.reset_session(session).await?;
            println!("Session reset.");
            store.close().await;
        }

        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
