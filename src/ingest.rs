//! Document and URL ingestion.
//!
//! Each input is admitted against the per-session source cap, loaded into
//! text, split into overlapping chunks, embedded, and written to the
//! session's collection. The collection is created on first use (evicting
//! the oldest collection when the process-wide cap is exceeded) and reused
//! afterwards.
//!
//! Load failures skip that source with a warning and the rest continue.
//! A missing or broken embedding configuration aborts the whole operation:
//! nothing is recorded for a source whose chunks were not embedded.

use anyhow::Result;
use uuid::Uuid;

use crate::chunk::{chunk_hash, split_text};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::extract;
use crate::session::Session;
use crate::store::{collection_name, Store, StoredChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Url => "url",
        }
    }
}

/// Classify an input and derive its source name: URLs keep the literal
/// string, files are identified by file name.
pub fn classify(input: &str) -> (SourceKind, String) {
    if input.starts_with("http://") || input.starts_with("https://") {
        (SourceKind::Url, input.to_string())
    } else {
        let name = std::path::Path::new(input)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(input)
            .to_string();
        (SourceKind::File, name)
    }
}

/// What happened to each input of one ingest call.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub added: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub chunks_written: usize,
}

pub async fn ingest_sources(
    config: &Config,
    store: &Store,
    session: &mut Session,
    inputs: &[String],
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    // Built on first need so cap rejections and load failures never require
    // embedding credentials.
    let mut embedder: Option<EmbeddingClient> = None;
    let http = reqwest::Client::new();

    for input in inputs {
        let (kind, name) = classify(input);

        if let Some(collection) = &session.collection {
            if store.has_source(collection, &name).await? {
                tracing::info!(source = %name, "source already ingested, skipping");
                report.already_present.push(name);
                continue;
            }
            if store.source_count(collection).await? >= config.rag.max_sources {
                tracing::warn!(source = %name, "source cap reached, rejecting");
                report.failed.push((
                    name,
                    format!(
                        "Maximum number of documents reached ({}).",
                        config.rag.max_sources
                    ),
                ));
                continue;
            }
        }

        let text = match kind {
            SourceKind::File => extract::load_path(std::path::Path::new(input)),
            SourceKind::Url => extract::fetch_url(&http, input).await,
        };
        let text = match text {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "failed to load source, skipping");
                report.failed.push((name, e.to_string()));
                continue;
            }
        };

        let chunks = split_text(&text, config.rag.chunk_chars, config.rag.overlap_chars);
        if chunks.is_empty() {
            tracing::warn!(source = %name, "source contained no text, skipping");
            report
                .failed
                .push((name, "document contained no text".to_string()));
            continue;
        }

        let vectors = match &embedder {
            Some(e) => e.embed(&chunks).await?,
            None => {
                let e = EmbeddingClient::new(config)?;
                let v = e.embed(&chunks).await?;
                embedder = Some(e);
                v
            }
        };

        // Create the collection on first successful source.
        let collection = match &session.collection {
            Some(c) => c.clone(),
            None => {
                let c = collection_name(&session.id);
                store
                    .create_collection(&c, &session.id, config.rag.max_collections)
                    .await?;
                store.set_collection(session, &c).await?;
                c
            }
        };

        let stored: Vec<StoredChunk> = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, embedding))| StoredChunk {
                id: Uuid::new_v4().to_string(),
                chunk_index: i as i64,
                hash: chunk_hash(&text),
                text,
                embedding,
            })
            .collect();

        report.chunks_written += stored.len();
        store.insert_chunks(&collection, &name, &stored).await?;
        store.add_source(&collection, &name, kind.as_str()).await?;
        tracing::info!(source = %name, chunks = stored.len(), "source ingested");
        report.added.push(name);
    }

    Ok(report)
}
