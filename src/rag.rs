//! Retrieval-augmented conversational answers.
//!
//! Embeds the latest question, scores every chunk in the session's
//! collection by cosine similarity, and grounds the model on the top-k
//! chunk texts plus the full conversation. Retrieval always returns its
//! configured top-k regardless of match quality; there is no re-ranking or
//! relevance threshold.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{cosine_similarity, EmbeddingClient};
use crate::llm::ChatModel;
use crate::prompts;
use crate::session::{ChatMessage, Session};
use crate::store::{EmbeddedChunk, Store};

pub const NO_DOCUMENTS_MSG: &str =
    "No documents have been ingested yet. Add a file or URL first.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Answer the latest question in `history` grounded on retrieved chunks,
/// forwarding tokens to `on_token` as they arrive.
pub async fn answer_with_documents(
    config: &Config,
    store: &Store,
    session: &Session,
    model: &dyn ChatModel,
    embedder: &EmbeddingClient,
    history: &[ChatMessage],
    on_token: &mut (dyn FnMut(&str) + Send),
) -> Result<String> {
    let Some(collection) = &session.collection else {
        bail!(NO_DOCUMENTS_MSG);
    };

    let question = history
        .last()
        .map(|m| m.content.clone())
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Empty question"))?;

    let query_vec = embedder.embed_query(&question).await?;
    let chunks = store.load_embedded_chunks(collection).await?;
    let context = top_k_context(&chunks, &query_vec, config.rag.top_k);

    let mut messages = vec![ChatMessage::system(prompts::rag_system(&context))];
    messages.extend_from_slice(history);

    model.complete_stream(&messages, on_token).await
}

/// Join the `k` highest-scoring chunk texts with the context separator.
pub fn top_k_context(chunks: &[EmbeddedChunk], query_vec: &[f32], k: usize) -> String {
    let mut scored: Vec<(&EmbeddedChunk, f32)> = chunks
        .iter()
        .map(|chunk| (chunk, cosine_similarity(&chunk.embedding, query_vec)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    scored
        .iter()
        .take(k)
        .map(|(chunk, _)| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}
