//! Opening, building and querying a retrieval index.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::llm::{ChatMessage, LlmError, ModelHub, with_retry};

use super::chunk::{Chunk, chunk_text};
use super::context::ContextWindow;
use super::index::{IndexEntry, IndexMeta, SCHEMA_VERSION, ScoredChunk, VectorIndex};
use super::lock::{BuildMarker, STALE_AFTER};
use super::source::collect_documents;
use super::store::{IndexKey, IndexStore, StoreError};
use super::{RetrievalError, RetrievalSettings};

/// Longest source snippet shown with an answer, in characters.
pub const SNIPPET_CHARS: usize = 240;

/// Whether [`RetrievalIndex::open`] built the index or found it on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Built,
    Reused,
}

/// A document an answer drew on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSource {
    pub path: String,
    pub snippet: String,
}

/// Answer to one question, with its sources in rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<AnswerSource>,
}

impl Answer {
    pub fn render(&self) -> String {
        let mut out = self.text.trim().to_string();
        if !self.sources.is_empty() {
            out.push_str("\n\nSources:");
            for source in &self.sources {
                out.push_str(&format!("\n- {}: {}", source.path, source.snippet));
            }
        }
        out
    }
}

/// QA prompt wrapping the retrieved context and the question.
pub fn qa_prompt(context: &str, question: &str) -> String {
    format!(
        "You are a senior software engineer. Answer the question using only the context \
         below. If the context does not contain the answer, say that you don't know.\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Answer:\n"
    )
}

/// A loaded vector index bound to the model that answers questions over it.
pub struct RetrievalIndex {
    hub: Arc<ModelHub>,
    store: Arc<IndexStore>,
    key: IndexKey,
    index: VectorIndex,
    settings: RetrievalSettings,
}

impl std::fmt::Debug for RetrievalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalIndex")
            .field("key", &self.key)
            .field("entries", &self.index.len())
            .finish()
    }
}

impl RetrievalIndex {
    /// Load the index of (`folder`, `model`) from `store`, building and
    /// persisting it first if there is none.
    ///
    /// Concurrent callers for the same key build at most once; the others
    /// wait and then reuse the result.
    pub async fn open(
        hub: Arc<ModelHub>,
        store: Arc<IndexStore>,
        folder: &Path,
        model: &str,
        settings: RetrievalSettings,
    ) -> Result<(Self, IndexOrigin), RetrievalError> {
        settings.validate()?;
        if !hub.contains(model) {
            return Err(RetrievalError::Fatal(LlmError::UnknownModel(model.to_string())));
        }
        let folder = tokio::fs::canonicalize(folder).await.map_err(|e| {
            RetrievalError::Validation(format!("document folder {}: {e}", folder.display()))
        })?;
        if !folder.is_dir() {
            return Err(RetrievalError::Validation(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let key = store.key(&folder, model);
        let lock = store.lock(&key);
        let _guard = lock.lock().await;

        if let Some(index) = store.load(&key).await? {
            info!(index = %key.dir.display(), entries = index.len(), "reusing persisted index");
            return Ok((Self::assemble(hub, store, key, index, settings), IndexOrigin::Reused));
        }

        let _marker = BuildMarker::acquire(
            &store.marker_path(&key),
            settings.build_wait_timeout,
            STALE_AFTER,
        )
        .await?;
        // Another process may have finished a build while we waited.
        if let Some(index) = store.load(&key).await? {
            info!(index = %key.dir.display(), "index built by another session, reusing it");
            return Ok((Self::assemble(hub, store, key, index, settings), IndexOrigin::Reused));
        }

        let index = build_index(&hub, &folder, model, &settings).await?;
        store.save(&key, &index).await?;
        Ok((Self::assemble(hub, store, key, index, settings), IndexOrigin::Built))
    }

    fn assemble(
        hub: Arc<ModelHub>,
        store: Arc<IndexStore>,
        key: IndexKey,
        index: VectorIndex,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            hub,
            store,
            key,
            index,
            settings,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    /// Delete the persisted index; the next `open` rebuilds it.
    pub async fn invalidate(&self) -> Result<bool, RetrievalError> {
        let lock = self.store.lock(&self.key);
        let _guard = lock.lock().await;
        Ok(self.store.remove(&self.key).await?)
    }

    /// The chunks most similar to `question`, best first.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk<'_>>, RetrievalError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RetrievalError::Validation("question is empty".to_string()));
        }
        let hub = self.hub.as_ref();
        let model = self.key.model.as_str();
        let texts = [question.to_string()];
        let mut vectors = with_retry(&self.settings.retry, "embed", || hub.embed(model, &texts))
            .await
            .map_err(RetrievalError::from_llm)?;
        let query = vectors.pop().ok_or_else(|| {
            RetrievalError::Provider(LlmError::Parse("no embedding returned".to_string()))
        })?;
        Ok(self.index.top_k(&query, self.settings.top_k))
    }

    /// Answer `question` from the retrieved context.
    pub async fn query(&self, question: &str) -> Result<Answer, RetrievalError> {
        let hits = self.retrieve(question).await?;
        let mut window = ContextWindow::new(self.settings.context_budget_chars);
        let packed = window.pack(&hits);
        debug!(
            retrieved = hits.len(),
            packed,
            context_chars = window.used(),
            "context assembled"
        );

        let hub = self.hub.as_ref();
        let model = self.key.model.as_str();
        let messages = [ChatMessage::user(qa_prompt(&window.assemble(), question.trim()))];
        let reply = with_retry(&self.settings.retry, "complete", || {
            hub.complete(model, &messages, &[])
        })
        .await
        .map_err(RetrievalError::from_llm)?;

        let mut sources: Vec<AnswerSource> = Vec::new();
        for item in window.items() {
            if sources.iter().any(|s| s.path == item.source) {
                continue;
            }
            sources.push(AnswerSource {
                path: item.source.clone(),
                snippet: snippet(&item.text),
            });
        }
        Ok(Answer {
            text: reply.content.unwrap_or_default(),
            sources,
        })
    }
}

async fn build_index(
    hub: &Arc<ModelHub>,
    folder: &Path,
    model: &str,
    settings: &RetrievalSettings,
) -> Result<VectorIndex, RetrievalError> {
    let filter = Arc::clone(&settings.filter);
    let dir = folder.to_path_buf();
    let documents = tokio::task::spawn_blocking(move || collect_documents(&dir, filter.as_ref()))
        .await?
        .map_err(StoreError::from)?;

    let mut chunks: Vec<(Chunk, usize)> = Vec::new();
    for (file_order, document) in documents.iter().enumerate() {
        for chunk in chunk_text(
            &document.path,
            &document.text,
            settings.chunk_size,
            settings.chunk_overlap,
        ) {
            chunks.push((chunk, file_order));
        }
    }
    if chunks.is_empty() {
        return Err(RetrievalError::NoDocuments(folder.to_path_buf()));
    }
    info!(
        folder = %folder.display(),
        model,
        documents = documents.len(),
        chunks = chunks.len(),
        "building index"
    );

    let texts: Vec<String> = chunks.iter().map(|(c, _)| c.text.clone()).collect();
    let vectors = embed_all(hub, model, texts, settings).await?;

    let dims = vectors.first().map(Vec::len).unwrap_or(0);
    if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
        return Err(RetrievalError::Provider(LlmError::Parse(
            "embeddings have inconsistent dimensions".to_string(),
        )));
    }

    let entries = chunks
        .into_iter()
        .zip(vectors)
        .map(|((chunk, file_order), vector)| IndexEntry {
            chunk,
            file_order,
            vector,
        })
        .collect();
    Ok(VectorIndex {
        meta: IndexMeta {
            folder: folder.to_path_buf(),
            model: model.to_string(),
            built_at: Utc::now(),
            dims,
            chunk_size: settings.chunk_size,
            chunk_overlap: settings.chunk_overlap,
            schema_version: SCHEMA_VERSION,
        },
        entries,
    })
}

/// Embed `texts` in batches, at most `embed_concurrency` requests in flight.
///
/// Every batch is joined before returning; the first failure aborts the rest.
async fn embed_all(
    hub: &Arc<ModelHub>,
    model: &str,
    texts: Vec<String>,
    settings: &RetrievalSettings,
) -> Result<Vec<Vec<f32>>, RetrievalError> {
    let expected = texts.len();
    let batches: Vec<Vec<String>> = texts
        .chunks(settings.embed_batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect();
    let semaphore = Arc::new(Semaphore::new(settings.embed_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (n, batch) in batches.iter().cloned().enumerate() {
        let hub = Arc::clone(hub);
        let model = model.to_string();
        let policy = settings.retry;
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire().await;
            let result = with_retry(&policy, "embed", || hub.embed(&model, &batch)).await;
            (n, result)
        });
    }

    let mut slots: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];
    while let Some(joined) = tasks.join_next().await {
        let (n, result) = joined?;
        match result {
            Ok(vectors) => slots[n] = Some(vectors),
            Err(err) => {
                tasks.abort_all();
                return Err(RetrievalError::from_llm(err));
            }
        }
    }

    let mut vectors = Vec::with_capacity(expected);
    for slot in slots {
        vectors.extend(slot.unwrap_or_default());
    }
    if vectors.len() != expected {
        return Err(RetrievalError::Provider(LlmError::Parse(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        ))));
    }
    Ok(vectors)
}

fn snippet(text: &str) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() > SNIPPET_CHARS {
        let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
        format!("{cut}…")
    } else {
        flat
    }
}
