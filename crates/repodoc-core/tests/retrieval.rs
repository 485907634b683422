//! Building, reusing and querying persisted retrieval indexes.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use repodoc_config::AppConfig;
use repodoc_core::retrieval::{ChatSession, IndexOrigin, RetrievalError};
use repodoc_core::{IndexStore, ModelHub, RetrievalIndex, RetrievalSettings};
use repodoc_test_utils::config::TestConfigBuilder;
use repodoc_test_utils::embedder::HashEmbedder;
use repodoc_test_utils::snapshot::TestSnapshot;
use tempfile::TempDir;

const MODEL: &str = "stub";

fn config() -> AppConfig {
    TestConfigBuilder::new()
        .stub_model(MODEL)
        .chunking(64, 8)
        .top_k(2)
        .fast_retry(2)
        .build()
}

fn docs() -> TestSnapshot {
    TestSnapshot::new()
        .file("cooking.md", "Bake the apple pie for forty minutes until golden.")
        .file("physics.txt", "Quantum tunnelling lets particles cross a barrier.")
        .file("notes/garden.md", "Water the tomato plants every morning.")
        .file("image.png", "not indexed")
}

fn hub(embedder: Arc<HashEmbedder>) -> Arc<ModelHub> {
    let config = config();
    let model = config.model(MODEL).unwrap().clone();
    Arc::new(ModelHub::new().with_model(model, embedder))
}

fn settings() -> RetrievalSettings {
    RetrievalSettings::from_config(&config())
}

#[test_log::test(tokio::test)]
async fn test_second_open_reuses_persisted_index() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new());
    let store = Arc::new(IndexStore::new(store_dir.path()));

    let (index, origin) =
        RetrievalIndex::open(hub(embedder.clone()), store.clone(), folder.path(), MODEL, settings())
            .await
            .unwrap();
    assert_eq!(origin, IndexOrigin::Built);
    assert_eq!(index.index().len(), 3);
    let calls_after_build = embedder.embed_calls();
    assert!(calls_after_build > 0);

    // A fresh store over the same root, as a new session would have.
    let store = Arc::new(IndexStore::new(store_dir.path()));
    let (reused, origin) =
        RetrievalIndex::open(hub(embedder.clone()), store, folder.path(), MODEL, settings())
            .await
            .unwrap();
    assert_eq!(origin, IndexOrigin::Reused);
    assert_eq!(embedder.embed_calls(), calls_after_build);
    assert_eq!(reused.index().entries, index.index().entries);
}

#[tokio::test]
async fn test_concurrent_opens_build_once() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new().with_delay(Duration::from_millis(100)));
    let store = Arc::new(IndexStore::new(store_dir.path()));

    let (a, b) = tokio::join!(
        RetrievalIndex::open(hub(embedder.clone()), store.clone(), folder.path(), MODEL, settings()),
        RetrievalIndex::open(hub(embedder.clone()), store.clone(), folder.path(), MODEL, settings()),
    );
    let mut origins = vec![a.unwrap().1, b.unwrap().1];
    origins.sort_by_key(|o| *o == IndexOrigin::Reused);
    assert_eq!(origins, vec![IndexOrigin::Built, IndexOrigin::Reused]);
    assert_eq!(embedder.embedded_texts(), 3);
}

#[tokio::test]
async fn test_separate_stores_share_one_build() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new().with_delay(Duration::from_millis(200)));
    let first = Arc::new(IndexStore::new(store_dir.path()));
    let second = Arc::new(IndexStore::new(store_dir.path()));

    let (a, b) = tokio::join!(
        RetrievalIndex::open(hub(embedder.clone()), first, folder.path(), MODEL, settings()),
        RetrievalIndex::open(hub(embedder.clone()), second, folder.path(), MODEL, settings()),
    );
    let built = [a.unwrap().1, b.unwrap().1]
        .into_iter()
        .filter(|o| *o == IndexOrigin::Built)
        .count();
    assert_eq!(built, 1);
    assert_eq!(embedder.embedded_texts(), 3);
}

#[tokio::test]
async fn test_build_longer_than_wait_timeout_is_not_repeated() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new().with_delay(Duration::from_millis(2500)));
    let first = Arc::new(IndexStore::new(store_dir.path()));
    let second = Arc::new(IndexStore::new(store_dir.path()));
    let mut settings = settings();
    settings.build_wait_timeout = Duration::from_secs(1);

    let (a, b) = tokio::join!(
        RetrievalIndex::open(hub(embedder.clone()), first, folder.path(), MODEL, settings.clone()),
        RetrievalIndex::open(hub(embedder.clone()), second, folder.path(), MODEL, settings),
    );
    let mut built = 0;
    for outcome in [a, b] {
        match outcome {
            Ok((_, IndexOrigin::Built)) => built += 1,
            Ok((_, IndexOrigin::Reused)) => {}
            Err(RetrievalError::LockTimeout(_)) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(built, 1);
    assert_eq!(embedder.embedded_texts(), 3);
}

#[tokio::test]
async fn test_failed_build_persists_nothing() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new());
    embedder.fail_next(100);
    let store = Arc::new(IndexStore::new(store_dir.path()));

    let err = RetrievalIndex::open(hub(embedder.clone()), store.clone(), folder.path(), MODEL, settings())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Provider(_)), "{err}");

    let canonical = std::fs::canonicalize(folder.path()).unwrap();
    let key = store.key(&canonical, MODEL);
    assert!(!store.exists(&key));
    assert!(!store.marker_path(&key).exists());

    embedder.fail_next(0);
    let (_, origin) = RetrievalIndex::open(hub(embedder), store, folder.path(), MODEL, settings())
        .await
        .unwrap();
    assert_eq!(origin, IndexOrigin::Built);
}

#[tokio::test]
async fn test_transient_embed_failure_is_retried() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new());
    embedder.fail_next(1);
    let store = Arc::new(IndexStore::new(store_dir.path()));

    let (_, origin) = RetrievalIndex::open(hub(embedder.clone()), store, folder.path(), MODEL, settings())
        .await
        .unwrap();
    assert_eq!(origin, IndexOrigin::Built);
    assert_eq!(embedder.embedded_texts(), 3);
}

#[tokio::test]
async fn test_query_is_deterministic_and_cites_sources() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new().with_reply("Forty minutes."));
    let store = Arc::new(IndexStore::new(store_dir.path()));
    let (index, _) = RetrievalIndex::open(hub(embedder.clone()), store, folder.path(), MODEL, settings())
        .await
        .unwrap();

    let first = index.query("how long to bake the apple pie").await.unwrap();
    let second = index.query("how long to bake the apple pie").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.text, "Forty minutes.");
    assert_eq!(first.sources[0].path, "cooking.md");

    let prompt = embedder.chat_requests()[0].messages[0].content.clone().unwrap();
    assert!(prompt.contains("apple pie for forty minutes"));
    assert!(prompt.contains("how long to bake the apple pie"));
}

#[tokio::test]
async fn test_empty_folder_is_rejected() {
    let folder = TestSnapshot::new().file("image.png", "binary");
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(IndexStore::new(store_dir.path()));
    let err = RetrievalIndex::open(
        hub(Arc::new(HashEmbedder::new())),
        store,
        folder.path(),
        MODEL,
        settings(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RetrievalError::NoDocuments(_)));
}

#[tokio::test]
async fn test_chat_session_over_index() {
    let folder = docs();
    let store_dir = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new().with_reply("Every morning."));
    let store = Arc::new(IndexStore::new(store_dir.path()));
    let (index, _) = RetrievalIndex::open(hub(embedder), store, folder.path(), MODEL, settings())
        .await
        .unwrap();

    let session = ChatSession::new(index);
    let input: &[u8] = b"when do I water the tomatoes\n\nquit\n";
    let mut output = Vec::new();
    let answered = session.run(input, &mut output).await.unwrap();
    assert_eq!(answered, 1);

    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("Every morning."));
    assert!(text.contains("notes/garden.md"));
    assert!(text.contains("Please enter a query"));
}
