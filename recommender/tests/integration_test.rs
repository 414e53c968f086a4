//! Integration tests for the recommender service.
//!
//! These tests verify that the service:
//! - Ranks recipes by ingredient overlap with the pantry
//! - Reuses a user's pantry embedding while the pantry is unchanged
//! - Reuses the asset cache across restarts and rebuilds when it is stale
//! - Reports provider failures instead of returning empty results

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use pantry_embeddings::{Embedding, EmbeddingError, EmbeddingProvider, HashingProvider};
use pantry_recommender::query_cache::fingerprint;
use pantry_recommender::{
    CorpusConfig, CorpusLoader, RecommenderConfig, RecommenderError, RecommenderService,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const PANCAKES_AND_CAKE: &str = r#"[
    {"RecipeId": "p1", "Name": "Blueberry Pancakes", "RecipeIngredientParts": "blueberry flour sugar"},
    {"RecipeId": "c1", "Name": "Lemon Cake", "RecipeIngredientParts": "lemon sugar flour"}
]"#;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

fn pantry(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Hashing provider that counts calls and can be switched into failure.
struct CountingProvider {
    inner: HashingProvider,
    version: String,
    calls: AtomicUsize,
    failing: AtomicBool,

    /// Drop the last component of single-text embeddings.
    truncating: AtomicBool,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Self::with_version("counting-v1")
    }

    fn with_version(version: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: HashingProvider::new(128),
            version: version.to_string(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            truncating: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn truncate(&self) {
        self.truncating.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> pantry_embeddings::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::ApiRequest("provider down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> pantry_embeddings::Result<Embedding> {
        self.check()?;
        let mut embedding = self.inner.embed(text).await?;
        if self.truncating.load(Ordering::SeqCst) {
            embedding.pop();
        }
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> pantry_embeddings::Result<Vec<Embedding>> {
        self.check()?;
        self.inner.embed_batch(texts).await
    }
}

fn write_corpus(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("recipes.json");
    std::fs::write(&path, content).unwrap();
    path
}

fn config(dir: &Path, corpus: PathBuf) -> RecommenderConfig {
    let mut config = RecommenderConfig::new(corpus);
    config.cache.asset_path = Some(dir.join("cache").join("assets.bin"));
    config
}

async fn start(config: &RecommenderConfig, provider: &Arc<CountingProvider>) -> RecommenderService {
    RecommenderService::start(config.clone(), provider.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_blueberries_rank_pancakes_above_cake() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let service = start(&config(temp_dir.path(), corpus), &CountingProvider::new()).await;

    let results = service
        .recommend(&pantry(&["blueberries", "sugar"]), 2, None)
        .await
        .unwrap();

    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Blueberry Pancakes", "Lemon Cake"]);
    assert!(results[0].similarity > results[1].similarity);
}

#[tokio::test]
async fn test_result_count_is_bounded_by_corpus() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(temp_dir.path(), fixtures_dir().join("recipes.csv"));
    config.cache.asset_path = None;
    let service = start(&config, &CountingProvider::new()).await;

    let items = pantry(&["eggs", "flour"]);
    assert_eq!(service.recommend(&items, 2, None).await.unwrap().len(), 2);
    assert_eq!(service.recommend(&items, 6, None).await.unwrap().len(), 6);
    assert_eq!(service.recommend(&items, 50, None).await.unwrap().len(), 6);

    let stats = service.stats();
    assert_eq!(stats.recipes, 6);
    assert!(!stats.loaded_from_cache);
}

#[tokio::test]
async fn test_fixture_recipes_match_their_ingredients() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(temp_dir.path(), fixtures_dir().join("recipes.csv"));
    config.cache.asset_path = None;
    let service = start(&config, &CountingProvider::new()).await;

    let results = service
        .recommend(&pantry(&["black beans", "tortillas", "lime"]), 1, None)
        .await
        .unwrap();
    assert_eq!(results[0].id, "106");
    assert_eq!(results[0].name, "Black Bean Tacos");

    let results = service
        .recommend(&pantry(&["banana", "butter"]), 1, None)
        .await
        .unwrap();
    assert_eq!(results[0].name, "Banana Bread");
}

#[tokio::test]
async fn test_repeated_request_is_idempotent_and_cached() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let items = pantry(&["blueberries", "sugar"]);

    let before = provider.calls();
    let first = service.recommend(&items, 2, Some("u1")).await.unwrap();
    let second = service.recommend(&items, 2, Some("u1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(provider.calls(), before + 1);
}

#[tokio::test]
async fn test_user_slot_is_overwritten_by_new_pantry() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let x = pantry(&["blueberries", "sugar"]);
    let y = pantry(&["lemon"]);
    let base = provider.calls();

    service.recommend(&x, 1, Some("u1")).await.unwrap();
    assert_eq!(provider.calls(), base + 1);

    service.recommend(&x, 1, Some("u1")).await.unwrap();
    assert_eq!(provider.calls(), base + 1);

    let results = service.recommend(&y, 1, Some("u1")).await.unwrap();
    assert_eq!(provider.calls(), base + 2);
    assert_eq!(results[0].name, "Lemon Cake");
    assert_eq!(
        service.query_cache().cached_fingerprint("u1").await,
        Some(fingerprint(&y))
    );

    // Going back to X is a miss again: only the latest pantry is kept.
    service.recommend(&x, 1, Some("u1")).await.unwrap();
    assert_eq!(provider.calls(), base + 3);
}

#[tokio::test]
async fn test_anonymous_requests_are_not_cached() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let items = pantry(&["sugar"]);
    let base = provider.calls();

    service.recommend(&items, 1, None).await.unwrap();
    service.recommend(&items, 1, None).await.unwrap();

    assert_eq!(provider.calls(), base + 2);
    assert!(service.query_cache().is_empty());
}

#[tokio::test]
async fn test_top_n_zero_is_invalid() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let base = provider.calls();

    let err = service
        .recommend(&pantry(&["sugar"]), 0, Some("u1"))
        .await
        .unwrap_err();

    assert!(matches!(err, RecommenderError::InvalidQuery(_)));
    assert_eq!(provider.calls(), base);
}

#[tokio::test]
async fn test_equal_scores_keep_corpus_order() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(
        temp_dir.path(),
        r#"[
            {"RecipeId": "a", "Name": "Rice and Beans", "RecipeIngredientParts": ["rice", "beans"]},
            {"RecipeId": "b", "Name": "Lemon Cake", "RecipeIngredientParts": ["lemon", "sugar"]},
            {"RecipeId": "c", "Name": "Beans and Rice", "RecipeIngredientParts": ["rice", "beans"]},
            {"RecipeId": "d", "Name": "Rice Bowl", "RecipeIngredientParts": ["rice", "beans"]}
        ]"#,
    );
    let service = start(&config(temp_dir.path(), corpus), &CountingProvider::new()).await;

    let results = service
        .recommend(&pantry(&["rice", "beans"]), 3, None)
        .await
        .unwrap();

    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c", "d"]);
    assert_eq!(results[0].similarity, results[1].similarity);
    assert_eq!(results[1].similarity, results[2].similarity);
}

#[tokio::test]
async fn test_restart_reuses_asset_cache() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let config = config(temp_dir.path(), corpus);
    let items = pantry(&["blueberries", "sugar"]);

    let first_provider = CountingProvider::new();
    let first = start(&config, &first_provider).await;
    assert!(first_provider.calls() > 0);
    assert!(!first.stats().loaded_from_cache);
    let expected = first.recommend(&items, 2, None).await.unwrap();

    let second_provider = CountingProvider::new();
    let second = start(&config, &second_provider).await;
    assert_eq!(second_provider.calls(), 0);
    assert!(second.stats().loaded_from_cache);
    assert_eq!(second.stats().corpus_fingerprint, first.stats().corpus_fingerprint);

    let results = second.recommend(&items, 2, None).await.unwrap();
    assert_eq!(results, expected);
}

#[tokio::test]
async fn test_changed_corpus_forces_rebuild() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let config = config(temp_dir.path(), corpus);
    start(&config, &CountingProvider::new()).await;

    write_corpus(
        temp_dir.path(),
        r#"[{"RecipeId": "t1", "Name": "Toast", "RecipeIngredientParts": ["bread", "butter"]}]"#,
    );

    let provider = CountingProvider::new();
    let service = start(&config, &provider).await;
    assert!(provider.calls() > 0);
    assert!(!service.stats().loaded_from_cache);
    assert_eq!(service.stats().recipes, 1);
}

#[tokio::test]
async fn test_changed_model_version_forces_rebuild() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let config = config(temp_dir.path(), corpus);
    start(&config, &CountingProvider::with_version("counting-v1")).await;

    let provider = CountingProvider::with_version("counting-v2");
    let service = start(&config, &provider).await;
    assert!(provider.calls() > 0);
    assert_eq!(service.stats().embedding_model_version, "counting-v2");

    // The rebuilt assets replaced the old cache entry.
    let provider = CountingProvider::with_version("counting-v2");
    start(&config, &provider).await;
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_asset_cache_forces_rebuild() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let config = config(temp_dir.path(), corpus);
    start(&config, &CountingProvider::new()).await;

    let cache_path = config.cache.asset_path.clone().unwrap();
    let mut bytes = std::fs::read(&cache_path).unwrap();
    let len = bytes.len();
    bytes.truncate(len / 2);
    std::fs::write(&cache_path, &bytes).unwrap();

    let provider = CountingProvider::new();
    let service = start(&config, &provider).await;
    assert!(provider.calls() > 0);
    assert!(!service.stats().loaded_from_cache);

    let provider = CountingProvider::new();
    let service = start(&config, &provider).await;
    assert_eq!(provider.calls(), 0);
    assert!(service.stats().loaded_from_cache);
}

#[tokio::test]
async fn test_unwritable_asset_cache_still_serves() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let blocker = temp_dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not a directory").unwrap();

    let mut config = RecommenderConfig::new(corpus);
    config.cache.asset_path = Some(blocker.join("assets.bin"));
    let service = start(&config, &CountingProvider::new()).await;

    let results = service
        .recommend(&pantry(&["lemon"]), 1, None)
        .await
        .unwrap();
    assert_eq!(results[0].name, "Lemon Cake");
}

#[tokio::test]
async fn test_provider_failure_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let cached = pantry(&["lemon"]);

    service.recommend(&cached, 1, Some("u1")).await.unwrap();
    provider.fail();

    let err = service
        .recommend(&pantry(&["blueberries"]), 1, Some("u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RecommenderError::RecommendationUnavailable(_)));
    assert!(!err.is_client_error());

    // The failed request left the previous slot in place.
    let results = service.recommend(&cached, 1, Some("u1")).await.unwrap();
    assert_eq!(results[0].name, "Lemon Cake");
}

#[tokio::test]
async fn test_short_pantry_embedding_is_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    let service = start(&config(temp_dir.path(), corpus), &provider).await;
    let cached = pantry(&["lemon"]);

    service.recommend(&cached, 1, Some("u1")).await.unwrap();
    provider.truncate();

    let err = service
        .recommend(&pantry(&["blueberries"]), 1, Some("u1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RecommenderError::RecommendationUnavailable(EmbeddingError::DimensionMismatch {
            expected: 128,
            actual: 127,
        })
    ));
    assert!(!err.is_client_error());

    // The malformed embedding was not stored in the user's slot.
    assert_eq!(
        service.query_cache().cached_fingerprint("u1").await,
        Some(fingerprint(&cached))
    );
    let results = service.recommend(&cached, 1, Some("u1")).await.unwrap();
    assert_eq!(results[0].name, "Lemon Cake");
}

#[tokio::test]
async fn test_startup_fails_when_provider_is_down() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let provider = CountingProvider::new();
    provider.fail();

    let result = RecommenderService::start(config(temp_dir.path(), corpus), provider).await;
    assert!(matches!(result, Err(RecommenderError::Embedding(_))));
}

#[tokio::test]
async fn test_concurrent_users() {
    let temp_dir = TempDir::new().unwrap();
    let corpus = write_corpus(temp_dir.path(), PANCAKES_AND_CAKE);
    let service = Arc::new(start(&config(temp_dir.path(), corpus), &CountingProvider::new()).await);

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let user = format!("user-{}", i % 4);
            let items = if i % 2 == 0 {
                pantry(&["blueberries", "sugar"])
            } else {
                pantry(&["lemon", "sugar"])
            };
            service.recommend(&items, 1, Some(user.as_str())).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let results = handle.await.unwrap().unwrap();
        let expected = if i % 2 == 0 {
            "Blueberry Pancakes"
        } else {
            "Lemon Cake"
        };
        assert_eq!(results[0].name, expected);
    }
    assert_eq!(service.query_cache().len(), 4);
}

#[tokio::test]
async fn test_sampling_is_reproducible() {
    let config = CorpusConfig::new(fixtures_dir().join("recipes.csv"))
        .with_max_recipes(3)
        .with_sample_seed(7);

    let first = CorpusLoader::new(config.clone()).load().await.unwrap();
    let second = CorpusLoader::new(config).load().await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(first.ids(), second.ids());
    assert_eq!(first.fingerprint(), second.fingerprint());
}
