use scholar_harness::cache::{
    CachedCompletion, CompletionCache, CompletionCacheKey, SqliteCompletionCache,
};
use tempfile::tempdir;

fn key(model: &str, user: &str) -> CompletionCacheKey {
    CompletionCacheKey::new(model, "system", user, 0.0, Some(1024), true, None)
}

fn entry(content: &str) -> CachedCompletion {
    CachedCompletion {
        content: content.to_string(),
        input_tokens: 120,
        output_tokens: 40,
        cost_nanodollars: 9_000,
    }
}

#[tokio::test]
async fn round_trips_a_completion() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();

    let key = key("openai/gpt-4o-mini", "question one");
    assert!(cache.get(&key).await.unwrap().is_none());

    cache.put(&key, &entry("the answer")).await.unwrap();
    let hit = cache.get(&key).await.unwrap().expect("cache hit");
    assert_eq!(hit.content, "the answer");
    assert_eq!(hit.input_tokens, 120);
    assert_eq!(hit.output_tokens, 40);
    assert_eq!(hit.cost_nanodollars, 9_000);
}

#[tokio::test]
async fn different_prompts_do_not_collide() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();

    cache
        .put(&key("m", "prompt a"), &entry("answer a"))
        .await
        .unwrap();
    cache
        .put(&key("m", "prompt b"), &entry("answer b"))
        .await
        .unwrap();

    let a = cache.get(&key("m", "prompt a")).await.unwrap().unwrap();
    let b = cache.get(&key("m", "prompt b")).await.unwrap().unwrap();
    assert_eq!(a.content, "answer a");
    assert_eq!(b.content, "answer b");

    assert!(cache
        .get(&key("other-model", "prompt a"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn put_overwrites_existing_entry() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();

    let key = key("m", "prompt");
    cache.put(&key, &entry("v1")).await.unwrap();
    cache.put(&key, &entry("v2")).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap().unwrap().content, "v2");
}

#[tokio::test]
async fn prune_caps_rows_keeping_most_recently_used() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();

    for i in 0..10 {
        cache
            .put(&key("m", &format!("prompt {i}")), &entry(&format!("v{i}")))
            .await
            .unwrap();
    }

    let stats = cache.prune(None, Some(4)).await.unwrap();
    assert_eq!(stats.deleted, 6);
    assert_eq!(stats.remaining, 4);

    let stats = cache.prune(None, Some(0)).await.unwrap();
    assert_eq!(stats.remaining, 0);
}

#[tokio::test]
async fn export_writes_one_line_per_entry() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();

    cache.put(&key("m", "p1"), &entry("v1")).await.unwrap();
    cache.put(&key("m", "p2"), &entry("v2")).await.unwrap();

    let out = dir.path().join("export.jsonl");
    cache.export_jsonl(&out).await.unwrap();
    let body = std::fs::read_to_string(&out).unwrap();
    assert_eq!(body.lines().count(), 2);
    for line in body.lines() {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(parsed.get("key_hash").is_some());
    }
}
