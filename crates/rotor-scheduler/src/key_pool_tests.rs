use super::*;
use rotor_config::RetryConfig;
use rotor_session::MemoryStateStore;
use rotor_vault::CredentialSource;

fn config(strategy: SelectionStrategy) -> KeyPoolConfig {
    KeyPoolConfig {
        strategy,
        exhaustion_retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 20,
            jitter: 0.0,
        },
        ..KeyPoolConfig::default()
    }
}

fn keys(ids: &[&str]) -> Vec<Credential> {
    ids.iter()
        .map(|id| Credential::new(*id, format!("secret-{id}")))
        .collect()
}

fn pool(strategy: SelectionStrategy, ids: &[&str]) -> KeyPoolManager {
    KeyPoolManager::new(config(strategy), keys(ids), None).unwrap()
}

fn pick(pool: &KeyPoolManager, now: DateTime<Utc>) -> String {
    pool.select_at(now, None).unwrap().id
}

#[test]
fn test_round_robin_cycles_in_order() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b", "c"]);
    let now = Utc::now();
    let picked: Vec<String> = (0..4).map(|_| pick(&pool, now)).collect();
    assert_eq!(picked, vec!["a", "b", "c", "a"]);
}

#[tokio::test]
async fn test_round_robin_skips_rate_limited_until_it_passes() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b"]);
    pool.mark_key_exhausted("a", "429", Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let now = Utc::now();
    for _ in 0..5 {
        assert_eq!(pick(&pool, now), "b");
    }

    let later = now + chrono::Duration::seconds(61);
    let picked: Vec<String> = (0..2).map(|_| pick(&pool, later)).collect();
    assert!(picked.contains(&"a".to_string()));
}

#[tokio::test]
async fn test_daily_window_cap_exhausts_until_midnight() {
    let mut cfg = config(SelectionStrategy::RoundRobin);
    cfg.max_requests_per_key = Some(1);
    let pool = KeyPoolManager::new(cfg, keys(&["a", "b"]), None).unwrap();

    assert_eq!(pick(&pool, Utc::now()), "a");
    pool.record_success("a").await.unwrap();
    assert_eq!(pick(&pool, Utc::now()), "b");
    pool.record_failure("b", "bad answer").await.unwrap();
    let now = Utc::now();

    let err = pool.select_at(now, None).unwrap_err();
    let wait_ms = match classify(&err) {
        Some(RotorError::KeysExhausted { wait_ms, .. }) => wait_ms.unwrap(),
        other => panic!("unexpected error: {other:?}"),
    };
    let expected = (next_utc_midnight(now) - now).num_milliseconds() as u64;
    assert_eq!(wait_ms, expected);

    let tomorrow = next_utc_midnight(now) + chrono::Duration::seconds(1);
    assert_eq!(pick(&pool, tomorrow), "a");
}

#[tokio::test]
async fn test_consecutive_errors_disable_key_until_success() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b"]);
    for _ in 0..3 {
        pool.record_failure("a", "boom").await.unwrap();
    }
    let now = Utc::now();
    for _ in 0..4 {
        assert_eq!(pick(&pool, now), "b");
    }
    assert_eq!(pool.eligible_count(), 1);

    pool.record_success("a").await.unwrap();
    assert_eq!(pool.eligible_count(), 2);
}

#[tokio::test]
async fn test_least_used_spreads_load() {
    let pool = pool(SelectionStrategy::LeastUsed, &["a", "b", "c"]);
    let mut picked = Vec::new();
    for _ in 0..6 {
        let id = pick(&pool, Utc::now());
        pool.record_success(&id).await.unwrap();
        picked.push(id);
    }
    assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn test_selection_alone_charges_no_requests() {
    let mut cfg = config(SelectionStrategy::RoundRobin);
    cfg.max_requests_per_key = Some(1);
    let pool = KeyPoolManager::new(cfg, keys(&["a", "b"]), None).unwrap();

    pool.rotate_key(RotationReason::Manual).await.unwrap();
    pool.rotate_key(RotationReason::Manual).await.unwrap();
    pool.get_next_key().await.unwrap();

    assert_eq!(pool.eligible_count(), 2);
    for status in pool.metrics() {
        assert!(status.eligible, "{} should still be eligible", status.id);
        assert_eq!(status.metrics.total_requests, 0);
        assert_eq!(status.metrics.window_requests, 0);
        assert!(status.metrics.last_used_at.is_none());
    }
}

#[tokio::test]
async fn test_rate_limited_request_is_charged() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b"]);
    pool.record_rate_limited("a", "429", Some(Duration::from_secs(60)))
        .await
        .unwrap();
    pool.mark_key_exhausted("b", "coordinator", None).await.unwrap();

    let status = pool.metrics();
    assert_eq!(status[0].metrics.total_requests, 1);
    assert_eq!(status[0].metrics.rate_limit_count, 1);
    assert!(!status[0].eligible);
    assert_eq!(status[1].metrics.total_requests, 0);
    assert_eq!(status[1].metrics.rate_limit_count, 1);
}

#[tokio::test]
async fn test_lowest_error_rate_avoids_failing_key() {
    let pool = pool(SelectionStrategy::LowestErrorRate, &["a", "b"]);
    let now = Utc::now();
    assert_eq!(pick(&pool, now), "a");
    pool.record_failure("a", "bad answer").await.unwrap();
    assert_eq!(pick(&pool, now), "b");
    assert_eq!(pick(&pool, now), "b");
}

#[test]
fn test_random_only_returns_eligible_keys() {
    let pool = pool(SelectionStrategy::Random, &["a", "b", "c"]);
    pool.lock().entries[1].metrics.healthy = false;
    let now = Utc::now();
    for _ in 0..50 {
        assert_ne!(pick(&pool, now), "b");
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_without_fallback_errors_with_wait() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a"]);
    pool.mark_key_exhausted("a", "429", Some(Duration::from_secs(30)))
        .await
        .unwrap();

    let err = pool.get_next_key().await.unwrap_err();
    match classify(&err) {
        Some(RotorError::KeysExhausted { pool, wait_ms }) => {
            assert_eq!(pool, "primary");
            let wait = wait_ms.unwrap();
            assert!(wait > 25_000 && wait <= 30_000, "wait was {wait}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_falls_back_after_retries() {
    let pool = KeyPoolManager::new(
        config(SelectionStrategy::RoundRobin),
        keys(&["a"]),
        Some(Credential::new("fallback", "secret-fb")),
    )
    .unwrap();
    pool.mark_key_exhausted("a", "429", None).await.unwrap();

    let selection = pool.get_next_key().await.unwrap();
    assert_eq!(selection.source, KeySource::Fallback);
    assert_eq!(selection.credential.id, "fallback");
    assert_eq!(pool.current_key().as_deref(), Some("fallback"));

    pool.record_success("fallback").await.unwrap();
    pool.mark_key_exhausted("fallback", "429", None).await.unwrap();
}

#[tokio::test]
async fn test_rotate_key_moves_off_current() {
    let pool = pool(SelectionStrategy::LowestErrorRate, &["a", "b"]);
    let first = pool.get_next_key().await.unwrap();
    assert_eq!(first.credential.id, "a");

    let rotated = pool.rotate_key(RotationReason::Manual).await.unwrap();
    assert_eq!(rotated.credential.id, "b");
    assert_eq!(rotated.source, KeySource::Primary);
    assert_eq!(pool.current_key().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_rotate_key_reuses_sole_eligible_key() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b"]);
    pool.mark_key_exhausted("b", "429", None).await.unwrap();
    pool.get_next_key().await.unwrap();

    let rotated = pool.rotate_key(RotationReason::Threshold).await.unwrap();
    assert_eq!(rotated.credential.id, "a");
}

struct FakeChecker;

#[async_trait]
impl KeyChecker for FakeChecker {
    async fn check(&self, credential: &Credential) -> Result<bool> {
        match credential.id.as_str() {
            "b" => Ok(false),
            "c" => bail!("connection refused"),
            "d" => {
                std::future::pending::<()>().await;
                Ok(true)
            }
            _ => Ok(true),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_health_checks_mark_unhealthy_keys() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b", "c", "d"]);
    for _ in 0..2 {
        pool.record_failure("a", "flaky").await.unwrap();
    }

    let report = pool.run_health_checks(&FakeChecker).await;
    let healthy: Vec<&str> = report
        .iter()
        .filter(|h| h.healthy)
        .map(|h| h.id.as_str())
        .collect();
    assert_eq!(healthy, vec!["a"]);
    assert_eq!(report[1].error.as_deref(), Some("check rejected key"));
    assert!(report[2].error.as_deref().unwrap().contains("connection refused"));
    assert!(report[3].error.as_deref().unwrap().contains("timed out"));

    assert_eq!(pool.eligible_count(), 1);
    let status = pool.metrics();
    assert_eq!(status[0].metrics.consecutive_errors, 0);
    assert!(!status[3].eligible);
}

#[tokio::test]
async fn test_metrics_persist_and_restore() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let pool = pool(SelectionStrategy::RoundRobin, &["a", "b"])
        .with_state_store(store.clone())
        .await
        .unwrap();
    pool.get_next_key().await.unwrap();
    pool.record_failure("a", "boom").await.unwrap();

    let snapshot = load_pool_snapshot(store.as_ref(), "primary")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.current.as_deref(), Some("a"));
    assert_eq!(snapshot.metrics["a"].failed_requests, 1);

    let restored = KeyPoolManager::new(config(SelectionStrategy::RoundRobin), keys(&["a", "b"]), None)
        .unwrap()
        .with_state_store(store)
        .await
        .unwrap();
    assert_eq!(restored.current_key().as_deref(), Some("a"));
    assert_eq!(restored.metrics()[0].metrics.total_requests, 1);
    assert_eq!(restored.get_next_key().await.unwrap().credential.id, "b");
}

#[tokio::test]
async fn test_unknown_key_is_an_error() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a"]);
    let err = pool.record_success("zzz").await.unwrap_err();
    assert!(err.to_string().contains("zzz"));
}

#[test]
fn test_new_rejects_empty_and_duplicate_pools() {
    let err = KeyPoolManager::new(config(SelectionStrategy::RoundRobin), Vec::new(), None).unwrap_err();
    assert!(matches!(classify(&err), Some(RotorError::InvalidConfig(_))));

    let err = KeyPoolManager::new(config(SelectionStrategy::RoundRobin), keys(&["a", "a"]), None)
        .unwrap_err();
    assert!(err.to_string().contains("twice"));
}

#[test]
fn test_from_bundle_splits_primary_and_fallback() {
    let bundle = CredentialBundle {
        slots: keys(&["fallback", "primary-1", "primary-2"])
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect(),
        source: CredentialSource::Environment,
        loaded_at: Utc::now(),
    };
    let mut cfg = config(SelectionStrategy::RoundRobin);
    cfg.fallback_slot = Some("fallback".to_string());

    let pool = KeyPoolManager::from_bundle(cfg, &bundle).unwrap();
    let ids: Vec<String> = pool.metrics().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["primary-1", "primary-2"]);
    assert_eq!(pool.fallback.as_ref().unwrap().id, "fallback");
}

#[tokio::test]
async fn test_stats_json_never_contains_secrets() {
    let pool = pool(SelectionStrategy::RoundRobin, &["a"]);
    pick(&pool, Utc::now());
    pool.record_success("a").await.unwrap();
    let stats = pool.stats_json();
    assert_eq!(stats["a"]["total_requests"], 1);
    assert!(!stats.to_string().contains("secret-a"));
}
