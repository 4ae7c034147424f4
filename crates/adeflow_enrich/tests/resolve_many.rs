//! End-to-end behaviour of `EnrichmentClient::resolve_many` against scripted lookups.

use adeflow_enrich::{
    CachedValue, DemoLookup, EnrichConfig, EnrichError, EnrichmentClient, Failure, Lookup,
    LookupCache, LookupMode, LookupRecord, RateBudget, Resolution, RetryPolicy,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;

/// Scripted service keyed on prefixes:
/// `missing-*` not found, `flaky-*` fails twice then succeeds,
/// `broken-*` permanent error, `down-*` always transient, anything else found.
#[derive(Default)]
struct ScriptedLookup {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    call_times: Mutex<Vec<Instant>>,
    delay: Duration,
}

impl ScriptedLookup {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lookup for ScriptedLookup {
    fn domain(&self) -> &str {
        "scripted"
    }

    async fn lookup(&self, key: &str) -> Result<Vec<LookupRecord>, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if key.starts_with("missing-") {
            Err(Failure::NotFound)
        } else if key.starts_with("broken-") {
            Err(Failure::Permanent("HTTP 400".into()))
        } else if key.starts_with("down-") {
            Err(Failure::Transient("HTTP 503".into()))
        } else if key.starts_with("flaky-") && attempt <= 2 {
            Err(Failure::Transient("timeout".into()))
        } else {
            Ok(vec![BTreeMap::from([("rxcui".to_string(), format!("id:{}", key))])])
        }
    }
}

fn fast_config(workers: usize) -> EnrichConfig {
    EnrichConfig {
        qps: 10_000.0,
        max_workers: workers,
        retry: RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
    }
}

fn client(
    cache: &Arc<LookupCache>,
    lookup: &Arc<ScriptedLookup>,
    config: EnrichConfig,
) -> EnrichmentClient {
    let budget = Arc::new(RateBudget::with_burst(config.qps, 1).unwrap());
    let lookup: Arc<dyn Lookup> = lookup.clone();
    EnrichmentClient::new(Arc::clone(cache), budget, LookupMode::Live(lookup), config).unwrap()
}

#[tokio::test]
async fn only_uncached_keys_reach_the_service() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());

    // 300 pre-cached: 200 found, 100 tombstones.
    for i in 0..200 {
        cache
            .insert(
                &format!("drug-{}", i),
                CachedValue::Found {
                    records: vec![BTreeMap::from([("rxcui".into(), "cached".into())])],
                },
            )
            .unwrap();
    }
    for i in 200..300 {
        cache.insert(&format!("drug-{}", i), CachedValue::NotFound).unwrap();
    }

    let lookup = Arc::new(ScriptedLookup::default());
    let client = client(&cache, &lookup, fast_config(8));
    let keys: Vec<String> = (0..1_000).map(|i| format!("Drug-{}", i)).collect();
    let outcome = client.resolve_many(&keys).await.unwrap();

    assert_eq!(lookup.calls(), 700);
    assert_eq!(outcome.resolutions.len(), 1_000);
    assert_eq!(outcome.stats.cache_hits, 300);
    assert_eq!(outcome.stats.tombstone_hits, 100);
    assert_eq!(outcome.stats.not_found, 100);
    assert_eq!(outcome.stats.found, 900);
    assert_eq!(cache.len(), 1_000);

    // Everything is cached now.
    let again = client.resolve_many(&keys).await.unwrap();
    assert_eq!(lookup.calls(), 700);
    assert_eq!(again.stats.calls, 0);
    assert_eq!(again.resolutions, outcome.resolutions);
}

#[tokio::test]
async fn duplicates_and_variants_are_looked_up_once() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());
    let lookup = Arc::new(ScriptedLookup::default());
    let client = client(&cache, &lookup, fast_config(4));

    let outcome = client
        .resolve_many(["Aspirin", "aspirin ", "  ASPIRIN", "", "   "])
        .await
        .unwrap();
    assert_eq!(lookup.calls(), 1);
    assert_eq!(outcome.stats.requested, 5);
    assert_eq!(outcome.stats.unique_keys, 1);
    assert!(outcome.resolutions.contains_key("aspirin"));
}

#[tokio::test]
async fn failures_follow_the_retry_policy() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());
    let lookup = Arc::new(ScriptedLookup::default());
    let client = client(&cache, &lookup, fast_config(2));

    let outcome = client
        .resolve_many(["missing-a", "flaky-b", "broken-c", "down-d"])
        .await
        .unwrap();

    assert_eq!(outcome.resolutions["missing-a"], Resolution::NotFound);
    assert!(matches!(outcome.resolutions["flaky-b"], Resolution::Found { .. }));
    assert!(matches!(outcome.resolutions["broken-c"], Resolution::Unresolved { .. }));
    assert!(matches!(outcome.resolutions["down-d"], Resolution::Unresolved { .. }));

    // 1 + 3 + 1 + 4 calls; 2 + 3 retries.
    assert_eq!(outcome.stats.calls, 9);
    assert_eq!(outcome.stats.retries, 5);
    assert_eq!(outcome.stats.unresolved, 2);

    // Tombstones are cached, unresolved keys are not.
    assert_eq!(cache.get("missing-a"), Some(CachedValue::NotFound));
    assert!(cache.get("flaky-b").is_some());
    assert_eq!(cache.get("broken-c"), None);
    assert_eq!(cache.get("down-d"), None);
}

#[tokio::test]
async fn resolutions_persist_across_clients() {
    let dir = tempdir().unwrap();
    let lookup = Arc::new(ScriptedLookup::default());
    {
        let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());
        client(&cache, &lookup, fast_config(4))
            .resolve_many(["humira", "missing-x"])
            .await
            .unwrap();
    }
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());
    let outcome = client(&cache, &lookup, fast_config(4))
        .resolve_many(["humira", "missing-x"])
        .await
        .unwrap();
    assert_eq!(lookup.calls(), 2);
    assert_eq!(outcome.stats.cache_hits, 2);
}

#[tokio::test(start_paused = true)]
async fn pool_respects_worker_and_rate_limits() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted").unwrap());
    let lookup = Arc::new(ScriptedLookup::with_delay(Duration::from_millis(300)));
    let config = EnrichConfig {
        qps: 5.0,
        max_workers: 3,
        retry: RetryPolicy::default(),
    };
    let client = client(&cache, &lookup, config);

    let keys: Vec<String> = (0..20).map(|i| format!("k{}", i)).collect();
    client.resolve_many(&keys).await.unwrap();

    assert_eq!(lookup.calls(), 20);
    assert!(lookup.max_in_flight.load(Ordering::SeqCst) <= 3);

    let mut times = lookup.call_times.lock().unwrap().clone();
    times.sort();
    for (i, t0) in times.iter().enumerate() {
        for (j, t1) in times.iter().enumerate().skip(i) {
            let window = (*t1 - *t0).as_secs_f64();
            assert!(((j - i + 1) as f64) <= 5.0 * window + 1.0 + 0.01);
        }
    }
}

#[tokio::test]
async fn demo_mode_never_calls_out() {
    let dir = tempdir().unwrap();
    let mode = LookupMode::Demo(DemoLookup::new("scripted", "rxcui"));
    let cache = Arc::new(LookupCache::open(dir.path(), &mode.cache_domain()).unwrap());
    let budget = Arc::new(RateBudget::new(1.0).unwrap());
    let client = EnrichmentClient::new(cache, budget, mode, EnrichConfig::default()).unwrap();

    let first = client.resolve_many(["aspirin", "humira"]).await.unwrap();
    let second = client.resolve_many(["aspirin", "humira"]).await.unwrap();
    assert_eq!(first.stats.calls, 0);
    assert_eq!(second.stats.cache_hits, 2);
    assert_eq!(first.resolutions, second.resolutions);
    assert!(dir.path().join("scripted.demo.ndjson").exists());
    assert!(!dir.path().join("scripted.ndjson").exists());
}

#[tokio::test]
async fn live_client_refuses_demo_cache() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(LookupCache::open(dir.path(), "scripted.demo").unwrap());
    let lookup: Arc<dyn Lookup> = Arc::new(ScriptedLookup::default());
    let result = EnrichmentClient::new(
        cache,
        Arc::new(RateBudget::new(1.0).unwrap()),
        LookupMode::Live(lookup),
        EnrichConfig::default(),
    );
    assert!(matches!(result, Err(EnrichError::DomainMismatch { .. })));
}
