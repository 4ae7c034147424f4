use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    decide, normalize_key, CachedValue, EnrichError, EnrichResult, Lookup, LookupCache,
    LookupMode, LookupRecord, RateBudget, RetryDecision, RetryPolicy,
};

/// Knobs for one enrichment batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    pub qps: f64,
    pub max_workers: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            qps: 4.0,
            max_workers: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Final answer for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Found { records: Vec<LookupRecord> },
    NotFound,
    /// Gave up this run. Not cached.
    Unresolved { reason: String },
}

impl Resolution {
    pub fn status(&self) -> &'static str {
        match self {
            Resolution::Found { .. } => "found",
            Resolution::NotFound => "not_found",
            Resolution::Unresolved { .. } => "unresolved",
        }
    }
}

impl From<CachedValue> for Resolution {
    fn from(value: CachedValue) -> Self {
        match value {
            CachedValue::Found { records } => Resolution::Found { records },
            CachedValue::NotFound => Resolution::NotFound,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    pub requested: usize,
    pub unique_keys: usize,
    pub cache_hits: usize,
    pub tombstone_hits: usize,
    pub calls: usize,
    pub retries: usize,
    pub found: usize,
    pub not_found: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    /// Keyed by normalized key, so iteration order is independent of completion order.
    pub resolutions: BTreeMap<String, Resolution>,
    pub stats: LookupStats,
}

/// Resolves batches of keys through cache, rate budget and worker pool.
pub struct EnrichmentClient {
    cache: Arc<LookupCache>,
    budget: Arc<RateBudget>,
    mode: LookupMode,
    config: EnrichConfig,
}

impl EnrichmentClient {
    pub fn new(
        cache: Arc<LookupCache>,
        budget: Arc<RateBudget>,
        mode: LookupMode,
        config: EnrichConfig,
    ) -> EnrichResult<Self> {
        if config.max_workers == 0 {
            return Err(EnrichError::InvalidWorkers);
        }
        let expected = mode.cache_domain();
        if cache.domain() != expected {
            return Err(EnrichError::DomainMismatch {
                cache: cache.domain().to_string(),
                mode: expected,
            });
        }
        Ok(Self {
            cache,
            budget,
            mode,
            config,
        })
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub fn mode(&self) -> &LookupMode {
        &self.mode
    }

    /// Resolve every key. Only keys with no cache entry reach the lookup.
    pub async fn resolve_many<I, S>(&self, keys: I) -> EnrichResult<EnrichOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stats = LookupStats::default();
        let mut unique = BTreeSet::new();
        for key in keys {
            stats.requested += 1;
            if let Some(key) = normalize_key(key.as_ref()) {
                unique.insert(key);
            }
        }
        stats.unique_keys = unique.len();

        let mut resolutions = BTreeMap::new();
        let mut pending = VecDeque::new();
        for key in unique {
            match self.cache.get(&key) {
                Some(value) => {
                    stats.cache_hits += 1;
                    if value == CachedValue::NotFound {
                        stats.tombstone_hits += 1;
                    }
                    resolutions.insert(key, Resolution::from(value));
                }
                None => pending.push_back(key),
            }
        }

        info!(
            domain = self.cache.domain(),
            unique = stats.unique_keys,
            cached = stats.cache_hits,
            pending = pending.len(),
            "Resolving lookup keys"
        );

        match &self.mode {
            LookupMode::Demo(demo) => {
                for key in pending {
                    let records = demo.records(&key);
                    self.cache.insert(
                        &key,
                        CachedValue::Found {
                            records: records.clone(),
                        },
                    )?;
                    resolutions.insert(key, Resolution::Found { records });
                }
            }
            LookupMode::Live(lookup) => {
                if !pending.is_empty() {
                    let resolved = self.run_workers(Arc::clone(lookup), pending).await?;
                    stats.calls += resolved.calls;
                    stats.retries += resolved.retries;
                    resolutions.extend(resolved.resolutions);
                }
            }
        }

        for resolution in resolutions.values() {
            match resolution {
                Resolution::Found { .. } => stats.found += 1,
                Resolution::NotFound => stats.not_found += 1,
                Resolution::Unresolved { .. } => stats.unresolved += 1,
            }
        }

        info!(
            domain = self.cache.domain(),
            calls = stats.calls,
            retries = stats.retries,
            found = stats.found,
            not_found = stats.not_found,
            unresolved = stats.unresolved,
            "Lookup batch complete"
        );
        if stats.unresolved > 0 {
            warn!(
                "{} key(s) left unresolved; they will be retried on the next run",
                stats.unresolved
            );
        }

        Ok(EnrichOutcome { resolutions, stats })
    }

    async fn run_workers(
        &self,
        lookup: Arc<dyn Lookup>,
        pending: VecDeque<String>,
    ) -> EnrichResult<WorkerOutput> {
        let workers = self.config.max_workers.min(pending.len()).max(1);
        let queue = Arc::new(Mutex::new(pending));
        let mut tasks = JoinSet::new();

        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                lookup: Arc::clone(&lookup),
                cache: Arc::clone(&self.cache),
                budget: Arc::clone(&self.budget),
                policy: self.config.retry.clone(),
            };
            tasks.spawn(worker.run());
        }

        let mut output = WorkerOutput::default();
        while let Some(joined) = tasks.join_next().await {
            let worker_output = joined.map_err(|e| EnrichError::Worker(e.to_string()))??;
            output.calls += worker_output.calls;
            output.retries += worker_output.retries;
            output.resolutions.extend(worker_output.resolutions);
        }
        Ok(output)
    }
}

#[derive(Default)]
struct WorkerOutput {
    resolutions: Vec<(String, Resolution)>,
    calls: usize,
    retries: usize,
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<String>>>,
    lookup: Arc<dyn Lookup>,
    cache: Arc<LookupCache>,
    budget: Arc<RateBudget>,
    policy: RetryPolicy,
}

impl Worker {
    async fn run(self) -> EnrichResult<WorkerOutput> {
        let mut output = WorkerOutput::default();
        loop {
            let next = {
                let mut queue = self.queue.lock().map_err(|_| EnrichError::Worker(
                    "work queue lock poisoned".to_string(),
                ))?;
                queue.pop_front()
            };
            let Some(key) = next else { break };

            let resolution = self.resolve_one(&key, &mut output).await;
            match &resolution {
                Resolution::Found { records } => self.cache.insert(
                    &key,
                    CachedValue::Found {
                        records: records.clone(),
                    },
                )?,
                Resolution::NotFound => self.cache.insert(&key, CachedValue::NotFound)?,
                Resolution::Unresolved { .. } => {}
            }
            output.resolutions.push((key, resolution));
        }
        debug!(worker = self.id, calls = output.calls, "Lookup worker finished");
        Ok(output)
    }

    async fn resolve_one(&self, key: &str, output: &mut WorkerOutput) -> Resolution {
        let mut attempt = 0u32;
        loop {
            self.budget.acquire().await;
            attempt += 1;
            output.calls += 1;

            let failure = match self.lookup.lookup(key).await {
                Ok(records) if records.is_empty() => crate::Failure::NotFound,
                Ok(records) => return Resolution::Found { records },
                Err(failure) => failure,
            };

            match decide(attempt, &failure, &self.policy) {
                RetryDecision::Retry { backoff } => {
                    debug!(
                        key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying lookup: {}",
                        failure
                    );
                    output.retries += 1;
                    tokio::time::sleep(backoff).await;
                }
                RetryDecision::Tombstone => return Resolution::NotFound,
                RetryDecision::LeaveUnresolved => {
                    warn!(key, attempt, "Lookup gave up: {}", failure);
                    return Resolution::Unresolved {
                        reason: failure.to_string(),
                    };
                }
            }
        }
    }
}
