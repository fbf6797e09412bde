use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::clock::{checked_later, Clock};
use crate::config::CertificateAuthorityConfig;
use crate::host_key::HostKey;
use crate::synthesizer::SyntheticCertificate;
use crate::CaError;

/// Least-recently-used entries inspected for staleness on every lookup.
const SWEEP_BATCH: usize = 8;

type SynthesisResult = Result<Arc<SyntheticCertificate>, CaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced_waits: u64,
    pub leaves_issued: u64,
    pub synthesis_failures: u64,
    pub lru_evictions: u64,
    pub stale_evictions: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced_waits: AtomicU64,
    leaves_issued: AtomicU64,
    synthesis_failures: AtomicU64,
    lru_evictions: AtomicU64,
    stale_evictions: AtomicU64,
}

#[derive(Debug)]
struct CacheEntry {
    certificate: Arc<SyntheticCertificate>,
    created_at: OffsetDateTime,
    last_access: OffsetDateTime,
}

struct CacheState {
    ready: LruCache<HostKey, CacheEntry>,
    in_flight: HashMap<HostKey, watch::Sender<Option<SynthesisResult>>>,
}

struct CacheShared {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    entry_ttl: Duration,
    expiry_safety_margin: Duration,
    wait_timeout: Duration,
    counters: CacheCounters,
}

enum Lookup {
    Hit(Arc<SyntheticCertificate>),
    Wait(watch::Receiver<Option<SynthesisResult>>),
    Lead(watch::Receiver<Option<SynthesisResult>>),
}

/// Memoizes synthesized leaves per [`HostKey`].
///
/// Concurrent lookups for the same key share a single synthesis. Ready
/// entries live in a bounded LRU and are dropped once their TTL passes or
/// their certificate nears `not_after`.
#[derive(Clone)]
pub struct CertificateCache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("entry_ttl", &self.shared.entry_ttl)
            .field("expiry_safety_margin", &self.shared.expiry_safety_margin)
            .field("wait_timeout", &self.shared.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl CertificateCache {
    pub fn new(config: &CertificateAuthorityConfig, clock: Arc<dyn Clock>) -> Result<Self, CaError> {
        let capacity = NonZeroUsize::new(config.max_cache_entries).ok_or_else(|| {
            CaError::InvalidConfiguration("max_cache_entries must be greater than zero".to_string())
        })?;
        Ok(Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    ready: LruCache::new(capacity),
                    in_flight: HashMap::new(),
                }),
                clock,
                entry_ttl: config.cache_entry_ttl(),
                expiry_safety_margin: config.expiry_safety_margin(),
                wait_timeout: config.synthesis_wait_timeout(),
                counters: CacheCounters::default(),
            }),
        })
    }

    /// Returns the cached leaf for `host_key`, running `synthesize` on the
    /// blocking pool when there is none.
    ///
    /// Only one `synthesize` runs per key at a time; other callers wait for
    /// it (up to the configured wait timeout) and share its outcome. Failed
    /// syntheses are not cached.
    pub async fn get_or_create<F>(
        &self,
        host_key: HostKey,
        synthesize: F,
    ) -> Result<Arc<SyntheticCertificate>, CaError>
    where
        F: FnOnce(&HostKey) -> Result<SyntheticCertificate, CaError> + Send + 'static,
    {
        let lookup = {
            let mut state = self.shared.lock()?;
            let now = self.shared.clock.now();
            self.shared.sweep_locked(&mut state, now);

            if let Some(certificate) = self.shared.lookup_locked(&mut state, &host_key, now) {
                Lookup::Hit(certificate)
            } else if let Some(sender) = state.in_flight.get(&host_key) {
                Lookup::Wait(sender.subscribe())
            } else {
                let (sender, receiver) = watch::channel(None);
                state.in_flight.insert(host_key.clone(), sender);
                Lookup::Lead(receiver)
            }
        };

        let receiver = match lookup {
            Lookup::Hit(certificate) => {
                self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(certificate);
            }
            Lookup::Wait(receiver) => {
                self.shared
                    .counters
                    .coalesced_waits
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(host = %host_key, "waiting on in-flight certificate synthesis");
                receiver
            }
            Lookup::Lead(receiver) => {
                self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.spawn_synthesis(host_key.clone(), synthesize);
                receiver
            }
        };

        self.shared.wait_for_result(&host_key, receiver).await
    }

    /// Drops every stale entry now instead of waiting for lookups to reach it.
    pub fn purge_stale(&self) -> Result<usize, CaError> {
        let mut state = self.shared.lock()?;
        let now = self.shared.clock.now();
        let stale: Vec<HostKey> = state
            .ready
            .iter()
            .filter(|(_, entry)| self.shared.is_stale(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.shared.evict_stale_locked(&mut state, key);
        }
        Ok(stale.len())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().map(|state| state.ready.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every ready entry. In-flight syntheses still complete and are
    /// cached when they finish.
    pub fn clear(&self) -> Result<(), CaError> {
        self.shared.lock()?.ready.clear();
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        let counters = &self.shared.counters;
        CacheMetricsSnapshot {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced_waits: counters.coalesced_waits.load(Ordering::Relaxed),
            leaves_issued: counters.leaves_issued.load(Ordering::Relaxed),
            synthesis_failures: counters.synthesis_failures.load(Ordering::Relaxed),
            lru_evictions: counters.lru_evictions.load(Ordering::Relaxed),
            stale_evictions: counters.stale_evictions.load(Ordering::Relaxed),
        }
    }

    fn spawn_synthesis<F>(&self, host_key: HostKey, synthesize: F)
    where
        F: FnOnce(&HostKey) -> Result<SyntheticCertificate, CaError> + Send + 'static,
    {
        // Detached so the result is cached even if every caller goes away.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let worker_key = host_key.clone();
            let result = match tokio::task::spawn_blocking(move || synthesize(&worker_key)).await
            {
                Ok(result) => result.map(Arc::new),
                Err(error) => Err(CaError::WorkerFailed(error.to_string())),
            };
            shared.complete(host_key, result);
        });
    }
}

impl CacheShared {
    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CaError> {
        self.state.lock().map_err(|_| CaError::LockPoisoned)
    }

    fn is_stale(&self, entry: &CacheEntry, now: OffsetDateTime) -> bool {
        // A TTL past the representable range never expires; a margin past it
        // covers every not_after.
        let ttl_elapsed = checked_later(entry.created_at, self.entry_ttl)
            .is_some_and(|expires_at| now >= expires_at);
        let near_not_after = checked_later(now, self.expiry_safety_margin)
            .map_or(true, |edge| edge >= entry.certificate.not_after());
        ttl_elapsed || near_not_after
    }

    fn lookup_locked(
        &self,
        state: &mut CacheState,
        host_key: &HostKey,
        now: OffsetDateTime,
    ) -> Option<Arc<SyntheticCertificate>> {
        match state.ready.get_mut(host_key) {
            Some(entry) if !self.is_stale(entry, now) => {
                entry.last_access = now;
                return Some(Arc::clone(&entry.certificate));
            }
            Some(_) => {}
            None => return None,
        }
        self.evict_stale_locked(state, host_key);
        None
    }

    fn sweep_locked(&self, state: &mut CacheState, now: OffsetDateTime) {
        let stale: Vec<HostKey> = state
            .ready
            .iter()
            .rev()
            .take(SWEEP_BATCH)
            .filter(|(_, entry)| self.is_stale(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.evict_stale_locked(state, key);
        }
    }

    fn evict_stale_locked(&self, state: &mut CacheState, host_key: &HostKey) {
        if let Some(entry) = state.ready.pop(host_key) {
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                host = %host_key,
                not_after = %entry.certificate.not_after(),
                last_access = %entry.last_access,
                "evicted stale leaf certificate"
            );
        }
    }

    fn complete(&self, host_key: HostKey, result: SynthesisResult) {
        // Bookkeeping only; a poisoned lock must not strand the waiters.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = state.in_flight.remove(&host_key);

        match &result {
            Ok(certificate) => {
                self.counters.leaves_issued.fetch_add(1, Ordering::Relaxed);
                let now = self.clock.now();
                let entry = CacheEntry {
                    certificate: Arc::clone(certificate),
                    created_at: now,
                    last_access: now,
                };
                if let Some((evicted, _)) = state.ready.push(host_key.clone(), entry) {
                    if evicted != host_key {
                        self.counters.lru_evictions.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            host = %evicted,
                            "evicted least recently used leaf certificate"
                        );
                    }
                }
            }
            Err(error) => {
                self.counters
                    .synthesis_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(host = %host_key, %error, "certificate synthesis failed");
            }
        }
        drop(state);

        if let Some(sender) = sender {
            sender.send_replace(Some(result));
        }
    }

    async fn wait_for_result(
        &self,
        host_key: &HostKey,
        mut receiver: watch::Receiver<Option<SynthesisResult>>,
    ) -> SynthesisResult {
        let waited = tokio::time::timeout(self.wait_timeout, receiver.wait_for(Option::is_some))
            .await
            .map_err(|_| CaError::SynthesisTimeout {
                host: host_key.to_string(),
                waited_ms: u64::try_from(self.wait_timeout.as_millis()).unwrap_or(u64::MAX),
            })?;
        let outcome = waited.map_err(|_| {
            CaError::WorkerFailed("certificate synthesis ended without a result".to_string())
        })?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(CaError::WorkerFailed(
                "certificate synthesis ended without a result".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{CacheMetricsSnapshot, CertificateCache};
    use crate::authority::{generate_root_material, RootAuthority, RootIdentity};
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::config::CertificateAuthorityConfig;
    use crate::host_key::HostKey;
    use crate::synthesizer::{LeafSynthesizer, SyntheticCertificate};
    use crate::CaError;

    struct Harness {
        cache: CertificateCache,
        synthesizer: Arc<LeafSynthesizer>,
        calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(config: CertificateAuthorityConfig, clock: Arc<dyn Clock>) -> Self {
            let material =
                generate_root_material(&RootIdentity::default()).expect("root material");
            let authority = Arc::new(RootAuthority::from_material(&material).expect("root"));
            Self {
                cache: CertificateCache::new(&config, Arc::clone(&clock)).expect("cache"),
                synthesizer: Arc::new(LeafSynthesizer::new(authority, &config, clock)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn counting(
            &self,
            delay: Duration,
        ) -> impl FnOnce(&HostKey) -> Result<SyntheticCertificate, CaError> + Send + 'static
        {
            let synthesizer = Arc::clone(&self.synthesizer);
            let calls = Arc::clone(&self.calls);
            move |host_key: &HostKey| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(delay);
                synthesizer.synthesize(host_key)
            }
        }

        async fn get(&self, host: &str) -> Result<Arc<SyntheticCertificate>, CaError> {
            self.cache
                .get_or_create(
                    HostKey::single(host).expect("host key"),
                    self.counting(Duration::ZERO),
                )
                .await
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit_with_identical_certificate() {
        let harness = Harness::new(CertificateAuthorityConfig::default(), Arc::new(SystemClock));
        let first = harness.get("api.example.com").await.expect("first");
        let second = harness.get("API.example.com").await.expect("second");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.serial(), second.serial());
        assert_eq!(harness.calls(), 1);
        assert_eq!(
            harness.cache.metrics_snapshot(),
            CacheMetricsSnapshot {
                hits: 1,
                misses: 1,
                leaves_issued: 1,
                ..CacheMetricsSnapshot::default()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_synthesis() {
        let harness = Arc::new(Harness::new(
            CertificateAuthorityConfig::default(),
            Arc::new(SystemClock),
        ));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let harness = Arc::clone(&harness);
            tasks.push(tokio::spawn(async move {
                harness
                    .cache
                    .get_or_create(
                        HostKey::single("shared.example.com").expect("host key"),
                        harness.counting(Duration::from_millis(200)),
                    )
                    .await
            }));
        }

        let mut serials = Vec::new();
        for task in tasks {
            let certificate = task.await.expect("join").expect("certificate");
            serials.push(certificate.serial().to_vec());
        }
        assert_eq!(harness.calls(), 1);
        assert!(serials.windows(2).all(|pair| pair[0] == pair[1]));
        let metrics = harness.cache.metrics_snapshot();
        assert_eq!(metrics.leaves_issued, 1);
        assert_eq!(metrics.hits + metrics.misses + metrics.coalesced_waits, 32);
    }

    #[tokio::test]
    async fn failed_synthesis_is_shared_then_retried() {
        let harness = Harness::new(CertificateAuthorityConfig::default(), Arc::new(SystemClock));
        let key = HostKey::single("flaky.example.com").expect("host key");
        let attempts = Arc::new(AtomicUsize::new(0));

        let failing = {
            let attempts = Arc::clone(&attempts);
            move |_: &HostKey| -> Result<SyntheticCertificate, CaError> {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                Err(CaError::KeyGeneration("entropy source exhausted".to_string()))
            }
        };
        let (first, second) = tokio::join!(
            harness.cache.get_or_create(key.clone(), failing),
            harness
                .cache
                .get_or_create(key.clone(), harness.counting(Duration::ZERO)),
        );
        assert!(matches!(first, Err(CaError::KeyGeneration(_))));
        assert!(matches!(second, Err(CaError::KeyGeneration(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(harness.cache.is_empty());

        let retried = harness
            .cache
            .get_or_create(key, harness.counting(Duration::ZERO))
            .await
            .expect("retry succeeds");
        assert_eq!(retried.host_key().to_string(), "flaky.example.com");
        assert_eq!(harness.calls(), 1);
        assert_eq!(harness.cache.metrics_snapshot().synthesis_failures, 1);
    }

    #[tokio::test]
    async fn panicking_synthesis_surfaces_worker_failure() {
        let harness = Harness::new(CertificateAuthorityConfig::default(), Arc::new(SystemClock));
        let key = HostKey::single("panic.example.com").expect("host key");

        let error = harness
            .cache
            .get_or_create(key.clone(), |_: &HostKey| -> Result<SyntheticCertificate, CaError> {
                panic!("signing backend exploded")
            })
            .await
            .expect_err("panic surfaces");
        assert!(matches!(error, CaError::WorkerFailed(_)), "{error}");

        harness
            .cache
            .get_or_create(key, harness.counting(Duration::ZERO))
            .await
            .expect("retry after panic");
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let config = CertificateAuthorityConfig {
            max_cache_entries: 2,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, Arc::new(SystemClock));

        harness.get("a.example.com").await.expect("a");
        harness.get("b.example.com").await.expect("b");
        harness.get("a.example.com").await.expect("a again");
        harness.get("c.example.com").await.expect("c");
        assert_eq!(harness.calls(), 3);
        assert_eq!(harness.cache.len(), 2);

        harness.get("a.example.com").await.expect("a still cached");
        assert_eq!(harness.calls(), 3);

        harness.get("b.example.com").await.expect("b re-synthesized");
        assert_eq!(harness.calls(), 4);
        assert_eq!(harness.cache.metrics_snapshot().lru_evictions, 2);
    }

    #[tokio::test]
    async fn expired_leaf_is_never_returned() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CertificateAuthorityConfig {
            max_leaf_validity_seconds: 2 * 60 * 60,
            cache_entry_ttl_seconds: 365 * 24 * 60 * 60,
            expiry_safety_margin_seconds: 10 * 60,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, clock.clone());

        let first = harness.get("api.example.com").await.expect("first");
        clock.advance(Duration::from_secs(60 * 60));
        let still_fresh = harness.get("api.example.com").await.expect("still fresh");
        assert!(Arc::ptr_eq(&first, &still_fresh));

        clock.advance(Duration::from_secs(55 * 60));
        let renewed = harness.get("api.example.com").await.expect("renewed");
        assert_ne!(first.serial(), renewed.serial());
        assert!(renewed.not_after() > clock.now());
        assert_eq!(harness.calls(), 2);
        assert_eq!(harness.cache.metrics_snapshot().stale_evictions, 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl_and_purge_sweeps_them() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CertificateAuthorityConfig {
            cache_entry_ttl_seconds: 60,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, clock.clone());

        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            harness.get(host).await.expect("leaf");
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(harness.cache.purge_stale().expect("purge"), 3);
        assert!(harness.cache.is_empty());

        harness.get("a.example.com").await.expect("reissued");
        assert_eq!(harness.calls(), 4);
    }

    #[tokio::test]
    async fn lookup_of_one_key_sweeps_other_stale_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CertificateAuthorityConfig {
            cache_entry_ttl_seconds: 60,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, clock.clone());

        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            harness.get(host).await.expect("leaf");
        }
        assert_eq!(harness.cache.len(), 3);
        clock.advance(Duration::from_secs(61));

        harness.get("d.example.com").await.expect("d");
        assert_eq!(harness.cache.len(), 1);
        assert_eq!(harness.cache.metrics_snapshot().stale_evictions, 3);
        assert_eq!(harness.calls(), 4);
    }

    #[tokio::test]
    async fn unbounded_ttl_never_expires_and_keeps_the_cache_usable() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CertificateAuthorityConfig {
            cache_entry_ttl_seconds: u64::MAX,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, clock.clone());

        let first = harness.get("api.example.com").await.expect("first");
        clock.advance(Duration::from_secs(24 * 60 * 60));
        let second = harness.get("api.example.com").await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        harness.get("www.example.com").await.expect("other host");
        assert_eq!(harness.cache.purge_stale().expect("purge"), 0);
        assert_eq!(harness.calls(), 2);
    }

    #[tokio::test]
    async fn waiter_times_out_but_synthesis_still_lands_in_cache() {
        let config = CertificateAuthorityConfig {
            synthesis_wait_timeout_ms: 50,
            ..CertificateAuthorityConfig::default()
        };
        let harness = Harness::new(config, Arc::new(SystemClock));
        let key = HostKey::single("slow.example.com").expect("host key");

        let error = harness
            .cache
            .get_or_create(key.clone(), harness.counting(Duration::from_millis(300)))
            .await
            .expect_err("timeout");
        assert!(
            matches!(error, CaError::SynthesisTimeout { ref host, waited_ms: 50 } if host == "slow.example.com"),
            "{error}"
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        harness
            .cache
            .get_or_create(key, harness.counting(Duration::ZERO))
            .await
            .expect("cached after completion");
        assert_eq!(harness.calls(), 1);
        assert_eq!(harness.cache.metrics_snapshot().hits, 1);
    }

    #[tokio::test]
    async fn clear_forgets_ready_entries() {
        let harness = Harness::new(CertificateAuthorityConfig::default(), Arc::new(SystemClock));
        harness.get("api.example.com").await.expect("leaf");
        harness.cache.clear().expect("clear");
        assert!(harness.cache.is_empty());
        harness.get("api.example.com").await.expect("leaf again");
        assert_eq!(harness.calls(), 2);
    }
}
