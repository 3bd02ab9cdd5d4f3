use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use jdm_translate::clock::{Clock, ManualClock};
use jdm_translate::metrics::metric_names;
use jdm_translate::translate::cache::{translation_key, CacheConfig, CacheEntry, CACHE_STORAGE_KEY, DEFAULT_TTL_MS};
use jdm_translate::translate::fake::{FakeBackend, FakeReply};
use jdm_translate::translate::storage::{KeyValueStorage, MemoryStorage, StorageError};
use jdm_translate::{MetricsRegistry, PersistentCache, Scheduler, SchedulerConfig, TranslateError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

const T0_MS: i64 = 1_700_000_000_000;

fn cache_over(storage: Arc<MemoryStorage>, clock: Arc<ManualClock>) -> Arc<PersistentCache> {
    Arc::new(PersistentCache::new(storage, clock, CacheConfig::default()))
}

fn spawn(cache: Arc<PersistentCache>, backend: Arc<FakeBackend>) -> Scheduler {
    Scheduler::spawn(
        SchedulerConfig::default(),
        cache,
        backend,
        Arc::new(MetricsRegistry::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn dispatches_by_priority_with_spacing_and_concurrency_cap() {
    let backend = Arc::new(FakeBackend::new(Duration::from_millis(800)));
    let cache = cache_over(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(T0_MS)));
    let scheduler = spawn(cache, Arc::clone(&backend));

    let priorities = [10, 5, 20, 1, 15];
    let texts: Vec<String> = priorities.iter().map(|p| format!("item {p}")).collect();
    let results = join_all(
        texts
            .iter()
            .zip(priorities)
            .map(|(text, p)| scheduler.schedule(text, "ja", p)),
    )
    .await;

    for (text, result) in texts.iter().zip(results) {
        assert_eq!(result.unwrap(), format!("[ja] {text}"));
    }

    let calls = backend.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(order, ["item 1", "item 5", "item 10", "item 15", "item 20"]);
    for pair in calls.windows(2) {
        assert!(pair[1].started_at - pair[0].started_at >= Duration::from_millis(500));
    }
    assert!(backend.max_in_flight() <= 2);
    assert_eq!(scheduler.metrics().counter(metric_names::DISPATCHED), 5);
}

#[tokio::test(start_paused = true)]
async fn persisted_entry_is_served_without_network() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(T0_MS));
    let seeded = std::collections::HashMap::from([(
        translation_key("Home", "ja"),
        CacheEntry {
            value: "ホーム".into(),
            timestamp: clock.now_ms() - 60_000,
        },
    )]);
    storage
        .set_item(CACHE_STORAGE_KEY, &serde_json::to_string(&seeded).unwrap())
        .unwrap();

    let backend = Arc::new(FakeBackend::default());
    let scheduler = spawn(cache_over(storage, clock), Arc::clone(&backend));

    assert_eq!(scheduler.schedule("Home", "ja", 50).await.unwrap(), "ホーム");
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_goes_back_to_the_network() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(T0_MS));
    let backend = Arc::new(FakeBackend::default());
    let scheduler = spawn(cache_over(Arc::clone(&storage), Arc::clone(&clock)), Arc::clone(&backend));

    assert_eq!(scheduler.schedule("Mileage", "ja", 50).await.unwrap(), "[ja] Mileage");
    clock.advance(DEFAULT_TTL_MS);
    assert_eq!(scheduler.schedule("Mileage", "ja", 50).await.unwrap(), "[ja] Mileage");
    assert_eq!(backend.call_count(), 1, "still valid at exactly the TTL");

    // A second cache over the same storage sees the persisted entry.
    let reloaded = cache_over(Arc::clone(&storage), Arc::clone(&clock));
    assert_eq!(reloaded.get(&translation_key("Mileage", "ja")).as_deref(), Some("[ja] Mileage"));

    clock.advance(1);
    assert_eq!(scheduler.schedule("Mileage", "ja", 50).await.unwrap(), "[ja] Mileage");
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn language_change_flushes_queued_requests_with_source_text() {
    let backend = Arc::new(FakeBackend::new(Duration::from_secs(1)));
    let cache = cache_over(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(T0_MS)));
    let scheduler = spawn(cache, Arc::clone(&backend));

    let texts = ["Auctions", "Catalog", "Dashboard", "Orders", "Shipping"];
    let pending: Vec<_> = texts
        .into_iter()
        .map(|text| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { (text, scheduler.schedule(text, "ja", 50).await) })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.stats().active_requests, 1);
    assert_eq!(scheduler.stats().queued, 4);

    let switched = scheduler.schedule("Home", "ru", 50).await.unwrap();
    assert_eq!(switched, "[ru] Home");

    let mut translated = 0;
    for handle in pending {
        let (text, result) = handle.await.unwrap();
        let result = result.unwrap();
        if result == format!("[ja] {text}") {
            translated += 1;
        } else {
            assert_eq!(result, text);
        }
    }
    assert_eq!(translated, 1, "only the in-flight request completes its translation");
    assert_eq!(scheduler.metrics().counter(metric_names::FLUSHED), 4);
    assert_eq!(scheduler.stats().current_language.as_deref(), Some("ru"));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_burst_still_resolves_every_request() {
    let backend = Arc::new(FakeBackend::default());
    backend.push_reply("Bid", FakeReply::RateLimited { retry_after_ms: Some(2_000) });
    backend.push_reply("Bid", FakeReply::RateLimited { retry_after_ms: None });
    let cache = cache_over(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(T0_MS)));
    let scheduler = spawn(cache, Arc::clone(&backend));

    let texts = ["Bid", "Buy now", "Watchlist"];
    let results = join_all(texts.iter().map(|t| scheduler.schedule(t, "ja", 50))).await;
    for (text, result) in texts.iter().zip(results) {
        assert_eq!(result.unwrap(), format!("[ja] {text}"));
    }

    let bid_calls: Vec<_> = backend.calls().into_iter().filter(|c| c.text == "Bid").collect();
    assert_eq!(bid_calls.len(), 3);
    // Second retry waited out the default retry-after.
    assert!(bid_calls[2].started_at - bid_calls[1].started_at >= Duration::from_millis(10_000));
    assert!(!scheduler.stats().rate_limited);
}

fn schedule_in_background(scheduler: &Scheduler, text: &'static str, priority: i32) -> JoinHandle<Result<String, TranslateError>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.schedule(text, "ja", priority).await })
}

/// Dispatch order when "Lot 1" gets `first_reply` while "Peer" (same priority
/// as the retry) and "Lot 2" are already queued, and "Urgent"/"Later" arrive
/// just after the retry is queued.
async fn order_after_retry(first_reply: FakeReply, peer: i32, urgent: i32, later: i32) -> Vec<String> {
    let backend = Arc::new(FakeBackend::new(Duration::from_millis(100)));
    backend.push_reply("Lot 1", first_reply);
    let cache = cache_over(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(T0_MS)));
    let scheduler = spawn(cache, Arc::clone(&backend));

    let mut pending = vec![schedule_in_background(&scheduler, "Lot 1", 50)];
    tokio::time::sleep(Duration::from_millis(10)).await;
    pending.push(schedule_in_background(&scheduler, "Peer", peer));
    pending.push(schedule_in_background(&scheduler, "Lot 2", 50));

    // "Lot 1" comes back at 100ms and is requeued.
    tokio::time::sleep(Duration::from_millis(190)).await;
    assert_eq!(scheduler.stats().queued, 3);
    pending.push(schedule_in_background(&scheduler, "Urgent", urgent));
    pending.push(schedule_in_background(&scheduler, "Later", later));

    for handle in pending {
        let translated = handle.await.unwrap().unwrap();
        assert!(translated.starts_with("[ja] "), "{translated}");
    }
    backend.calls().into_iter().map(|c| c.text).collect()
}

#[tokio::test(start_paused = true)]
async fn rate_limited_request_retries_from_the_front_ten_points_sooner() {
    let order = order_after_retry(FakeReply::RateLimited { retry_after_ms: Some(2_000) }, 40, 39, 41).await;
    assert_eq!(order, ["Lot 1", "Urgent", "Lot 1", "Peer", "Later", "Lot 2"]);
}

#[tokio::test(start_paused = true)]
async fn failed_request_retries_from_the_front_five_points_sooner() {
    let order = order_after_retry(FakeReply::Fail("connection reset".into()), 45, 44, 46).await;
    assert_eq!(order, ["Lot 1", "Urgent", "Lot 1", "Peer", "Later", "Lot 2"]);
}

/// Storage that shuts the scheduler down from inside a write, then stalls the
/// writer long enough for the loop to drain and exit.
struct ShutdownOnWrite {
    items: MemoryStorage,
    scheduler: Mutex<Option<Scheduler>>,
    armed: AtomicBool,
}

impl KeyValueStorage for ShutdownOnWrite {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.items.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(scheduler) = self.scheduler.lock().take() {
                scheduler.shutdown();
            }
            std::thread::sleep(Duration::from_millis(300));
        }
        self.items.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove_item(key)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_cache_lookup_still_answers_the_caller() {
    let storage = Arc::new(ShutdownOnWrite {
        items: MemoryStorage::new(),
        scheduler: Mutex::new(None),
        armed: AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::new(T0_MS));
    let cache = Arc::new(PersistentCache::new(
        Arc::clone(&storage) as Arc<dyn KeyValueStorage>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        CacheConfig::default(),
    ));
    cache.set(&translation_key("Home", "ja"), "ホーム");

    let backend = Arc::new(FakeBackend::default());
    let scheduler = spawn(cache, Arc::clone(&backend));
    *storage.scheduler.lock() = Some(scheduler.clone());

    // The lookup finds an expired entry and persists its removal.
    clock.advance(DEFAULT_TTL_MS + 1);
    storage.armed.store(true, Ordering::SeqCst);

    let outcome = tokio::time::timeout(Duration::from_secs(3), scheduler.schedule("Home", "ja", 50))
        .await
        .expect("schedule left unanswered after shutdown");
    assert_eq!(outcome, Err(TranslateError::Shutdown));
    assert_eq!(scheduler.stats().queued, 0);
    assert_eq!(backend.call_count(), 0);
}
