use std::sync::Arc;
use std::time::Duration;

use jdm_translate::clock::SystemClock;
use jdm_translate::state_machine::TextState;
use jdm_translate::translate::cache::{translation_key, CacheConfig};
use jdm_translate::translate::fake::FakeBackend;
use jdm_translate::translate::sqlite_storage::SqliteStorage;
use jdm_translate::translate::storage::{KeyValueStorage, MemoryStorage};
use jdm_translate::{
    LanguagePreference, MetricsRegistry, PersistentCache, Scheduler, SchedulerConfig, TextConfig,
    TranslatedText,
};

fn scheduler_over(storage: Arc<dyn KeyValueStorage>, backend: Arc<FakeBackend>) -> Scheduler {
    let cache = Arc::new(PersistentCache::new(
        storage,
        Arc::new(SystemClock),
        CacheConfig::default(),
    ));
    Scheduler::spawn(
        SchedulerConfig::default(),
        cache,
        backend,
        Arc::new(MetricsRegistry::new()),
    )
}

async fn wait_for_display(text: &TranslatedText, expected: &str) {
    let mut rx = text.subscribe();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|d| d == expected))
        .await
        .expect("display did not settle")
        .expect("text driver stopped");
}

#[tokio::test(start_paused = true)]
async fn language_picker_drives_mounted_text() {
    let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
    let backend = Arc::new(FakeBackend::default());
    let scheduler = scheduler_over(Arc::clone(&storage), Arc::clone(&backend));
    let preference = LanguagePreference::load(Arc::clone(&storage)).with_scheduler(scheduler.clone());

    let label = TranslatedText::mount(
        scheduler.clone(),
        "Auctions",
        preference.subscribe(),
        TextConfig::default(),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(label.display(), "Auctions");
    assert_eq!(backend.call_count(), 0);

    preference.set("ja").unwrap();
    wait_for_display(&label, "[ja] Auctions").await;
    assert_eq!(label.state(), TextState::Resolved);
    assert_eq!(scheduler.stats().current_language.as_deref(), Some("ja"));

    preference.set("en").unwrap();
    wait_for_display(&label, "Auctions").await;
    assert_eq!(scheduler.stats().current_language.as_deref(), Some("en"));

    // Restored on next load, and mirrored in the cookie.
    let reloaded = LanguagePreference::load(storage);
    assert_eq!(reloaded.current(), "en");
    assert_eq!(
        LanguagePreference::from_cookie_header(&preference.cookie_header()).as_deref(),
        Some("en")
    );

    label.unmount().await;
    scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn sqlite_backed_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(SqliteStorage::open(&path, None).unwrap());
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_over(storage, Arc::clone(&backend));
        assert_eq!(scheduler.schedule("Mileage", "ja", 50).await.unwrap(), "[ja] Mileage");
        assert_eq!(backend.call_count(), 1);
        scheduler.shutdown();
    }

    let storage: Arc<dyn KeyValueStorage> = Arc::new(SqliteStorage::open(&path, None).unwrap());
    let backend = Arc::new(FakeBackend::default());
    let scheduler = scheduler_over(storage, Arc::clone(&backend));
    assert_eq!(scheduler.schedule("Mileage", "ja", 50).await.unwrap(), "[ja] Mileage");
    assert_eq!(backend.call_count(), 0);
    assert_eq!(
        scheduler.cache().get(&translation_key("Mileage", "ja")).as_deref(),
        Some("[ja] Mileage")
    );
}
