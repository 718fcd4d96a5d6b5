use async_trait::async_trait;
use rotating_proxy_pool::{
    PoolScheduler, ProxyEntry, ProxyFilter, ProxyPoolConfig, ProxyPoolManager, ProxySource,
    ProxyStatus, SourceError, StaticSource,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn entries(addresses: &[&str]) -> Vec<ProxyEntry> {
    addresses.iter().map(|a| ProxyEntry::new(*a).country("us")).collect()
}

/// Counts fetches and fails every one of them.
#[derive(Default)]
struct BrokenSource {
    calls: AtomicUsize,
}

#[async_trait]
impl ProxySource for BrokenSource {
    async fn fetch(&self) -> Result<Vec<ProxyEntry>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Io(std::io::Error::other("source offline")))
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn failed_refresh_keeps_existing_pool() {
    init_logger();
    let manager = ProxyPoolManager::with_entries(ProxyPoolConfig::default(), entries(&["a:1", "b:1"]));
    manager.mark_dead("a:1", "test");
    let before = manager.stats();

    assert_err!(manager.refresh_from(&BrokenSource::default()).await);
    assert_eq!(manager.stats(), before);
    assert_eq!(manager.record("a:1").unwrap().status, ProxyStatus::Dead);

    // An empty list counts as a failed fetch too.
    let empty = StaticSource::new(Vec::new());
    assert!(matches!(manager.refresh_from(&empty).await, Err(SourceError::Empty)));
    assert_eq!(manager.stats().total, 2);
}

#[tokio::test]
async fn refresh_merges_new_list() {
    init_logger();
    let manager = ProxyPoolManager::with_entries(ProxyPoolConfig::default(), entries(&["a:1", "b:1"]));
    manager.mark_alive("a:1");

    let source = StaticSource::new(entries(&["a:1", "c:1"]));
    let summary = assert_ok!(manager.refresh_from(&source).await);
    assert_eq!(summary.added, 1);
    assert_eq!(summary.kept, 1);
    assert_eq!(summary.removed, 1);

    assert_eq!(manager.record("a:1").unwrap().status, ProxyStatus::Alive);
    assert_eq!(manager.record("c:1").unwrap().status, ProxyStatus::Unchecked);
    assert!(manager.record("b:1").is_none());
}

#[tokio::test]
async fn scheduled_refresh_runs_on_interval() {
    init_logger();
    let config = ProxyPoolConfig::builder()
        .refresh_interval(Duration::from_millis(20))
        .stats_log_interval(Duration::from_millis(20))
        .build();
    let manager = Arc::new(ProxyPoolManager::with_entries(config, entries(&["a:1"])));
    let source = Arc::new(StaticSource::new(entries(&["a:1", "b:1", "c:1"])));

    let scheduler = PoolScheduler::spawn(Arc::clone(&manager), source);
    wait_for(|| manager.stats().total == 3).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn refresh_errors_do_not_stop_the_scheduler() {
    init_logger();
    let config = ProxyPoolConfig::builder()
        .refresh_interval(Duration::from_millis(10))
        .build();
    let manager = Arc::new(ProxyPoolManager::with_entries(config, entries(&["a:1"])));
    let source = Arc::new(BrokenSource::default());

    let scheduler = PoolScheduler::spawn(Arc::clone(&manager), source.clone());
    wait_for(|| source.calls.load(Ordering::SeqCst) >= 3).await;
    assert_eq!(manager.stats().total, 1);
    assert_ok!(manager.select(&ProxyFilter::any(), &HashSet::new()));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn exhaustion_forces_out_of_band_refresh() {
    init_logger();
    let config = ProxyPoolConfig::builder()
        .refresh_interval(Duration::from_secs(3600))
        .force_refresh_on_exhaustion(true)
        .build();
    let manager = Arc::new(ProxyPoolManager::with_entries(config, entries(&["a:1"])));
    let source = Arc::new(StaticSource::new(entries(&["a:1", "fresh:1"])));
    let scheduler = PoolScheduler::spawn(Arc::clone(&manager), source);

    manager.mark_dead("a:1", "test");
    // Reanimation still serves this call while the refresh runs.
    let lease = assert_ok!(manager.select(&ProxyFilter::any(), &HashSet::new()));
    assert_eq!(lease.address(), "a:1");
    drop(lease);

    wait_for(|| manager.record("fresh:1").is_some()).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn reanimate_on_refresh_clears_dead_marks() {
    init_logger();
    let config = ProxyPoolConfig::builder()
        .refresh_interval(Duration::from_millis(20))
        .reanimate_on_refresh(true)
        .build();
    let manager = Arc::new(ProxyPoolManager::with_entries(config, entries(&["a:1"])));
    manager.mark_dead("a:1", "test");

    let source = Arc::new(StaticSource::new(entries(&["a:1"])));
    let scheduler = PoolScheduler::spawn(Arc::clone(&manager), source);
    wait_for(|| manager.stats().dead == 0).await;
    assert_eq!(manager.record("a:1").unwrap().status, ProxyStatus::Unchecked);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_background_tasks() {
    init_logger();
    let config = ProxyPoolConfig::builder()
        .refresh_interval(Duration::from_millis(10))
        .build();
    let manager = Arc::new(ProxyPoolManager::with_entries(config, entries(&["a:1"])));
    let source = Arc::new(BrokenSource::default());

    let scheduler = PoolScheduler::spawn(Arc::clone(&manager), source.clone());
    wait_for(|| source.calls.load(Ordering::SeqCst) >= 1).await;
    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("scheduler did not stop");

    let calls = source.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.calls.load(Ordering::SeqCst), calls);
}
