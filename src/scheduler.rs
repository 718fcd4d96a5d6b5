//! Background tasks: list refresh and the periodic health summary.

use crate::manager::ProxyPoolManager;
use crate::source::ProxySource;

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Handle to the pool's background tasks. Dropping it stops them.
pub struct PoolScheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolScheduler {
    /// Spawn the refresh and stats tasks on the current tokio runtime.
    pub fn spawn(manager: Arc<ProxyPoolManager>, source: Arc<dyn ProxySource>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(refresh_loop(Arc::clone(&manager), source, rx.clone())),
            tokio::spawn(stats_loop(manager, rx)),
        ];
        Self { shutdown, tasks }
    }

    /// Cancel pending timers and wait for the tasks to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Proxy pool task ended abnormally: {}", e);
            }
        }
        info!("Proxy pool scheduler stopped");
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn refresh_loop(
    manager: Arc<ProxyPoolManager>,
    source: Arc<dyn ProxySource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = manager.config.refresh_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                refresh_once(&manager, source.as_ref(), "scheduled").await;
                if manager.config.reanimate_on_refresh {
                    manager.reanimate_all();
                }
            }
            _ = manager.refresh_requested() => {
                refresh_once(&manager, source.as_ref(), "forced").await;
                ticker.reset();
            }
        }
    }
}

async fn refresh_once(manager: &ProxyPoolManager, source: &dyn ProxySource, trigger: &str) {
    match manager.refresh_from(source).await {
        Ok(_) => info!("Proxy pool {} refresh done: {}", trigger, summary_line(manager)),
        Err(e) => warn!("Proxy pool {} refresh failed, keeping current list: {}", trigger, e),
    }
}

async fn stats_loop(manager: Arc<ProxyPoolManager>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(manager.config.stats_log_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                info!("Proxy pool status: {}", summary_line(&manager));
                let bans = manager.ban_stats().snapshot();
                if !bans.is_empty() {
                    info!("Proxy bans: {:?}", bans);
                }
            }
        }
    }
}

fn summary_line(manager: &ProxyPoolManager) -> String {
    let stats = manager.stats();
    format!(
        "{} alive, {} unchecked, {} dead, {} pending removal ({} total)",
        stats.alive, stats.unchecked, stats.dead, stats.retired, stats.total
    )
}
