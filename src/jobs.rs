//! Background jobs: periodic sampling of live player counts and retention
//! pruning of old samples.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::directory::ServerDirectory;
use crate::error::Result;
use crate::metrics;
use crate::models::Sample;
use crate::period;
use crate::store::SampleStore;

/// Writes one sample per registered server on every tick.
pub struct Sampler {
    store: Arc<dyn SampleStore>,
    directory: Arc<dyn ServerDirectory>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    only_changes: bool,
    last_written: Mutex<HashMap<String, i32>>,
}

impl Sampler {
    pub fn new(
        store: Arc<dyn SampleStore>,
        directory: Arc<dyn ServerDirectory>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        only_changes: bool,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            interval,
            only_changes,
            last_written: Mutex::new(HashMap::new()),
        }
    }

    /// Records the current count of every registered server and returns the
    /// number of samples written.
    pub async fn sample_once(&self) -> Result<usize> {
        let timestamp = self.clock.now_millis();
        let snapshot = self.directory.snapshot();
        let mut samples: Vec<Sample> = snapshot
            .iter()
            .map(|server| Sample::new(server.name.clone(), timestamp, server.player_count))
            .collect();

        if self.only_changes {
            let last = self.last_written.lock();
            samples.retain(|s| last.get(&s.series_id) != Some(&s.value));

            // an unregistered server would otherwise keep holding its last count
            let present: HashSet<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
            for (name, &value) in last.iter() {
                if value != 0 && !present.contains(name.as_str()) {
                    samples.push(Sample::new(name.clone(), timestamp, 0));
                }
            }
        }

        let written = self.store.insert_samples(&samples).await?;

        let mut last = self.last_written.lock();
        for sample in samples {
            last.insert(sample.series_id, sample.value);
        }
        metrics::record_samples(written);
        debug!("Recorded {} player count samples", written);

        Ok(written)
    }

    /// Runs until `shutdown` flips to true. The first sample is taken one
    /// interval after start.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting sampler with interval: {:?}", self.interval);
            let mut interval = time::interval_at(Instant::now() + self.interval, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sample_once().await {
                            error!("Could not record player count: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Sampler stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Deletes samples older than the retention period. With `keep_latest`,
/// used alongside change-only sampling, each server's last value before the
/// cutoff is kept so it still carries into later months.
pub struct Pruner {
    store: Arc<dyn SampleStore>,
    clock: Arc<dyn Clock>,
    keep_months: u32,
    keep_latest: bool,
    initial_delay: Duration,
    interval: Duration,
}

impl Pruner {
    pub fn new(
        store: Arc<dyn SampleStore>,
        clock: Arc<dyn Clock>,
        keep_months: u32,
        keep_latest: bool,
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            keep_months,
            keep_latest,
            initial_delay,
            interval,
        }
    }

    pub async fn prune_once(&self) -> Result<u64> {
        let now = period::local_time(self.clock.now_millis())?;
        let cutoff = period::retention_cutoff(&now, self.keep_months)?;

        info!("Removing old records (<= {})", period::format_timestamp(cutoff));
        let affected = self.store.prune_through(cutoff, self.keep_latest).await?;
        metrics::record_pruned(affected);
        info!("Removed {} rows.", affected);

        Ok(affected)
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting pruner keeping {} months, every {:?}",
                self.keep_months, self.interval
            );
            let mut interval = time::interval_at(Instant::now() + self.initial_delay, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.prune_once().await {
                            error!("Could not remove old records: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Pruner stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::InMemoryDirectory;
    use crate::models::Window;
    use crate::store::DuckDbStore;
    use pretty_assertions::assert_eq;

    fn all() -> Window {
        Window::new(i64::MIN, i64::MAX)
    }

    #[tokio::test]
    async fn test_sample_once_writes_every_server() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_player_count("lobby", 3);
        directory.set_player_count("survival", 0);
        let clock = Arc::new(ManualClock::new(1_000));
        let sampler = Sampler::new(store.clone(), directory, clock, Duration::from_secs(60), false);

        assert_eq!(sampler.sample_once().await.unwrap(), 2);
        assert_eq!(sampler.sample_once().await.unwrap(), 2);

        let samples = store.samples_in_window(all(), None).await.unwrap();
        assert_eq!(samples.len(), 4);
        assert!(samples.iter().all(|s| s.timestamp == 1_000));
    }

    #[tokio::test]
    async fn test_only_changes() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_player_count("lobby", 3);
        directory.set_player_count("survival", 1);
        let clock = Arc::new(ManualClock::new(1_000));
        let sampler = Sampler::new(
            store.clone(),
            directory.clone(),
            clock.clone(),
            Duration::from_secs(60),
            true,
        );

        assert_eq!(sampler.sample_once().await.unwrap(), 2);
        clock.advance(60_000);
        assert_eq!(sampler.sample_once().await.unwrap(), 0);

        directory.set_player_count("lobby", 4);
        clock.advance(60_000);
        assert_eq!(sampler.sample_once().await.unwrap(), 1);

        let samples = store.samples_in_window(all(), None).await.unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::new("lobby", 1_000, 3),
                Sample::new("survival", 1_000, 1),
                Sample::new("lobby", 121_000, 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_prune_once() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        // 2024-03-15T12:00:00Z
        let now = 1_710_504_000_000;
        let clock = Arc::new(ManualClock::new(now));

        let local = period::local_time(now).unwrap();
        let cutoff = period::retention_cutoff(&local, 1).unwrap();
        store
            .insert_samples(&[
                Sample::new("lobby", cutoff - 5, 1),
                Sample::new("lobby", cutoff, 2),
                Sample::new("lobby", cutoff + 1, 3),
            ])
            .await
            .unwrap();

        let pruner = Pruner::new(
            store.clone(),
            clock,
            1,
            false,
            Duration::from_secs(5),
            Duration::from_secs(86_400),
        );
        assert_eq!(pruner.prune_once().await.unwrap(), 2);

        let left = store.samples_in_window(all(), None).await.unwrap();
        assert_eq!(left, vec![Sample::new("lobby", cutoff + 1, 3)]);
    }

    #[tokio::test]
    async fn test_prune_keeps_carried_value() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        // 2024-03-15T12:00:00Z, keep_months = 3 removes everything through November
        let now = 1_710_504_000_000;
        let clock = Arc::new(ManualClock::new(now));
        let local = period::local_time(now).unwrap();
        let cutoff = period::retention_cutoff(&local, 3).unwrap();
        let december = period::resolve_window(Some(12), &local).unwrap();
        assert!(cutoff < december.start);

        // survival has been at 9 since October, lobby changed in December
        store
            .insert_samples(&[
                Sample::new("survival", cutoff - 50 * 86_400_000, 4),
                Sample::new("survival", cutoff - 40 * 86_400_000, 9),
                Sample::new("lobby", cutoff - 86_400_000, 1),
                Sample::new("lobby", december.start + 1, 2),
            ])
            .await
            .unwrap();

        let pruner = Pruner::new(
            store.clone(),
            clock,
            3,
            true,
            Duration::from_secs(5),
            Duration::from_secs(86_400),
        );
        assert_eq!(pruner.prune_once().await.unwrap(), 1);

        let carried = store.last_samples_before(december.start, None).await.unwrap();
        assert_eq!(
            carried,
            vec![
                Sample::new("lobby", cutoff - 86_400_000, 1),
                Sample::new("survival", cutoff - 40 * 86_400_000, 9),
            ]
        );
    }

    #[tokio::test]
    async fn test_only_changes_zeroes_unregistered_server() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_player_count("lobby", 3);
        let clock = Arc::new(ManualClock::new(1_000));
        let sampler = Sampler::new(
            store.clone(),
            directory.clone(),
            clock.clone(),
            Duration::from_secs(60),
            true,
        );

        assert_eq!(sampler.sample_once().await.unwrap(), 1);
        directory.unregister("lobby");
        clock.advance(60_000);
        assert_eq!(sampler.sample_once().await.unwrap(), 1);
        clock.advance(60_000);
        assert_eq!(sampler.sample_once().await.unwrap(), 0);

        let samples = store.samples_in_window(all(), None).await.unwrap();
        assert_eq!(
            samples,
            vec![Sample::new("lobby", 1_000, 3), Sample::new("lobby", 61_000, 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_ticks_until_shutdown() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let directory = Arc::new(InMemoryDirectory::with_servers(["lobby"]));
        let clock = Arc::new(ManualClock::new(1_000));
        let sampler = Sampler::new(store.clone(), directory, clock, Duration::from_secs(60), false);

        let (tx, rx) = watch::channel(false);
        let handle = sampler.start(rx);

        time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let samples = store.samples_in_window(all(), None).await.unwrap();
        assert_eq!(samples.len(), 2);
    }
}
