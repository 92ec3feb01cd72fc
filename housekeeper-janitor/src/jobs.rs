use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use housekeeper_common::job::{JobAction, JobFailure};
use housekeeper_common::scheduler::{Scheduler, SchedulerError};
use tracing::{debug, info};

use crate::config::Config;

/// Removes stale files from a scratch directory.
pub struct ScratchSweeper {
    dir: PathBuf,
    max_age: Duration,
}

impl ScratchSweeper {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        ScratchSweeper {
            dir: dir.into(),
            max_age,
        }
    }

    /// Delete regular files last modified at least `max_age` ago and return how many were removed.
    /// Subdirectories are left alone and a missing directory has nothing to sweep.
    pub async fn sweep(&self) -> Result<usize, JobFailure> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(JobFailure::new(format!(
                    "failed to read {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed stale scratch file");
                    removed += 1;
                }
                // Another process got there first.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl JobAction for ScratchSweeper {
    async fn run(&self) -> Result<(), JobFailure> {
        let removed = self.sweep().await?;
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "swept scratch directory");
        }
        metrics::counter!("housekeeper_scratch_files_removed_total").increment(removed as u64);
        Ok(())
    }
}

/// Reports that the janitor is alive.
pub struct Heartbeat {
    started: Instant,
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            started: Instant::now(),
            beats: AtomicU64::new(0),
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobAction for Heartbeat {
    async fn run(&self) -> Result<(), JobFailure> {
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        let uptime = self.started.elapsed();

        info!(beat, uptime_secs = uptime.as_secs(), "janitor heartbeat");
        metrics::gauge!("housekeeper_uptime_seconds").set(uptime.as_secs_f64());
        Ok(())
    }
}

/// Register the built-in maintenance jobs.
pub async fn register_all(scheduler: &Scheduler, config: &Config) -> Result<(), SchedulerError> {
    scheduler
        .register(
            "scratch-sweep",
            Duration::from_secs(config.scratch_sweep_interval_secs),
            ScratchSweeper::new(
                &config.scratch_dir,
                Duration::from_secs(config.scratch_max_age_secs),
            ),
        )
        .await?;

    scheduler
        .register(
            "heartbeat",
            Duration::from_secs(config.heartbeat_interval_secs),
            Heartbeat::new(),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;
    use housekeeper_common::scheduler::SchedulerConfig;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sweep_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"a").unwrap();
        std::fs::write(dir.path().join("b.tmp"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let keep_all = ScratchSweeper::new(dir.path(), Duration::from_secs(3600));
        assert_eq!(keep_all.sweep().await.unwrap(), 0);

        let remove_all = ScratchSweeper::new(dir.path(), Duration::ZERO);
        assert_eq!(remove_all.sweep().await.unwrap(), 2);

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(remaining, vec!["nested"]);
    }

    #[tokio::test]
    async fn test_sweep_of_missing_directory_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = ScratchSweeper::new(dir.path().join("absent"), Duration::ZERO);

        assert_eq!(sweeper.run().await, Ok(()));
    }

    #[tokio::test]
    async fn test_heartbeat_counts_beats() {
        let heartbeat = Heartbeat::new();

        heartbeat.run().await.unwrap();
        heartbeat.run().await.unwrap();

        assert_eq!(heartbeat.beats(), 2);
    }

    #[tokio::test]
    async fn test_register_all() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();

        register_all(&scheduler, &config).await.unwrap();

        let names: Vec<String> = scheduler
            .status()
            .await
            .jobs
            .into_iter()
            .map(|job| job.name)
            .collect();
        assert_eq!(names, vec!["scratch-sweep", "heartbeat"]);
    }
}
