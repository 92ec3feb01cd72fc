//! Tick-driven execution of registered maintenance jobs.
//!
//! Every tick the scheduler asks the registry which jobs are due, marks them in flight and
//! dispatches each action onto its own task. Failures, panics and timeouts are recorded as
//! samples and never stop the loop or other jobs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::job::{Job, JobAction, JobFailure, Outcome};
use crate::metrics;
use crate::registry::{JobRegistry, RegistryError};
use crate::samples::{JobTotals, MetricSample, SampleStore};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Base resolution of the tick loop. Should be finer than any job period.
    pub tick_interval: Duration,
    /// Soft limit on a single invocation; slower runs are cancelled and recorded as failures.
    pub job_timeout: Duration,
    /// How long `stop` waits for in-flight jobs before abandoning them.
    pub drain_timeout: Duration,
    /// Samples retained per job.
    pub sample_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            sample_retention: 100,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("jobs can only be registered while the scheduler is stopped")]
    RegistrationClosed,
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    /// Stop was requested and in-flight jobs are being awaited.
    Draining,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub period_secs: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_due_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub in_flight: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub totals: JobTotals,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub jobs: Vec<JobStatus>,
}

/// What happened to in-flight work during `stop`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs still running when the drain timeout elapsed. They were aborted.
    pub abandoned: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct Shared {
    config: SchedulerConfig,
    clock: Clock,
    registry: Mutex<JobRegistry>,
    samples: Mutex<SampleStore>,
    state: watch::Sender<SchedulerState>,
}

struct Runner {
    shutdown: CancellationToken,
    handle: JoinHandle<DrainReport>,
}

/// Handle to a job scheduler. Clones share the same jobs, samples and tick loop.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    runner: Arc<Mutex<Option<Runner>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.tick_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "tick interval must be greater than zero".to_owned(),
            ));
        }
        if config.job_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "job timeout must be greater than zero".to_owned(),
            ));
        }

        let (state, _) = watch::channel(SchedulerState::Stopped);
        let samples = SampleStore::new(config.sample_retention);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock: Clock::new(),
                registry: Mutex::new(JobRegistry::new()),
                samples: Mutex::new(samples),
                state,
            }),
            runner: Arc::new(Mutex::new(None)),
        })
    }

    /// Register a job. It first runs on the first tick after `start`.
    pub async fn register<A>(
        &self,
        name: &str,
        period: Duration,
        action: A,
    ) -> Result<(), SchedulerError>
    where
        A: JobAction + 'static,
    {
        // Held across the registry update so `start` can't begin in between.
        let runner = self.runner.lock().await;
        if runner.is_some() {
            return Err(SchedulerError::RegistrationClosed);
        }

        let now = self.shared.clock.now();
        self.shared
            .registry
            .lock()
            .await
            .register(name, period, Arc::new(action), now)?;
        drop(runner);

        info!(job = name, period_secs = period.as_secs_f64(), "registered job");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let jobs = self.shared.registry.lock().await.len();
        let shutdown = CancellationToken::new();
        self.shared.state.send_replace(SchedulerState::Running);
        let handle = tokio::spawn(tick_loop(Arc::clone(&self.shared), shutdown.clone()));
        *runner = Some(Runner { shutdown, handle });

        info!(
            jobs,
            tick_interval_ms = self.shared.config.tick_interval.as_millis() as u64,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop issuing new invocations and wait for in-flight jobs to finish.
    ///
    /// Jobs still running after the drain timeout are aborted and recorded as failures. When this
    /// returns no job is in flight.
    pub async fn stop(&self) -> Result<DrainReport, SchedulerError> {
        let mut runner = self.runner.lock().await;
        let Runner { shutdown, handle } = runner.take().ok_or(SchedulerError::NotRunning)?;

        self.shared.state.send_replace(SchedulerState::Draining);
        shutdown.cancel();

        let report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                error!("scheduler tick loop exited abnormally: {}", e);
                self.shared
                    .abandon_in_flight("scheduler stopped abnormally")
                    .await
            }
        };

        self.shared.state.send_replace(SchedulerState::Stopped);
        if report.is_clean() {
            info!("scheduler stopped");
        } else {
            warn!(abandoned = ?report.abandoned, "scheduler stopped with abandoned jobs");
        }

        Ok(report)
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.shared.state.subscribe()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let registry = self.shared.registry.lock().await;
        let samples = self.shared.samples.lock().await;

        let jobs = registry
            .jobs()
            .map(|(job, record)| JobStatus {
                name: job.name.clone(),
                period_secs: job.period.as_secs_f64(),
                last_run_at: record.last_run_at,
                next_due_at: record.next_due_at,
                consecutive_failures: record.consecutive_failures,
                in_flight: record.in_flight(),
                running_since: record.running_since,
                totals: samples.totals(&job.name),
            })
            .collect();

        SchedulerStatus {
            state: self.state(),
            jobs,
        }
    }

    /// The most recent samples of a job, oldest first.
    pub async fn samples(
        &self,
        job: &str,
        limit: usize,
    ) -> Result<Vec<MetricSample>, SchedulerError> {
        if !self.shared.registry.lock().await.contains(job) {
            return Err(RegistryError::NotFound(job.to_owned()).into());
        }

        Ok(self.shared.samples.lock().await.samples(job, limit))
    }
}

async fn tick_loop(shared: Arc<Shared>, shutdown: CancellationToken) -> DrainReport {
    let mut ticker = tokio::time::interval(shared.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join_error(joined);
            }
            _ = ticker.tick() => shared.tick(&mut in_flight).await,
        }
    }

    shared.drain(in_flight).await
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!("job task failed: {}", e);
        }
    }
}

async fn join_all(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(joined);
    }
}

impl Shared {
    async fn tick(self: &Arc<Self>, in_flight: &mut JoinSet<()>) {
        let now = self.clock.now();

        let started: Vec<Job> = {
            let mut registry = self.registry.lock().await;
            registry
                .due_jobs(now)
                .into_iter()
                .filter(|job| match registry.mark_started(&job.name, now) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(job = %job.name, "skipping due job: {}", e);
                        false
                    }
                })
                .collect()
        };

        for job in started {
            debug!(job = %job.name, "dispatching job");
            metrics::set_job_in_flight(&job.name, true);
            in_flight.spawn(Arc::clone(self).invoke(job, now));
        }
    }

    async fn invoke(self: Arc<Self>, job: Job, started_at: DateTime<Utc>) {
        let timeout = self.config.job_timeout;
        let start = Instant::now();

        let run = AssertUnwindSafe(job.action.run()).catch_unwind();
        let result = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobFailure::new("job panicked")),
            Err(_) => Err(JobFailure::new(format!(
                "job timed out after {:?}",
                timeout
            ))),
        };

        self.complete(&job.name, started_at, start.elapsed(), result)
            .await;
    }

    async fn complete(
        &self,
        name: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        result: Result<(), JobFailure>,
    ) {
        let outcome = Outcome::from(&result);
        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(()) => info!(job = name, elapsed_ms, "job completed"),
            Err(e) => warn!(job = name, elapsed_ms, error = %e, "job failed"),
        }

        // The sample is stored before the in-flight flag clears, so a run aborted while
        // completing is still picked up by `abandon_in_flight`.
        let failures = {
            let mut registry = self.registry.lock().await;
            self.samples.lock().await.record(MetricSample {
                job_name: name.to_owned(),
                started_at,
                duration_ms: elapsed_ms,
                outcome,
                error_message: result.err().map(|e| e.message().to_owned()),
            });

            let finished_at = self.clock.now();
            if let Err(e) = registry.mark_completed(name, finished_at, outcome) {
                error!(job = name, "failed to record job completion: {}", e);
            }
            registry
                .record(name)
                .map(|record| record.consecutive_failures)
                .unwrap_or_default()
        };

        metrics::record_job_execution(name, outcome, elapsed);
        metrics::set_job_in_flight(name, false);
        metrics::set_consecutive_failures(name, failures);
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) -> DrainReport {
        if in_flight.is_empty() {
            return DrainReport::default();
        }

        info!(pending = in_flight.len(), "waiting for in-flight jobs");
        if tokio::time::timeout(self.config.drain_timeout, join_all(&mut in_flight))
            .await
            .is_ok()
        {
            return DrainReport::default();
        }

        in_flight.shutdown().await;
        self.abandon_in_flight("job abandoned at shutdown").await
    }

    /// Record every job still marked in flight as a failed run.
    async fn abandon_in_flight(&self, reason: &str) -> DrainReport {
        let now = self.clock.now();

        let abandoned = {
            let mut registry = self.registry.lock().await;
            let running = registry.in_flight();
            for (name, _) in &running {
                if let Err(e) = registry.mark_completed(name, now, Outcome::Failure) {
                    error!(job = %name, "failed to clear abandoned job: {}", e);
                }
            }
            running
        };

        let mut samples = self.samples.lock().await;
        for (name, since) in &abandoned {
            warn!(job = %name, "{}", reason);
            let duration_ms = (now - *since).num_milliseconds().max(0) as u64;
            samples.record(MetricSample {
                job_name: name.clone(),
                started_at: *since,
                duration_ms,
                outcome: Outcome::Failure,
                error_message: Some(reason.to_owned()),
            });
            metrics::set_job_in_flight(name, false);
        }

        DrainReport {
            abandoned: abandoned.into_iter().map(|(name, _)| name).collect(),
        }
    }
}
