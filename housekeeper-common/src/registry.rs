use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobAction, Outcome};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a job named {0} is already registered")]
    DuplicateName(String),
    #[error("job {0} must have a period greater than zero")]
    InvalidPeriod(String),
    #[error("no job named {0} is registered")]
    NotFound(String),
    #[error("job {0} is already running")]
    AlreadyRunning(String),
}

/// Runtime bookkeeping for a registered job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_due_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    /// Set while an invocation is in flight.
    pub running_since: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_run_at: None,
            next_due_at: now,
            consecutive_failures: 0,
            running_since: None,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.running_since.is_some()
    }
}

struct Entry {
    job: Job,
    step: chrono::Duration,
    record: JobRecord,
}

/// The fixed catalog of maintenance jobs, kept in registration order.
#[derive(Default)]
pub struct JobRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job that becomes due immediately.
    pub fn register(
        &mut self,
        name: &str,
        period: time::Duration,
        action: Arc<dyn JobAction>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_owned()));
        }

        let step = match chrono::Duration::from_std(period) {
            Ok(step) if step > chrono::Duration::zero() => step,
            _ => return Err(RegistryError::InvalidPeriod(name.to_owned())),
        };

        self.index.insert(name.to_owned(), self.entries.len());
        self.entries.push(Entry {
            job: Job {
                name: name.to_owned(),
                period,
                action,
            },
            step,
            record: JobRecord::new(now),
        });

        Ok(())
    }

    /// Jobs whose next run has arrived and that are not already running, in registration order.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.entries
            .iter()
            .filter(|entry| !entry.record.in_flight() && entry.record.next_due_at <= now)
            .map(|entry| entry.job.clone())
            .collect()
    }

    pub fn mark_started(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let entry = self.entry_mut(name)?;

        if entry.record.in_flight() {
            return Err(RegistryError::AlreadyRunning(name.to_owned()));
        }
        entry.record.running_since = Some(now);

        Ok(())
    }

    /// Close out an invocation and schedule the next one.
    ///
    /// The next window is one period after the window this run was dispatched for, so the time
    /// a run takes doesn't accumulate into the cycle. A run that overran that window pushes back
    /// only its own job to a full period after `now`; missed windows are never caught up.
    pub fn mark_completed(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<(), RegistryError> {
        let entry = self.entry_mut(name)?;
        let record = &mut entry.record;

        let next_window = record.next_due_at + entry.step;
        record.running_since = None;
        record.last_run_at = Some(now);
        record.next_due_at = if next_window < now {
            now + entry.step
        } else {
            next_window
        };
        record.consecutive_failures = match outcome {
            Outcome::Success => 0,
            Outcome::Failure => record.consecutive_failures.saturating_add(1),
        };

        Ok(())
    }

    pub fn record(&self, name: &str) -> Option<&JobRecord> {
        self.index.get(name).map(|&i| &self.entries[i].record)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = (&Job, &JobRecord)> {
        self.entries.iter().map(|entry| (&entry.job, &entry.record))
    }

    /// Names of running jobs with the time each invocation started.
    pub fn in_flight(&self) -> Vec<(String, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .record
                    .running_since
                    .map(|since| (entry.job.name.clone(), since))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut Entry, RegistryError> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.entries[i]),
            None => Err(RegistryError::NotFound(name.to_owned())),
        }
    }
}
