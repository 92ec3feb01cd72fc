use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::job::Outcome;

/// One completed invocation of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MetricSample {
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.duration_ms as i64)
    }
}

/// Lifetime counters for a job. Not affected by sample eviction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTotals {
    pub completed: u64,
    pub failed: u64,
}

/// Keeps the most recent samples of each job, evicting the oldest past `capacity`.
pub struct SampleStore {
    capacity: usize,
    samples: HashMap<String, VecDeque<MetricSample>>,
    totals: HashMap<String, JobTotals>,
}

impl SampleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: HashMap::new(),
            totals: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&mut self, sample: MetricSample) {
        let totals = self.totals.entry(sample.job_name.clone()).or_default();
        match sample.outcome {
            Outcome::Success => totals.completed += 1,
            Outcome::Failure => totals.failed += 1,
        }

        let retained = self.samples.entry(sample.job_name.clone()).or_default();
        retained.push_back(sample);
        while retained.len() > self.capacity {
            retained.pop_front();
        }
    }

    /// Up to `limit` of the most recent samples for `job`, oldest first.
    pub fn samples(&self, job: &str, limit: usize) -> Vec<MetricSample> {
        match self.samples.get(job) {
            Some(retained) => {
                let skip = retained.len().saturating_sub(limit);
                retained.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn totals(&self, job: &str) -> JobTotals {
        self.totals.get(job).copied().unwrap_or_default()
    }
}
