use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// A descriptive failure returned by a job action.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct JobFailure {
    message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        JobFailure::new(message)
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        JobFailure::new(message)
    }
}

impl From<std::io::Error> for JobFailure {
    fn from(error: std::io::Error) -> Self {
        JobFailure::new(error.to_string())
    }
}

/// The body of a maintenance job.
///
/// Actions perform their side effect and report success or a descriptive failure. They must not
/// schedule or retry themselves: the scheduler decides when they run next.
#[async_trait]
pub trait JobAction: Send + Sync {
    async fn run(&self) -> Result<(), JobFailure>;
}

#[async_trait]
impl<F, Fut> JobAction for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobFailure>> + Send,
{
    async fn run(&self) -> Result<(), JobFailure> {
        (self)().await
    }
}

/// A named action and the fixed period it runs on.
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub period: time::Duration,
    pub action: Arc<dyn JobAction>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl<T> From<&Result<T, JobFailure>> for Outcome {
    fn from(result: &Result<T, JobFailure>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
