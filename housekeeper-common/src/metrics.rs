use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::job::Outcome;

const JOB_DURATION_METRIC: &str = "housekeeper_job_duration_seconds";

/// Bucket bounds for job durations, from a few milliseconds up to the default job timeout.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Install a global Prometheus recorder and return the handle used to render it.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(JOB_DURATION_METRIC.to_string()),
            JOB_DURATION_BUCKETS,
        )?
        .install_recorder()
}

pub fn record_job_execution(job: &str, outcome: Outcome, elapsed: Duration) {
    metrics::counter!(
        "housekeeper_job_runs_total",
        "job" => job.to_owned(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(
        JOB_DURATION_METRIC,
        "job" => job.to_owned(),
        "outcome" => outcome.as_str()
    )
    .record(elapsed.as_secs_f64());
}

pub fn set_job_in_flight(job: &str, in_flight: bool) {
    let value = if in_flight { 1.0 } else { 0.0 };
    metrics::gauge!("housekeeper_job_in_flight", "job" => job.to_owned()).set(value);
}

pub fn set_consecutive_failures(job: &str, failures: u32) {
    metrics::gauge!("housekeeper_job_consecutive_failures", "job" => job.to_owned())
        .set(failures as f64);
}
