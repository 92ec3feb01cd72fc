use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use housekeeper_common::scheduler::SchedulerStatus;

#[derive(Debug, Parser)]
#[command(name = "housekeeper-janitor", about = "Runs periodic maintenance jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler and its HTTP endpoints until stopped (the default).
    Start,
    /// Ask a running janitor to drain its jobs and exit.
    Stop {
        /// Base URL of the running janitor. Defaults to this host's BIND_PORT.
        #[arg(long)]
        url: Option<String>,
    },
    /// Print each job's last run, next due time and consecutive failures.
    Status {
        /// Base URL of the running janitor. Defaults to this host's BIND_PORT.
        #[arg(long)]
        url: Option<String>,
    },
}

pub async fn stop(base_url: &str) -> Result<()> {
    reqwest::Client::new()
        .post(format!("{}/stop", base_url))
        .send()
        .await
        .wrap_err_with(|| format!("failed to reach janitor at {}", base_url))?
        .error_for_status()?;

    println!("stop requested");
    Ok(())
}

pub async fn status(base_url: &str) -> Result<()> {
    let status: SchedulerStatus = reqwest::get(format!("{}/status", base_url))
        .await
        .wrap_err_with(|| format!("failed to reach janitor at {}", base_url))?
        .error_for_status()?
        .json()
        .await
        .wrap_err("janitor returned an unreadable status")?;

    print!("{}", format_status(&status));
    Ok(())
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "never".to_owned())
}

pub fn format_status(status: &SchedulerStatus) -> String {
    let width = status
        .jobs
        .iter()
        .map(|job| job.name.len())
        .chain(std::iter::once("JOB".len()))
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "scheduler: {:?}", status.state);
    let _ = writeln!(
        out,
        "{:<width$}  {:<20}  {:<20}  {:>8}  {}",
        "JOB", "LAST RUN", "NEXT DUE", "FAILURES", "IN FLIGHT"
    );
    for job in &status.jobs {
        let _ = writeln!(
            out,
            "{:<width$}  {:<20}  {:<20}  {:>8}  {}",
            job.name,
            timestamp(job.last_run_at),
            timestamp(Some(job.next_due_at)),
            job.consecutive_failures,
            if job.in_flight { "yes" } else { "no" },
        );
    }
    out
}
