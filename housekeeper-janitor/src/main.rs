use std::process::ExitCode;

use axum::Router;
use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use envconfig::Envconfig;
use eyre::{eyre, Result, WrapErr};
use futures::future::{select, Either};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use housekeeper_common::metrics;
use housekeeper_common::scheduler::{DrainReport, Scheduler};

mod cli;
mod config;
mod handlers;
mod jobs;

const EXIT_CLEAN: u8 = 0;
/// Exit code when jobs were still running past the drain timeout and had to be aborted.
const EXIT_ABANDONED_JOBS: u8 = 2;

async fn listen(app: Router, bind: String, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c, {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM, {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn start(config: Config) -> Result<ExitCode> {
    let scheduler = Scheduler::new(config.scheduler_config())?;
    jobs::register_all(&scheduler, &config).await?;

    let shutdown = CancellationToken::new();
    let recorder_handle =
        metrics::setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let app = handlers::app(scheduler.clone(), shutdown.clone(), Some(recorder_handle));

    scheduler.start().await?;
    let http_server = Box::pin(listen(app, config.bind(), shutdown.clone()));
    let stop_token = shutdown.clone();
    let stop_requested = Box::pin(async move {
        tokio::select! {
            _ = shutdown_signal() => info!("received shutdown signal"),
            _ = stop_token.cancelled() => {},
        }
    });

    let first = select(http_server, stop_requested).await;
    let requested = shutdown.is_cancelled();
    shutdown.cancel();
    let report = scheduler.stop().await?;

    match first {
        Either::Left((Err(e), _)) => {
            return Err(e.wrap_err("housekeeper-janitor http server exited"));
        }
        // Graceful shutdown only completes once a stop was requested.
        Either::Left((Ok(()), _)) if requested => {}
        Either::Left((Ok(()), _)) => {
            return Err(eyre!("housekeeper-janitor http server exited unexpectedly"));
        }
        Either::Right(((), http_server)) => {
            if let Err(e) = http_server.await {
                error!("housekeeper-janitor http server failed to shut down, {}", e);
            }
        }
    }

    Ok(ExitCode::from(drain_exit_code(&report)))
}

/// Exit status of a `start` that ran until stopped.
fn drain_exit_code(report: &DrainReport) -> u8 {
    if report.is_clean() {
        EXIT_CLEAN
    } else {
        EXIT_ABANDONED_JOBS
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration from env, {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Command::Start) {
        Command::Start => start(config).await,
        Command::Stop { url } => cli::stop(&url.unwrap_or_else(|| config.local_url()))
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Status { url } => cli::status(&url.unwrap_or_else(|| config.local_url()))
            .await
            .map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("housekeeper-janitor failed: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_exit_code() {
        assert_eq!(drain_exit_code(&DrainReport::default()), 0);

        let report = DrainReport {
            abandoned: vec!["scratch-sweep".to_owned()],
        };
        assert_eq!(drain_exit_code(&report), 2);
    }
}
