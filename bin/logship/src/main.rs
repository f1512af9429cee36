//! Log shipper.
//!
//! Reads newline-delimited JSON from standard input, where each line is either a log entry or a lifecycle state change
//! of a destination, and ships the entries to their destinations.

#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use clap::Parser as _;
use logship_app::prelude::*;
use logship_components::controller::{Controller, DefaultClientBuilder};
use logship_config::Configuration;
use logship_core::LogClient as _;
use logship_error::{ErrorContext as _, GenericError};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    select, signal,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
use self::config::{load_configuration, Cli};

mod input;
use self::input::{parse_input, Input};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = load_configuration(&cli.config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));

    let guard = initialize_logging(config.log_level)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {}", e)));

    match run(config).await {
        Ok(()) => info!("logship stopped."),
        Err(e) => {
            error!("{:?}", e);
            drop(guard);
            std::process::exit(1);
        }
    }
}

async fn run(config: Configuration) -> Result<(), GenericError> {
    let shutdown = CancellationToken::new();
    let builder = Arc::new(DefaultClientBuilder::new(&config, shutdown.clone()));
    let controller = Controller::new(&config, builder, shutdown.clone())
        .await
        .error_context("Failed to create controller.")?;

    info!(url = %config.client.url, "logship started.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let graceful = loop {
        select! {
            _ = &mut ctrl_c => break false,
            line = lines.next_line() => match line.error_context("Failed to read from standard input.")? {
                Some(line) => process_line(&controller, &line).await,
                None => break true,
            },
        }
    };

    if graceful {
        info!("Input exhausted. Stopping gracefully...");
        controller.stop_wait().await;
    } else {
        info!("Received interrupt. Stopping...");
        controller.stop().await;
    }

    shutdown.cancel();
    Ok(())
}

async fn process_line(controller: &Controller, line: &str) {
    let input = match parse_input(line) {
        Ok(Some(input)) => input,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Skipping malformed input line.");
            return;
        }
    };

    let result = match input {
        Input::Entry { labels, timestamp, line } => controller.handle(labels, timestamp, line).await,
        Input::Notification { destination, state } => controller.notify(destination, state).await,
    };

    if let Err(e) = result {
        warn!(error = %e, "Failed to process input.");
    }
}
