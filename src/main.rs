use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;
mod config;
mod credentials;
mod cycle;
mod detector;
mod engine;
mod image;
mod registry;
mod replace;
#[cfg(test)]
mod testutil;
mod version;

use config::AgentConfig;
use credentials::CredentialStore;
use engine::DockerEngine;
use registry::RegistryClient;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Args::parse();
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        eprintln!("Relay config is ok.");
        return ExitCode::SUCCESS;
    }

    log::info!("Relay running with PID: {}", std::process::id());

    let credentials = Arc::new(CredentialStore::load(config.engine_config_path.as_deref()));
    let engine = match DockerEngine::connect(&config, Arc::clone(&credentials)) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Failed to connect to the container engine: {e}");
            return ExitCode::FAILURE;
        }
    };
    let registry = RegistryClient::new(credentials);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if args.once {
        cycle::run_cycle(&engine, &registry, &config, &cancel).await;
        return ExitCode::SUCCESS;
    }

    if !config.check_on_startup {
        log::info!(
            "Startup check disabled, first cycle in {:?}",
            config.check_interval
        );
        tokio::select! {
            _ = cancel.cancelled() => return ExitCode::SUCCESS,
            _ = tokio::time::sleep(config.check_interval) => {}
        }
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }
        cycle::run_cycle(&engine, &registry, &config, &cancel).await;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.check_interval) => {}
        }
    }

    log::info!("Relay stopped");
    ExitCode::SUCCESS
}

/// Cancel the cycle token on SIGINT or SIGTERM so in-flight engine calls
/// wind down before the process exits.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        log::error!("Failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        log::warn!("Shutdown signal received, cancelling");
        cancel.cancel();
    });
}
