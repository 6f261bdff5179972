//! VIP controller binary

use clap::Parser;
use common::logging::{self, LogFormat};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vip_controller::cli::{Cli, Commands, NotifyArgs, RunArgs};
use vip_controller::notify::send_transition;
use vip_controller::{Config, Controller, VipMap};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Notify(args) => notify(args).await,
    }
}

async fn run(args: RunArgs) -> ExitCode {
    // Tracing is not up until the config is read.
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut config, &args);

    logging::init_with(
        config.logging.level.as_deref().unwrap_or("info"),
        LogFormat::from_name(config.logging.format.as_deref()),
    );

    let Some(node_name) = config.controller.node_name.clone() else {
        error!("Node name is required (--node-name or NODE_NAME)");
        return ExitCode::FAILURE;
    };

    let vip_map = match VipMap::load(&config.controller.vip_map) {
        Ok(map) => map,
        Err(e) => {
            error!(path = %config.controller.vip_map, error = %e, "Cannot load VIP map");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let controller = Controller::new(config, node_name, vip_map);
    let mut controller_handle = tokio::spawn(controller.run(cancel.child_token()));

    let result = tokio::select! {
        out = &mut controller_handle => out,
        _ = shutdown_signal() => {
            cancel.cancel();
            controller_handle.await
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("Exiting...");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!(error = %e, "Controller failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Controller task panicked");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(node) = &args.node_name {
        config.controller.node_name = Some(node.clone());
    }
    if let Some(path) = &args.vip_map {
        config.controller.vip_map = path.clone();
    }
    if let Some(ns) = &args.namespace {
        config.watch.namespace = Some(ns.clone());
    }
    if args.use_unicast {
        config.keepalived.use_unicast = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = Some(level.clone());
    }
}

/// Runs as keepalived's notify script; reports the transition and exits.
async fn notify(args: NotifyArgs) -> ExitCode {
    let transition = match args.transition() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    match send_transition(&args.socket, &transition).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Cannot report transition to {}: {}", args.socket.display(), e);
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
