use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use printer_scene_bridge::cli::{resolve_log_filter, Args};
use printer_scene_bridge::{Bridge, Config, MoonrakerConnector, ObsClient};

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_summary(config: &Config) {
    println!("printer:   {}", config.printer.url().split('?').next().unwrap_or_default());
    println!("obs:       {}", config.obs.url());
    for (event, scene) in &config.scenes {
        println!("scene:     {event} -> {scene}");
    }
    println!(
        "triggers:  \"{}\" / \"{}\"",
        config.triggers.tool_change_started, config.triggers.tool_change_completed
    );
    println!("log level: {}", config.log_level);
    println!("auto-switch: {}", config.auto_switch);
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let loaded = Config::load(&args.config);

    let env_filter = std::env::var("RUST_LOG").ok();
    let config_level = loaded.as_ref().ok().map(|c| c.log_level.as_str());
    init_tracing(&resolve_log_filter(
        env_filter.as_deref(),
        args.log_level.as_deref(),
        config_level,
    ));

    let config = match loaded {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    if args.check {
        print_summary(&config);
        return ExitCode::SUCCESS;
    }

    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "starting printer scene bridge");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let action = ObsClient::new(config.obs.clone());
    let telemetry = MoonrakerConnector::new(config.printer.clone());
    match Bridge::new(Arc::clone(&config), action, telemetry).run(shutdown_rx).await {
        Ok(report) => {
            info!(final_state = %report.final_state(), "exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "bridge failed");
            ExitCode::from(1)
        }
    }
}
