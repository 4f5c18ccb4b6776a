use std::path::PathBuf;

use clap::Parser;

use crate::config::{normalize_log_level, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "printer-scene-bridge")]
#[command(version)]
#[command(about = "Switches OBS scenes when Klipper reports a tool change over Moonraker")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, value_parser = parse_log_level)]
    pub log_level: Option<String>,

    /// Validate the configuration, print a summary and exit without connecting
    #[arg(long)]
    pub check: bool,
}

fn parse_log_level(s: &str) -> Result<String, String> {
    normalize_log_level(s)
        .map(str::to_string)
        .map_err(|e| e.to_string())
}

/// Pick the log filter: `RUST_LOG` wins, then the CLI flag, then the config.
pub fn resolve_log_filter(env: Option<&str>, cli: Option<&str>, config: Option<&str>) -> String {
    env.filter(|s| !s.trim().is_empty())
        .or(cli)
        .or(config)
        .unwrap_or("info")
        .to_string()
}
