//! `bend`: command-line client for Bend Labs ADS angle sensors.

mod cli;
mod commands;
mod config;
mod format;
mod util;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigAction};
use commands::{StreamArgs, cmd_info, cmd_scan, cmd_stream};
use config::{
    Config, resolve_filter, resolve_rate, resolve_scan_timeout, resolve_timestamps,
    resolve_window,
};
use format::FormatOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();
    let opts = FormatOptions::new(cli.no_color || config.no_color, cli.compact);

    match cli.command {
        Commands::Scan { sensor, format } => {
            cmd_scan(
                resolve_filter(sensor.prefix, &config),
                resolve_scan_timeout(sensor.timeout, &config),
                format,
                cli.quiet,
                &opts,
            )
            .await?;
        }
        Commands::Stream {
            sensor,
            rate,
            stretch,
            window,
            duration,
            output,
            timestamps,
            format,
        } => {
            cmd_stream(StreamArgs {
                filter: resolve_filter(sensor.prefix, &config),
                scan_timeout: resolve_scan_timeout(sensor.timeout, &config),
                rate: resolve_rate(rate, &config)?,
                stretch: stretch || config.stretch,
                window: resolve_window(window, &config),
                duration: duration.map(Duration::from_secs),
                output: output.as_ref(),
                timestamps: resolve_timestamps(timestamps, &config),
                format,
                session_config: config.session_config()?,
                quiet: cli.quiet,
                opts: &opts,
            })
            .await?;
        }
        Commands::Info { sensor, format } => {
            cmd_info(
                resolve_filter(sensor.prefix, &config),
                resolve_scan_timeout(sensor.timeout, &config),
                config.session_config()?,
                format,
                cli.quiet,
                &opts,
            )
            .await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Path => {
                println!("{}", Config::path().display());
            }
            ConfigAction::Init => {
                let path = Config::path();
                if path.exists() {
                    println!("Config already exists at {}", path.display());
                } else {
                    Config::default().save()?;
                    println!("Created config at {}", path.display());
                }
            }
        },
    }

    Ok(())
}
