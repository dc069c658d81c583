//! Utility functions for CLI operations.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bend_core::{BleConfig, BleTransport};

/// Open the host's first Bluetooth adapter with the given scan duration.
pub async fn open_transport(scan_duration: Duration) -> Result<BleTransport> {
    let config = BleConfig::default().scan_duration(scan_duration);
    BleTransport::with_config(config)
        .await
        .context("Failed to open Bluetooth adapter. Is Bluetooth enabled?")
}

/// Write output to file or stdout
pub fn write_output(output: Option<&PathBuf>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }
        None => {
            print!("{}", content);
            io::stdout().flush()?;
        }
    }
    Ok(())
}
