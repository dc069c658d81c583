//! Scan command implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use bend_types::SelectionFilter;
use tracing::info;

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_scan_json, format_scan_text};
use crate::util::{open_transport, write_output};

pub async fn cmd_scan(
    filter: SelectionFilter,
    timeout: Duration,
    format: OutputFormat,
    quiet: bool,
    opts: &FormatOptions,
) -> Result<()> {
    if !quiet && matches!(format, OutputFormat::Text) {
        eprintln!(
            "Scanning for sensors named '{}*' ({}s)...",
            filter.name_prefix,
            timeout.as_secs()
        );
    }

    let transport = open_transport(timeout).await?;
    let sensors = transport
        .scan(&filter)
        .await
        .context("Failed to scan for sensors")?;
    info!("Found {} matching sensor(s)", sensors.len());

    let content = match format {
        OutputFormat::Json => format_scan_json(&sensors, opts)?,
        OutputFormat::Text => format_scan_text(&sensors, opts),
    };
    write_output(None, &content)
}
