//! Info command implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bend_core::{DeviceSession, SessionConfig};
use bend_types::{SampleRate, SelectionFilter};

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_info_json, format_info_text};
use crate::util::{open_transport, write_output};

pub async fn cmd_info(
    filter: SelectionFilter,
    timeout: Duration,
    session_config: SessionConfig,
    format: OutputFormat,
    quiet: bool,
    opts: &FormatOptions,
) -> Result<()> {
    let transport = open_transport(timeout).await?;
    let session = DeviceSession::builder(Arc::new(transport))
        .config(session_config.auto_reconnect(false))
        .build();

    if !quiet && matches!(format, OutputFormat::Text) {
        eprintln!("Connecting to a sensor named '{}*'...", filter.name_prefix);
    }
    session
        .connect(filter, SampleRate::default(), false)
        .await
        .context("Failed to connect to sensor")?;

    let result = read_info(&session).await;
    if let Err(e) = session.disconnect().await {
        tracing::debug!("Disconnect after info failed: {}", e);
    }
    let (info, battery) = result?;

    let content = match format {
        OutputFormat::Json => format_info_json(&info, battery, opts)?,
        OutputFormat::Text => format_info_text(&info, battery, opts),
    };
    write_output(None, &content)
}

async fn read_info(session: &DeviceSession) -> Result<(bend_types::DeviceInfo, u8)> {
    let info = session
        .read_device_info()
        .await
        .context("Failed to read device info")?;
    let battery = session
        .read_battery()
        .await
        .context("Failed to read battery level")?;
    Ok((info, battery))
}
