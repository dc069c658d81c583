//! Stream command implementation.
//!
//! Connects to the first matching sensor, prints samples as they arrive and
//! feeds them into a tumbling-window aggregator. On Ctrl-C, when the duration
//! elapses, or when reconnection gives up, the session is closed and the
//! aggregated points are written out as CSV.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use owo_colors::OwoColorize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bend_core::{DeviceSession, Error, SessionConfig, SessionEvent, TimestampFormat, WindowAggregator};
use bend_types::{SampleRate, SelectionFilter};

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_sample_json, format_sample_text};
use crate::util::{open_transport, write_output};

/// Arguments for the stream command.
pub struct StreamArgs<'a> {
    pub filter: SelectionFilter,
    pub scan_timeout: Duration,
    pub rate: SampleRate,
    pub stretch: bool,
    pub window: Duration,
    pub duration: Option<Duration>,
    pub output: Option<&'a PathBuf>,
    pub timestamps: TimestampFormat,
    pub format: OutputFormat,
    pub session_config: SessionConfig,
    pub quiet: bool,
    pub opts: &'a FormatOptions,
}

/// Why the streaming loop ended.
#[derive(Debug, PartialEq)]
enum StopReason {
    Interrupted,
    DurationElapsed,
    ReconnectFailed(String),
    EventsClosed,
}

pub async fn cmd_stream(args: StreamArgs<'_>) -> Result<()> {
    let StreamArgs {
        filter,
        scan_timeout,
        rate,
        stretch,
        window,
        duration,
        output,
        timestamps,
        format,
        session_config,
        quiet,
        opts,
    } = args;

    let transport = open_transport(scan_timeout).await?;
    let session = DeviceSession::builder(Arc::new(transport))
        .config(session_config)
        .build();

    let (aggregator, _aggregate_sub) = WindowAggregator::new(window)
        .context("Invalid aggregation window")?
        .with_timestamp_format(timestamps)
        .with_secondary(stretch)
        .into_shared(session.bus());
    let (_live_sub, mut samples) = session.bus().subscribe_channel();
    let mut events = session.subscribe_events();

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    if !quiet {
        eprintln!(
            "Connecting to a sensor named '{}*' at {}{}...",
            filter.name_prefix,
            rate,
            if stretch { " with stretch" } else { "" }
        );
    }

    tokio::select! {
        result = session.connect(filter, rate, stretch) => {
            result.context("Failed to connect to sensor")?;
        }
        _ = stop.cancelled() => {
            close(&session).await;
            return Ok(());
        }
    }

    if let Some(device) = session.device()
        && !quiet
    {
        eprintln!("Streaming from {} (Ctrl-C to stop)", device);
    }
    if !session.is_streaming() {
        warn!("Sensor does not support notifications; no samples will arrive");
    }

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut received = 0u64;
    let reason = loop {
        tokio::select! {
            _ = stop.cancelled() => break StopReason::Interrupted,
            _ = &mut deadline => break StopReason::DurationElapsed,
            Some(sample) = samples.recv() => {
                received += 1;
                let line = match format {
                    OutputFormat::Json => format_sample_json(&sample)?,
                    OutputFormat::Text => format_sample_text(&sample, stretch, opts),
                };
                print!("{}", line);
            }
            event = events.recv() => match event {
                Ok(SessionEvent::ReconnectFailed { error, .. }) => {
                    break StopReason::ReconnectFailed(error);
                }
                Ok(event) => {
                    if let Some(message) = describe_event(&event, opts)
                        && !quiet
                    {
                        eprintln!("{}", message);
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("Missed {} session events", n),
                Err(RecvError::Closed) => break StopReason::EventsClosed,
            },
        }
    };
    info!("Streaming stopped: {:?}", reason);

    close(&session).await;

    let (csv, points) = {
        let mut aggregator = aggregator.lock().unwrap_or_else(|e| e.into_inner());
        let csv = aggregator.export_rows().context("Failed to export samples")?;
        (csv, aggregator.points().len())
    };
    write_output(output, &csv)?;

    if !quiet {
        eprintln!("{} samples, {} aggregated points", received, points);
        if let Some(path) = output {
            eprintln!("Export written to {}", path.display());
        }
    }

    match reason {
        StopReason::ReconnectFailed(error) => Err(anyhow!("Lost connection to sensor: {}", error)),
        _ => Ok(()),
    }
}

async fn close(session: &DeviceSession) {
    match session.disconnect().await {
        Ok(()) | Err(Error::NotPaired) => {}
        Err(e) => warn!("Disconnect failed: {}", e),
    }
}

/// User-facing line for a session event, if it deserves one.
fn describe_event(event: &SessionEvent, opts: &FormatOptions) -> Option<String> {
    let message = match event {
        SessionEvent::ReconnectStarted { device } => {
            format!("Connection to {} lost, reconnecting...", device)
        }
        SessionEvent::ReconnectSucceeded { device } => format!("Reconnected to {}", device),
        SessionEvent::NotificationsUnavailable { device, error } => {
            format!("Notifications unavailable on {}: {}", device, error)
        }
        _ => return None,
    };
    if opts.no_color {
        Some(message)
    } else {
        Some(message.yellow().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bend_core::{DisconnectReason, SessionState};
    use bend_types::DeviceHandle;

    fn device() -> DeviceHandle {
        DeviceHandle::new("AA:BB", Some("ads_knee".to_string()))
    }

    #[test]
    fn test_describe_reconnect_events() {
        let opts = FormatOptions::new(true, false);
        let started = describe_event(&SessionEvent::ReconnectStarted { device: device() }, &opts);
        assert_eq!(
            started.as_deref(),
            Some("Connection to ads_knee (AA:BB) lost, reconnecting...")
        );
        let done = describe_event(&SessionEvent::ReconnectSucceeded { device: device() }, &opts);
        assert_eq!(done.as_deref(), Some("Reconnected to ads_knee (AA:BB)"));
    }

    #[test]
    fn test_describe_ignores_routine_events() {
        let opts = FormatOptions::new(true, false);
        assert!(
            describe_event(
                &SessionEvent::StateChanged {
                    state: SessionState::Connected
                },
                &opts
            )
            .is_none()
        );
        assert!(
            describe_event(
                &SessionEvent::Disconnected {
                    device: device(),
                    reason: DisconnectReason::UserRequested
                },
                &opts
            )
            .is_none()
        );
    }
}
