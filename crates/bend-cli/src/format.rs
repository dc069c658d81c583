//! Output formatting for text and JSON output.

use anyhow::Result;
use bend_core::DiscoveredSensor;
use bend_types::{DeviceInfo, Sample};
use owo_colors::OwoColorize;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Use compact JSON output (no pretty-printing).
    pub compact: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool, compact: bool) -> Self {
        Self { no_color, compact }
    }

    /// Serialize value to JSON string, respecting compact option.
    pub fn as_json<T: serde::Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        Ok(json + "\n")
    }

    fn label(&self, text: &str) -> String {
        if self.no_color {
            text.to_string()
        } else {
            text.bold().to_string()
        }
    }
}

fn format_value(value: Option<f32>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:>8.2}{}", v, unit),
        None => format!("{:>8}{}", "--", unit),
    }
}

// ============================================================================
// Scan formatting
// ============================================================================

pub fn format_scan_json(sensors: &[DiscoveredSensor], opts: &FormatOptions) -> Result<String> {
    #[derive(Serialize)]
    struct ScanResult<'a> {
        count: usize,
        sensors: Vec<SensorJson<'a>>,
    }

    #[derive(Serialize)]
    struct SensorJson<'a> {
        name: Option<&'a str>,
        identifier: &'a str,
        address: &'a str,
        rssi: Option<i16>,
    }

    let result = ScanResult {
        count: sensors.len(),
        sensors: sensors
            .iter()
            .map(|s| SensorJson {
                name: s.handle.name.as_deref(),
                identifier: &s.handle.id,
                address: &s.address,
                rssi: s.rssi,
            })
            .collect(),
    };

    opts.as_json(&result)
}

#[must_use]
pub fn format_scan_text(sensors: &[DiscoveredSensor], opts: &FormatOptions) -> String {
    if sensors.is_empty() {
        return "No ADS sensors found.\n".to_string();
    }

    let mut output = format!(
        "Found {} sensor{}:\n\n",
        sensors.len(),
        if sensors.len() == 1 { "" } else { "s" }
    );
    output.push_str(&opts.label(&format!(
        "{:<24} {:<40} {:>6}",
        "NAME", "IDENTIFIER", "RSSI"
    )));
    output.push('\n');
    for sensor in sensors {
        let rssi = sensor
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "--".to_string());
        output.push_str(&format!(
            "{:<24} {:<40} {:>6}\n",
            sensor.handle.name.as_deref().unwrap_or("(unnamed)"),
            sensor.handle.id,
            rssi
        ));
    }
    output
}

// ============================================================================
// Sample formatting
// ============================================================================

#[must_use]
pub fn format_sample_text(sample: &Sample, stretch: bool, opts: &FormatOptions) -> String {
    let time = sample
        .timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| sample.timestamp.unix_timestamp().to_string());
    let seq = format!("#{:<6}", sample.sequence);
    let seq = if opts.no_color {
        seq
    } else {
        seq.dimmed().to_string()
    };
    let mut line = format!("{} {} angle {}", seq, time, format_value(sample.angle, "°"));
    if stretch {
        line.push_str(&format!("  stretch {}", format_value(sample.stretch, " mm")));
    }
    line.push('\n');
    line
}

/// One sample per line, always compact so the output is valid JSON Lines.
pub fn format_sample_json(sample: &Sample) -> Result<String> {
    Ok(serde_json::to_string(sample)? + "\n")
}

// ============================================================================
// Info formatting
// ============================================================================

#[derive(Serialize)]
struct InfoJson<'a> {
    #[serde(flatten)]
    info: &'a DeviceInfo,
    battery: u8,
}

pub fn format_info_json(info: &DeviceInfo, battery: u8, opts: &FormatOptions) -> Result<String> {
    opts.as_json(&InfoJson { info, battery })
}

#[must_use]
pub fn format_info_text(info: &DeviceInfo, battery: u8, opts: &FormatOptions) -> String {
    let rows = [
        ("Name", info.name.as_str()),
        ("Sensor type", info.sensor_type.as_str()),
        ("Manufacturer", info.manufacturer.as_str()),
        ("Firmware", info.firmware.as_str()),
        ("Hardware", info.hardware.as_str()),
        ("Software", info.software.as_str()),
    ];

    let mut output = String::new();
    for (label, value) in rows {
        let value = if value.is_empty() { "--" } else { value };
        output.push_str(&format!(
            "{} {}\n",
            opts.label(&format!("{:<13}", label)),
            value
        ));
    }

    let battery_text = format!("{}%", battery);
    let battery_text = match (opts.no_color, battery) {
        (true, _) => battery_text,
        (false, 0..=15) => battery_text.red().to_string(),
        (false, 16..=40) => battery_text.yellow().to_string(),
        (false, _) => battery_text.green().to_string(),
    };
    output.push_str(&format!(
        "{} {}\n",
        opts.label(&format!("{:<13}", "Battery")),
        battery_text
    ));
    output
}
