//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use bend_types::SampleRate;

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Timestamp style for the CSV export
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimestampArg {
    /// Milliseconds since the Unix epoch
    Unix,
    /// RFC 3339, UTC
    Rfc3339,
}

/// Reusable sensor selection arguments
#[derive(Debug, Clone, Args)]
pub struct SensorArgs {
    /// Advertised name prefix to match, or use BEND_PREFIX env var
    #[arg(short, long, env = "BEND_PREFIX")]
    pub prefix: Option<String>,

    /// Scan timeout in seconds
    #[arg(short = 'T', long)]
    pub timeout: Option<u64>,
}

#[derive(Parser)]
#[command(name = "bend")]
#[command(author, version, about = "CLI for Bend Labs ADS angle sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output compact JSON (no pretty-printing)
    #[arg(long, global = true)]
    pub compact: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for nearby ADS sensors
    Scan {
        #[command(flatten)]
        sensor: SensorArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream live samples and export window averages as CSV
    Stream {
        #[command(flatten)]
        sensor: SensorArgs,

        /// Sample rate in Hz (1, 10, 20, 50, 100, 200, 333, 500)
        #[arg(short, long, value_parser = parse_rate)]
        rate: Option<SampleRate>,

        /// Enable the stretch channel
        #[arg(short, long)]
        stretch: bool,

        /// Aggregation window in milliseconds
        #[arg(short, long)]
        window: Option<u64>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Write the CSV export to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Timestamp style in the CSV export
        #[arg(long, value_enum)]
        timestamps: Option<TimestampArg>,

        /// Format for live samples
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Display battery level and device information
    Info {
        #[command(flatten)]
        sensor: SensorArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init,
}

/// Parse a sample rate in Hz, rejecting rates the firmware does not accept
pub fn parse_rate(s: &str) -> Result<SampleRate, String> {
    let hz: u32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    SampleRate::try_from(hz).map_err(|_| {
        let valid: Vec<String> = SampleRate::ALL.iter().map(|r| r.hz().to_string()).collect();
        format!("Invalid rate '{}'. Valid values: {} Hz", hz, valid.join(", "))
    })
}
