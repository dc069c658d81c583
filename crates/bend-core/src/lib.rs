//! Core BLE library for Bend Labs ADS soft angular displacement sensors.
//!
//! This crate connects to a one-axis ADS sensor, configures its sample rate
//! and stretch channel, and turns angle notifications into a stream of
//! timestamped [`Sample`](bend_types::Sample)s.
//!
//! # Features
//!
//! - **Device sessions**: select, connect, configure and stream in one call
//! - **Auto-reconnection**: link loss is recovered with exponential backoff
//! - **Characteristic cache**: discovery runs once per service per link
//! - **Sample bus**: in-process fan-out with isolated subscribers
//! - **Windowed aggregation**: fixed-interval means exported as CSV
//! - **Mock transport**: drive the whole stack without hardware
//!
//! # Architecture
//!
//! ```text
//! SensorTransport ──▶ GattLink ──▶ CharacteristicCache
//!        ▲                │
//!  DeviceSession          └──▶ NotificationHub ──▶ StreamBus ──▶ WindowAggregator
//! ```
//!
//! # Platform Differences
//!
//! Device ids are Bluetooth addresses on Linux and Windows. On macOS the
//! address is hidden and CoreBluetooth's per-host UUID is used instead.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bend_core::{BleTransport, DeviceSession, WindowAggregator};
//! use bend_types::{SampleRate, SelectionFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let session = DeviceSession::new(transport);
//!
//!     let (aggregator, _subscription) =
//!         WindowAggregator::attach(Duration::from_millis(500), session.bus())?;
//!
//!     session
//!         .connect(SelectionFilter::default(), SampleRate::Hz50, false)
//!         .await?;
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     session.disconnect().await?;
//!
//!     print!("{}", aggregator.lock().unwrap().export_rows()?);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod ble;
pub mod bus;
pub mod cache;
pub mod error;
pub mod events;
pub mod mock;
pub mod notify;
pub mod retry;
pub mod session;
pub mod traits;

// Core exports
pub use error::{ConnectionFailureReason, Error, Result};
pub use session::{DeviceSession, DeviceSessionBuilder, SessionConfig, StreamSettings};
pub use traits::{GattLink, SensorTransport};

pub use aggregate::{SharedAggregator, TimestampFormat, WindowAggregator};
pub use ble::{BleConfig, BleTransport, DiscoveredSensor, get_adapter};
pub use bus::{StreamBus, Subscription};
pub use cache::CharacteristicCache;
pub use events::{
    DisconnectReason, EventReceiver, EventSender, SessionEvent, SessionState, event_channel,
};
pub use mock::{MockLink, MockTransport, MockTransportBuilder};
pub use notify::NotificationHub;
pub use retry::{RetryConfig, Sleeper, TokioSleeper, with_retry, with_retry_using};

// Re-export from bend-types
pub use bend_types::uuids;
pub use bend_types::{
    AggregatedPoint, DeviceHandle, DeviceInfo, EndpointKey, Sample, SampleRate, SelectionFilter,
};
