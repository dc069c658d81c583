//! Example: Streaming Angle Samples
//!
//! Connects to the first ADS sensor in range, prints every sample for a few
//! seconds, then prints half-second window means.
//!
//! Run with: `cargo run --example stream_angles -- [RATE_HZ] [SECONDS]`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use bend_core::{BleTransport, DeviceSession, WindowAggregator};
use bend_types::{Sample, SampleRate, SelectionFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let rate = match args.get(1) {
        Some(hz) => SampleRate::try_from(hz.parse::<u32>()?)?,
        None => SampleRate::Hz10,
    };
    let seconds: u64 = match args.get(2) {
        Some(s) => s.parse()?,
        None => 5,
    };

    let transport = Arc::new(BleTransport::new().await?);
    let session = DeviceSession::new(transport);

    let _printer = session.bus().subscribe(|sample: &Sample| {
        if let Some(angle) = sample.angle {
            println!("#{:<6} {:>8.2}°", sample.sequence, angle);
        }
    });
    let (aggregator, _subscription) =
        WindowAggregator::attach(Duration::from_millis(500), session.bus())?;

    println!("Looking for a sensor...");
    session
        .connect(SelectionFilter::default(), rate, false)
        .await?;
    if let Some(device) = session.device() {
        println!("Streaming from {} at {}", device, rate);
    }

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    session.disconnect().await?;

    let mut aggregator = aggregator.lock().unwrap_or_else(|e| e.into_inner());
    println!();
    print!("{}", aggregator.export_rows()?);
    Ok(())
}
