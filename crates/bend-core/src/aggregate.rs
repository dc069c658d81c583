//! Tumbling-window aggregation of the sample stream.
//!
//! A window opens at the first sample that arrives while none is open and
//! collects every sample less than `interval` after that start. The first
//! sample outside the window closes it: the mean is emitted, stamped with the
//! window start, and the sample seeds the next window. Output points are
//! append-only.

use std::io::Write;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::trace;

use bend_types::{AggregatedPoint, Sample};

use crate::bus::{StreamBus, Subscription};
use crate::error::{Error, Result};

/// How timestamps are written in the CSV export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Milliseconds since the Unix epoch.
    #[default]
    UnixMillis,
    /// RFC 3339, UTC.
    Rfc3339,
}

impl TimestampFormat {
    fn render(self, timestamp: OffsetDateTime) -> Result<String> {
        match self {
            TimestampFormat::UnixMillis => {
                Ok((timestamp.unix_timestamp_nanos() / 1_000_000).to_string())
            }
            TimestampFormat::Rfc3339 => timestamp
                .format(&Rfc3339)
                .map_err(|e| Error::InvalidData(format!("cannot format timestamp: {e}"))),
        }
    }
}

#[derive(Debug)]
struct Window {
    start: OffsetDateTime,
    buffer: Vec<(f64, Option<f64>)>,
}

impl Window {
    fn open(start: OffsetDateTime) -> Self {
        Self {
            start,
            buffer: Vec::new(),
        }
    }

    fn into_point(self) -> Option<AggregatedPoint> {
        if self.buffer.is_empty() {
            return None;
        }
        let count = self.buffer.len();
        let value = self.buffer.iter().map(|(v, _)| v).sum::<f64>() / count as f64;

        let secondaries: Vec<f64> = self.buffer.iter().filter_map(|(_, s)| *s).collect();
        let secondary = (!secondaries.is_empty())
            .then(|| secondaries.iter().sum::<f64>() / secondaries.len() as f64);

        Some(AggregatedPoint {
            timestamp: self.start,
            value,
            secondary,
            count,
        })
    }
}

/// Aggregator shared between a bus callback and its owner.
pub type SharedAggregator = Arc<Mutex<WindowAggregator>>;

/// Averages samples over fixed, non-overlapping windows.
///
/// # Example
///
/// ```
/// use bend_core::WindowAggregator;
/// use bend_types::Sample;
/// use std::time::Duration;
/// use time::OffsetDateTime;
///
/// let mut agg = WindowAggregator::new(Duration::from_secs(2)).unwrap();
/// for (ms, value) in [(0, 10.0), (500, 20.0), (1900, 30.0), (2100, 40.0)] {
///     agg.add_sample(&Sample {
///         timestamp: OffsetDateTime::UNIX_EPOCH + Duration::from_millis(ms),
///         angle: Some(value),
///         stretch: None,
///         sequence: 0,
///     });
/// }
/// assert_eq!(agg.points().len(), 1);
/// assert_eq!(agg.points()[0].value, 20.0);
///
/// agg.flush_pending();
/// assert_eq!(agg.points()[1].value, 40.0);
/// ```
#[derive(Debug)]
pub struct WindowAggregator {
    interval: time::Duration,
    window: Option<Window>,
    points: Vec<AggregatedPoint>,
    timestamp_format: TimestampFormat,
    secondary: bool,
    skipped: u64,
}

impl WindowAggregator {
    /// Create an aggregator with a fixed window width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero or out-of-range interval.
    pub fn new(interval: std::time::Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::invalid_config("aggregation interval must be non-zero"));
        }
        let interval = time::Duration::try_from(interval)
            .map_err(|e| Error::invalid_config(format!("aggregation interval: {e}")))?;
        Ok(Self {
            interval,
            window: None,
            points: Vec::new(),
            timestamp_format: TimestampFormat::default(),
            secondary: false,
            skipped: 0,
        })
    }

    #[must_use]
    pub fn with_timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = format;
        self
    }

    /// Track the stretch channel alongside the angle.
    ///
    /// Off by default: stretch values are ignored and the export has no
    /// `Stretch` column, whatever the payloads carry.
    #[must_use]
    pub fn with_secondary(mut self, enabled: bool) -> Self {
        self.secondary = enabled;
        self
    }

    /// Subscribe a new aggregator to `bus`.
    ///
    /// The returned subscription keeps the feed alive; drop it to stop.
    pub fn attach(
        interval: std::time::Duration,
        bus: &StreamBus,
    ) -> Result<(SharedAggregator, Subscription)> {
        Ok(Self::new(interval)?.into_shared(bus))
    }

    /// Share this aggregator and feed it from `bus`.
    pub fn into_shared(self, bus: &StreamBus) -> (SharedAggregator, Subscription) {
        let shared = Arc::new(Mutex::new(self));
        let feed = Arc::clone(&shared);
        let subscription = bus.subscribe(move |sample: &Sample| {
            let mut aggregator = feed.lock().unwrap_or_else(|e| e.into_inner());
            aggregator.add_sample(sample);
        });
        (shared, subscription)
    }

    /// Fold one sample in. Returns the point emitted if a window closed.
    ///
    /// Samples without an angle are counted and skipped.
    pub fn add_sample(&mut self, sample: &Sample) -> Option<AggregatedPoint> {
        let Some(angle) = sample.angle else {
            self.skipped += 1;
            trace!(sequence = sample.sequence, "skipping value-less sample");
            return None;
        };
        let stretch = if self.secondary {
            sample.stretch.map(f64::from)
        } else {
            None
        };
        let entry = (f64::from(angle), stretch);

        if let Some(window) = self.window.as_mut()
            && sample.timestamp - window.start < self.interval
        {
            window.buffer.push(entry);
            return None;
        }

        let flushed = self.flush_pending();

        let mut window = Window::open(sample.timestamp);
        window.buffer.push(entry);
        self.window = Some(window);
        flushed
    }

    /// Close the open window, if it holds anything.
    ///
    /// Calling it again without new samples does nothing.
    pub fn flush_pending(&mut self) -> Option<AggregatedPoint> {
        let point = self.window.take()?.into_point()?;
        self.points.push(point);
        Some(point)
    }

    /// Every point emitted so far, oldest first.
    pub fn points(&self) -> &[AggregatedPoint] {
        &self.points
    }

    /// Samples buffered in the open window.
    pub fn pending_len(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.buffer.len())
    }

    /// Samples skipped because they carried no angle.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn interval(&self) -> std::time::Duration {
        self.interval.unsigned_abs()
    }

    /// Whether the export carries a stretch column.
    pub fn has_secondary(&self) -> bool {
        self.secondary
    }

    /// Flush the open window and render all points as CSV.
    ///
    /// The header is `Timestamp,Value`, plus `,Stretch` when the stretch
    /// channel is tracked.
    pub fn export_rows(&mut self) -> Result<String> {
        let mut out = Vec::new();
        self.write_csv(&mut out)?;
        String::from_utf8(out).map_err(|e| Error::InvalidData(e.to_string()))
    }

    /// Flush the open window and write all points as CSV to `writer`.
    pub fn write_csv<W: Write>(&mut self, mut writer: W) -> Result<()> {
        self.flush_pending();
        let with_secondary = self.has_secondary();

        if with_secondary {
            writeln!(writer, "Timestamp,Value,Stretch")?;
        } else {
            writeln!(writer, "Timestamp,Value")?;
        }

        for point in &self.points {
            let timestamp = self.timestamp_format.render(point.timestamp)?;
            if with_secondary {
                let secondary = point.secondary.map(|s| s.to_string()).unwrap_or_default();
                writeln!(writer, "{},{},{}", timestamp, point.value, secondary)?;
            } else {
                writeln!(writer, "{},{}", timestamp, point.value)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn at(ms: u64, angle: Option<f32>, stretch: Option<f32>) -> Sample {
        Sample {
            timestamp: OffsetDateTime::UNIX_EPOCH + Duration::from_millis(ms),
            angle,
            stretch,
            sequence: 0,
        }
    }

    #[test]
    fn test_worked_example() {
        let mut agg = WindowAggregator::new(Duration::from_millis(2000)).unwrap();

        assert!(agg.add_sample(&at(0, Some(10.0), None)).is_none());
        assert!(agg.add_sample(&at(500, Some(20.0), None)).is_none());
        assert!(agg.add_sample(&at(1900, Some(30.0), None)).is_none());
        let flushed = agg.add_sample(&at(2100, Some(40.0), None)).unwrap();

        assert_eq!(flushed.timestamp, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(flushed.value, 20.0);
        assert_eq!(flushed.count, 3);
        assert_eq!(agg.pending_len(), 1);

        let last = agg.flush_pending().unwrap();
        assert_eq!(
            last.timestamp,
            OffsetDateTime::UNIX_EPOCH + Duration::from_millis(2100)
        );
        assert_eq!(last.value, 40.0);
        assert_eq!(agg.points().len(), 2);
    }

    #[test]
    fn test_boundary_sample_opens_new_window() {
        let mut agg = WindowAggregator::new(Duration::from_millis(1000)).unwrap();
        agg.add_sample(&at(0, Some(1.0), None));
        let flushed = agg.add_sample(&at(1000, Some(3.0), None));
        assert_eq!(flushed.map(|p| p.value), Some(1.0));
    }

    #[test]
    fn test_flush_pending_is_idempotent() {
        let mut agg = WindowAggregator::new(Duration::from_secs(1)).unwrap();
        assert!(agg.flush_pending().is_none());

        agg.add_sample(&at(0, Some(5.0), None));
        assert!(agg.flush_pending().is_some());
        assert!(agg.flush_pending().is_none());
        assert_eq!(agg.points().len(), 1);
    }

    #[test]
    fn test_value_less_samples_are_skipped() {
        let mut agg = WindowAggregator::new(Duration::from_secs(1)).unwrap();
        agg.add_sample(&at(0, None, None));
        assert_eq!(agg.pending_len(), 0);
        assert_eq!(agg.skipped(), 1);

        agg.add_sample(&at(10, Some(2.0), None));
        agg.add_sample(&at(20, None, Some(9.0)));
        agg.add_sample(&at(30, Some(4.0), None));
        assert_eq!(agg.flush_pending().unwrap().value, 3.0);
    }

    #[test]
    fn test_secondary_mean_over_present_values() {
        let mut agg = WindowAggregator::new(Duration::from_secs(1))
            .unwrap()
            .with_secondary(true);
        agg.add_sample(&at(0, Some(1.0), Some(10.0)));
        agg.add_sample(&at(1, Some(1.0), None));
        agg.add_sample(&at(2, Some(1.0), Some(20.0)));
        let point = agg.flush_pending().unwrap();
        assert_eq!(point.secondary, Some(15.0));

        agg.add_sample(&at(5000, Some(1.0), None));
        assert_eq!(agg.flush_pending().unwrap().secondary, None);
    }

    #[test]
    fn test_export_without_stretch() {
        let mut agg = WindowAggregator::new(Duration::from_millis(2000)).unwrap();
        for (ms, v) in [(0, 10.0), (500, 20.0), (1900, 30.0), (2100, 40.0)] {
            agg.add_sample(&at(ms, Some(v), None));
        }
        let csv = agg.export_rows().unwrap();
        assert_eq!(csv, "Timestamp,Value\n0,20\n2100,40\n");
    }

    #[test]
    fn test_export_with_stretch() {
        let mut agg = WindowAggregator::new(Duration::from_millis(1000))
            .unwrap()
            .with_secondary(true);
        agg.add_sample(&at(0, Some(1.5), Some(2.0)));
        agg.add_sample(&at(1500, Some(3.0), None));
        let csv = agg.export_rows().unwrap();
        assert_eq!(csv, "Timestamp,Value,Stretch\n0,1.5,2\n1500,3,\n");
    }

    #[test]
    fn test_stretch_ignored_unless_enabled() {
        let mut agg = WindowAggregator::new(Duration::from_millis(1000)).unwrap();
        agg.add_sample(&at(0, Some(10.0), Some(0.0)));
        agg.add_sample(&at(1500, Some(20.0), Some(0.0)));
        assert!(!agg.has_secondary());

        let csv = agg.export_rows().unwrap();
        assert_eq!(csv, "Timestamp,Value\n0,10\n1500,20\n");
        assert!(agg.points().iter().all(|p| p.secondary.is_none()));
    }

    #[test]
    fn test_export_with_stretch_enabled_but_absent() {
        let mut agg = WindowAggregator::new(Duration::from_millis(1000))
            .unwrap()
            .with_secondary(true);
        agg.add_sample(&at(0, Some(1.0), None));
        assert_eq!(agg.export_rows().unwrap(), "Timestamp,Value,Stretch\n0,1,\n");
    }

    #[test]
    fn test_export_empty() {
        let mut agg = WindowAggregator::new(Duration::from_secs(1)).unwrap();
        assert_eq!(agg.export_rows().unwrap(), "Timestamp,Value\n");
    }

    #[test]
    fn test_export_rfc3339() {
        let mut agg = WindowAggregator::new(Duration::from_secs(1))
            .unwrap()
            .with_timestamp_format(TimestampFormat::Rfc3339);
        agg.add_sample(&at(0, Some(1.0), None));
        let csv = agg.export_rows().unwrap();
        assert!(csv.contains("1970-01-01T00:00:00Z,1"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            WindowAggregator::new(Duration::ZERO),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_attach_to_bus() {
        let bus = StreamBus::new();
        let (shared, _sub) = WindowAggregator::attach(Duration::from_secs(1), &bus).unwrap();
        bus.publish(&at(0, Some(2.0), None));
        bus.publish(&at(100, Some(4.0), None));

        let mut agg = shared.lock().unwrap();
        assert_eq!(agg.pending_len(), 2);
        assert_eq!(agg.flush_pending().unwrap().value, 3.0);
    }

    proptest! {
        #[test]
        fn prop_one_point_per_window(
            gaps in proptest::collection::vec(1u64..1500, 1..80),
            values in proptest::collection::vec(-90.0f32..90.0, 80),
            interval_ms in 50u64..2000,
        ) {
            let mut timestamps = Vec::with_capacity(gaps.len());
            let mut t = 0u64;
            for gap in &gaps {
                t += gap;
                timestamps.push(t);
            }

            let mut agg = WindowAggregator::new(Duration::from_millis(interval_ms)).unwrap();
            for (i, ms) in timestamps.iter().enumerate() {
                agg.add_sample(&at(*ms, Some(values[i]), None));
            }
            agg.flush_pending();

            // Each window starts at the first sample not covered by the previous one.
            let mut expected_starts = Vec::new();
            for ms in &timestamps {
                match expected_starts.last() {
                    Some(start) if ms - start < interval_ms => {}
                    _ => expected_starts.push(*ms),
                }
            }
            prop_assert_eq!(agg.points().len(), expected_starts.len());

            for (point, start) in agg.points().iter().zip(&expected_starts) {
                let members: Vec<f64> = timestamps
                    .iter()
                    .enumerate()
                    .filter(|(_, ms)| **ms >= *start && **ms < start + interval_ms)
                    .map(|(i, _)| f64::from(values[i]))
                    .collect();
                let mean = members.iter().sum::<f64>() / members.len() as f64;
                prop_assert_eq!(
                    point.timestamp,
                    OffsetDateTime::UNIX_EPOCH + Duration::from_millis(*start)
                );
                prop_assert_eq!(point.count, members.len());
                prop_assert!((point.value - mean).abs() < 1e-9);
            }
        }
    }
}
