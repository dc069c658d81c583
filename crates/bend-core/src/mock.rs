//! In-memory transport for testing.
//!
//! [`MockTransport`] implements [`SensorTransport`] and hands out
//! [`MockLink`]s implementing [`GattLink`], so the whole session can be
//! driven without BLE hardware.
//!
//! # Features
//!
//! - **Failure injection**: transient connect and write failures, missing
//!   device, characteristics without notify support
//! - **Latency simulation**: delays on connect and discovery
//! - **Link control**: push notifications and drop the link from the test

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bend_types::{
    CharacteristicInfo, CharacteristicProperties, DeviceHandle, DeviceInfo, EndpointKey,
    SelectionFilter, uuids,
};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::traits::{GattLink, SensorTransport};

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the transport and every link it opened.
struct MockState {
    device: Mutex<Option<DeviceHandle>>,
    advertised_services: Mutex<Vec<Uuid>>,
    info: Mutex<DeviceInfo>,
    battery: AtomicU8,
    notify_supported: AtomicBool,
    connect_latency_ms: AtomicU64,
    discovery_latency_ms: AtomicU64,
    remaining_connect_failures: AtomicU32,
    remaining_write_failures: AtomicU32,
    request_count: AtomicU32,
    connect_count: AtomicU32,
    writes: Mutex<Vec<(EndpointKey, Vec<u8>)>>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

/// A mock sensor transport.
///
/// # Example
///
/// ```
/// use bend_core::{DeviceSession, MockTransport, SessionState};
/// use bend_types::{SampleRate, SelectionFilter};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let transport = Arc::new(MockTransport::new());
///     let session = DeviceSession::new(transport.clone());
///
///     session
///         .connect(SelectionFilter::default(), SampleRate::Hz10, false)
///         .await
///         .unwrap();
///     assert_eq!(session.state(), SessionState::Connected);
///     assert_eq!(transport.written().len(), 2);
/// }
/// ```
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("device", &*lock(&self.state.device))
            .field("connects", &self.connect_count())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport with one `ads_mock` sensor in range.
    pub fn new() -> Self {
        MockTransportBuilder::new().build()
    }

    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    // ==================== Failure Injection ====================

    /// Replace (or remove) the device in range.
    pub fn set_device(&self, device: Option<DeviceHandle>) {
        *lock(&self.state.device) = device;
    }

    /// Fail the next `count` link opens, then succeed.
    pub fn set_transient_failures(&self, count: u32) {
        self.state
            .remaining_connect_failures
            .store(count, Ordering::Relaxed);
    }

    pub fn remaining_failures(&self) -> u32 {
        self.state.remaining_connect_failures.load(Ordering::Relaxed)
    }

    /// Fail the next `count` writes on any link.
    pub fn set_write_failures(&self, count: u32) {
        self.state
            .remaining_write_failures
            .store(count, Ordering::Relaxed);
    }

    /// Whether discovery reports notify support on the angle characteristic.
    pub fn set_notify_supported(&self, supported: bool) {
        self.state
            .notify_supported
            .store(supported, Ordering::Relaxed);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state
            .connect_latency_ms
            .store(saturating_millis(latency), Ordering::Relaxed);
    }

    pub fn set_discovery_latency(&self, latency: Duration) {
        self.state
            .discovery_latency_ms
            .store(saturating_millis(latency), Ordering::Relaxed);
    }

    pub fn set_battery(&self, level: u8) {
        self.state.battery.store(level, Ordering::Relaxed);
    }

    // ==================== Link Control ====================

    /// The most recently opened link.
    pub fn current_link(&self) -> Option<Arc<MockLink>> {
        lock(&self.state.links).last().cloned()
    }

    /// Every link opened so far, oldest first.
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        lock(&self.state.links).clone()
    }

    /// Push an angle notification on the current link.
    ///
    /// Returns false if nobody is listening.
    pub fn emit_notification(&self, payload: Vec<u8>) -> bool {
        self.current_link()
            .is_some_and(|link| link.emit(uuids::ANGLE, payload))
    }

    /// Drop the current link as if the radio lost it.
    pub fn drop_link(&self) {
        if let Some(link) = self.current_link() {
            link.close();
        }
    }

    // ==================== Inspection ====================

    /// Every successful write, in order, across all links.
    pub fn written(&self) -> Vec<(EndpointKey, Vec<u8>)> {
        lock(&self.state.writes).clone()
    }

    pub fn clear_written(&self) {
        lock(&self.state.writes).clear();
    }

    /// Device selection requests served.
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    /// Link opens attempted, failed ones included.
    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::Relaxed)
    }

    /// Links that are still open.
    pub fn open_links(&self) -> usize {
        lock(&self.state.links)
            .iter()
            .filter(|l| l.is_open())
            .count()
    }
}

#[async_trait]
impl SensorTransport for MockTransport {
    async fn request_device(&self, filter: &SelectionFilter) -> Result<Option<DeviceHandle>> {
        self.state.request_count.fetch_add(1, Ordering::Relaxed);
        let device = lock(&self.state.device).clone();
        let services = lock(&self.state.advertised_services).clone();
        Ok(device.filter(|d| filter.matches(d.name.as_deref(), &services)))
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn GattLink>> {
        let number = self.state.connect_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.state.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failures = &self.state.remaining_connect_failures;
        if failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection_failed(
                Some(device.id.clone()),
                ConnectionFailureReason::LinkUnavailable,
            ));
        }

        let present = lock(&self.state.device)
            .as_ref()
            .is_some_and(|d| d.id == device.id);
        if !present {
            return Err(Error::connection_failed(
                Some(device.id.clone()),
                ConnectionFailureReason::LinkUnavailable,
            ));
        }

        let link = Arc::new(MockLink {
            number,
            state: Arc::clone(&self.state),
            closed: CancellationToken::new(),
            notifiers: Mutex::new(HashMap::new()),
            discoveries: AtomicU32::new(0),
        });
        lock(&self.state.links).push(Arc::clone(&link));
        Ok(link)
    }
}

/// One mock connection.
pub struct MockLink {
    number: u32,
    state: Arc<MockState>,
    closed: CancellationToken,
    notifiers: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>>,
    discoveries: AtomicU32,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("number", &self.number)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MockLink {
    /// Position of this link in the transport's connect sequence.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn discovery_count(&self) -> u32 {
        self.discoveries.load(Ordering::Relaxed)
    }

    pub fn is_notifying(&self, characteristic: Uuid) -> bool {
        lock(&self.notifiers).contains_key(&characteristic)
    }

    fn emit(&self, characteristic: Uuid, payload: Vec<u8>) -> bool {
        lock(&self.notifiers)
            .get(&characteristic)
            .is_some_and(|tx| tx.unbounded_send(payload).is_ok())
    }

    fn close(&self) {
        lock(&self.notifiers).clear();
        self.closed.cancel();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ServiceUninitialized)
        }
    }

    fn characteristics(&self, service: Uuid) -> Vec<CharacteristicInfo> {
        let read_only = CharacteristicProperties {
            read: true,
            ..Default::default()
        };
        match service {
            s if s == uuids::ANGLE_SERVICE => {
                let notify = self.state.notify_supported.load(Ordering::Relaxed);
                vec![CharacteristicInfo::new(
                    EndpointKey::ANGLE,
                    CharacteristicProperties {
                        read: true,
                        write: true,
                        notify,
                        ..Default::default()
                    },
                )]
            }
            s if s == uuids::BATTERY_SERVICE => vec![CharacteristicInfo::new(
                EndpointKey::BATTERY_LEVEL,
                CharacteristicProperties {
                    notify: true,
                    ..read_only
                },
            )],
            s if s == uuids::DEVICE_INFO_SERVICE => [
                uuids::SENSOR_TYPE,
                uuids::FIRMWARE_REVISION,
                uuids::HARDWARE_REVISION,
                uuids::SOFTWARE_REVISION,
                uuids::MANUFACTURER_NAME,
            ]
            .into_iter()
            .map(|c| CharacteristicInfo::new(EndpointKey::device_info(c), read_only))
            .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover_service(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>> {
        self.ensure_open()?;
        let latency = self.state.discovery_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.discoveries.fetch_add(1, Ordering::Relaxed);
        Ok(self.characteristics(service))
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let info = lock(&self.state.info).clone();
        let value = match characteristic.key.characteristic {
            c if c == uuids::BATTERY_LEVEL => vec![self.state.battery.load(Ordering::Relaxed)],
            c if c == uuids::SENSOR_TYPE => info.sensor_type.into_bytes(),
            c if c == uuids::FIRMWARE_REVISION => info.firmware.into_bytes(),
            c if c == uuids::HARDWARE_REVISION => info.hardware.into_bytes(),
            c if c == uuids::SOFTWARE_REVISION => info.software.into_bytes(),
            c if c == uuids::MANUFACTURER_NAME => info.manufacturer.into_bytes(),
            _ => vec![0; 8],
        };
        Ok(value)
    }

    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self
            .state
            .remaining_write_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::timeout("write", Duration::from_secs(5)));
        }
        lock(&self.state.writes).push((characteristic.key, data.to_vec()));
        Ok(())
    }

    async fn start_notifications(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded();
        lock(&self.notifiers).insert(characteristic.key.characteristic, tx);
        Ok(rx.boxed())
    }

    async fn stop_notifications(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        lock(&self.notifiers).remove(&characteristic.key.characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// Builder for creating mock transports with custom settings.
#[derive(Debug)]
pub struct MockTransportBuilder {
    device: Option<DeviceHandle>,
    advertised_services: Vec<Uuid>,
    info: DeviceInfo,
    battery: u8,
    notify_supported: bool,
    transient_failures: u32,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            device: Some(DeviceHandle::new("MOCK-000001", Some("ads_mock".to_string()))),
            advertised_services: vec![uuids::ANGLE_SERVICE],
            info: DeviceInfo {
                name: "ads_mock".to_string(),
                sensor_type: "one-axis".to_string(),
                firmware: "1.0.0".to_string(),
                hardware: "A".to_string(),
                software: "1.0.0".to_string(),
                manufacturer: "Bend Labs".to_string(),
            },
            battery: 90,
            notify_supported: true,
            transient_failures: 0,
        }
    }
}

impl MockTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertised name of the mock sensor.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        if let Some(device) = self.device.as_mut() {
            device.name = Some(name.to_string());
        }
        self.info.name = name.to_string();
        self
    }

    /// Start with no device in range.
    #[must_use]
    pub fn no_device(mut self) -> Self {
        self.device = None;
        self
    }

    #[must_use]
    pub fn advertised_services(mut self, services: Vec<Uuid>) -> Self {
        self.advertised_services = services;
        self
    }

    #[must_use]
    pub fn battery(mut self, level: u8) -> Self {
        self.battery = level;
        self
    }

    #[must_use]
    pub fn firmware(mut self, firmware: &str) -> Self {
        self.info.firmware = firmware.to_string();
        self
    }

    #[must_use]
    pub fn notify_supported(mut self, supported: bool) -> Self {
        self.notify_supported = supported;
        self
    }

    #[must_use]
    pub fn transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            state: Arc::new(MockState {
                device: Mutex::new(self.device),
                advertised_services: Mutex::new(self.advertised_services),
                info: Mutex::new(self.info),
                battery: AtomicU8::new(self.battery),
                notify_supported: AtomicBool::new(self.notify_supported),
                connect_latency_ms: AtomicU64::new(0),
                discovery_latency_ms: AtomicU64::new(0),
                remaining_connect_failures: AtomicU32::new(self.transient_failures),
                remaining_write_failures: AtomicU32::new(0),
                request_count: AtomicU32::new(0),
                connect_count: AtomicU32::new(0),
                writes: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }
}
