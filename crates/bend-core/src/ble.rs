//! btleplug implementation of the transport traits.
//!
//! [`BleTransport`] scans for sensors and opens [`BleLink`]s. Every radio
//! operation is bounded by a timeout from [`BleConfig`]. Link loss is
//! detected from the adapter's `DeviceDisconnected` event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, future};
use tokio::sync::OnceCell;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use bend_types::{
    CharacteristicInfo, CharacteristicProperties, DeviceHandle, EndpointKey, SelectionFilter,
};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::traits::{GattLink, SensorTransport};

/// Timeouts and scan behaviour for [`BleTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleConfig {
    /// How long `request_device` scans before giving up.
    pub scan_duration: Duration,
    /// How often scan results are checked while scanning.
    pub scan_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            scan_poll_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl BleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_duration.is_zero() {
            return Err(Error::invalid_config("scan_duration must be > 0"));
        }
        if self.scan_poll_interval.is_zero() {
            return Err(Error::invalid_config("scan_poll_interval must be > 0"));
        }
        Ok(())
    }
}

/// A sensor seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredSensor {
    pub handle: DeviceHandle,
    /// BLE address; all zeros on macOS.
    pub address: String,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// `PeripheralId(…)` with the wrapper stripped.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Stable identifier for a peripheral: its address, or the platform id
/// where the address is hidden.
fn device_identifier(address: &str, id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(id)
    } else {
        address.to_string()
    }
}

fn describe(peripheral: &Peripheral, properties: &PeripheralProperties) -> DiscoveredSensor {
    let address = properties.address.to_string();
    DiscoveredSensor {
        handle: DeviceHandle::new(
            device_identifier(&address, &peripheral.id()),
            properties.local_name.clone(),
        ),
        address,
        rssi: properties.rssi,
        services: properties.services.clone(),
    }
}

async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, btleplug::Error>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| Error::timeout(operation, limit))?
        .map_err(Error::from)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cancel `closed` once `is_gone` accepts an event.
///
/// The end of the event stream counts as a disconnect, since the link can no
/// longer be observed.
fn watch_disconnect<S, F>(mut events: S, is_gone: F, closed: CancellationToken)
where
    S: Stream + Send + Unpin + 'static,
    S::Item: Send,
    F: Fn(&S::Item) -> bool + Send + 'static,
{
    let watcher = async move {
        loop {
            tokio::select! {
                biased;
                () = closed.cancelled() => break,
                event = events.next() => match event {
                    Some(event) if is_gone(&event) => {
                        info!("Device disconnected");
                        closed.cancel();
                        break;
                    }
                    Some(_) => {}
                    None => {
                        warn!("Adapter event stream ended; treating link as lost");
                        closed.cancel();
                        break;
                    }
                },
            }
        }
    };
    tokio::spawn(watcher.in_current_span());
}

/// BLE transport over the host's first adapter.
pub struct BleTransport {
    adapter: Adapter,
    config: BleConfig,
    /// Peripherals seen by `request_device`, by device id.
    known: Mutex<HashMap<String, Peripheral>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("config", &self.config)
            .field("known", &lock(&self.known).len())
            .finish()
    }
}

impl BleTransport {
    /// Open the first adapter with default timeouts.
    pub async fn new() -> Result<Self> {
        Self::with_config(BleConfig::default()).await
    }

    pub async fn with_config(config: BleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_adapter(get_adapter().await?, config))
    }

    pub fn with_adapter(adapter: Adapter, config: BleConfig) -> Self {
        Self {
            adapter,
            config,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Scan for the configured duration and list every sensor matching `filter`.
    #[tracing::instrument(level = "info", skip_all, fields(duration = ?self.config.scan_duration))]
    pub async fn scan(&self, filter: &SelectionFilter) -> Result<Vec<DiscoveredSensor>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.config.scan_duration).await;
        let stopped = self.adapter.stop_scan().await;

        let found = self.matching(filter).await?;
        stopped?;
        info!("Scan complete. Found {} sensor(s)", found.len());
        Ok(found)
    }

    async fn matching(&self, filter: &SelectionFilter) -> Result<Vec<DiscoveredSensor>> {
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Error reading peripheral properties: {}", e);
                    continue;
                }
            };
            if !filter.matches(properties.local_name.as_deref(), &properties.services) {
                continue;
            }
            let sensor = describe(&peripheral, &properties);
            lock(&self.known).insert(sensor.handle.id.clone(), peripheral);
            found.push(sensor);
        }
        Ok(found)
    }
}

#[async_trait]
impl SensorTransport for BleTransport {
    /// Scan until the first sensor matching `filter` appears.
    #[tracing::instrument(level = "info", skip_all, fields(prefix = %filter.name_prefix))]
    async fn request_device(&self, filter: &SelectionFilter) -> Result<Option<DeviceHandle>> {
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + self.config.scan_duration;
        let selected = loop {
            match self.matching(filter).await {
                Ok(found) if !found.is_empty() => {
                    break Ok(found.into_iter().next().map(|s| s.handle));
                }
                Ok(_) if Instant::now() >= deadline => break Ok(None),
                Ok(_) => sleep(self.config.scan_poll_interval).await,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        if let Ok(Some(device)) = &selected {
            info!("Selected {}", device);
        }
        selected
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %device))]
    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn GattLink>> {
        let peripheral = lock(&self.known).get(&device.id).cloned().ok_or_else(|| {
            Error::connection_failed(
                Some(device.id.clone()),
                ConnectionFailureReason::Other("device was not seen in a scan".to_string()),
            )
        })?;

        // Watch before connecting so a drop right after connect is not missed.
        let events = self.adapter.events().await?;
        let closed = CancellationToken::new();
        let id = peripheral.id();
        watch_disconnect(
            events,
            move |event| matches!(event, CentralEvent::DeviceDisconnected(gone) if *gone == id),
            closed.clone(),
        );

        info!("Connecting to device...");
        if let Err(e) = bounded(
            self.config.connect_timeout,
            "connect to device",
            peripheral.connect(),
        )
        .await
        {
            closed.cancel();
            return Err(e);
        }
        info!("Connected!");

        Ok(Arc::new(BleLink {
            peripheral,
            config: self.config.clone(),
            closed,
            discovered: OnceCell::new(),
            characteristics: Mutex::new(HashMap::new()),
        }))
    }
}

/// One open connection to a peripheral.
pub struct BleLink {
    peripheral: Peripheral,
    config: BleConfig,
    closed: CancellationToken,
    discovered: OnceCell<()>,
    characteristics: Mutex<HashMap<EndpointKey, Characteristic>>,
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("peripheral", &self.peripheral.id())
            .field("open", &self.is_open())
            .finish()
    }
}

impl BleLink {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ServiceUninitialized)
        }
    }

    async fn discover_all(&self) -> Result<()> {
        self.discovered
            .get_or_try_init(|| async {
                bounded(
                    self.config.discovery_timeout,
                    "discover services",
                    self.peripheral.discover_services(),
                )
                .await?;
                let mut map = lock(&self.characteristics);
                for service in self.peripheral.services() {
                    debug!("  Service: {}", service.uuid);
                    for characteristic in service.characteristics {
                        let key = EndpointKey::new(service.uuid, characteristic.uuid);
                        map.insert(key, characteristic);
                    }
                }
                debug!("Cached {} characteristics", map.len());
                Ok::<_, Error>(())
            })
            .await?;
        Ok(())
    }

    fn characteristic(&self, info: &CharacteristicInfo) -> Result<Characteristic> {
        lock(&self.characteristics)
            .get(&info.key)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(info.key.service, info.key.characteristic))
    }
}

fn properties_of(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl GattLink for BleLink {
    async fn discover_service(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>> {
        self.ensure_open()?;
        self.discover_all().await?;
        Ok(lock(&self.characteristics)
            .iter()
            .filter(|(key, _)| key.service == service)
            .map(|(key, c)| CharacteristicInfo::new(*key, properties_of(c.properties)))
            .collect())
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let target = self.characteristic(characteristic)?;
        bounded(
            self.config.read_timeout,
            &format!("read characteristic {}", characteristic.key),
            self.peripheral.read(&target),
        )
        .await
    }

    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let target = self.characteristic(characteristic)?;
        let write_type = if characteristic.properties.write {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        bounded(
            self.config.write_timeout,
            &format!("write characteristic {}", characteristic.key),
            self.peripheral.write(&target, data, write_type),
        )
        .await
    }

    async fn start_notifications(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        self.ensure_open()?;
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await?;

        let uuid = target.uuid;
        let stream = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)))
            .take_until(self.closed.clone().cancelled_owned())
            .boxed();
        Ok(stream)
    }

    async fn stop_notifications(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let target = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_config_default() {
        let config = BleConfig::default();
        assert_eq!(config.scan_duration, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ble_config_validate() {
        assert!(
            BleConfig::new()
                .scan_duration(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_properties_of() {
        let props = properties_of(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert!(props.read);
        assert!(props.notify);
        assert!(!props.write);
        assert!(props.supports_notifications());

        let props = properties_of(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.supports_write());
        assert!(!props.supports_notifications());
    }

    #[tokio::test]
    async fn test_watch_disconnect_cancels_on_matching_event() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
        let closed = CancellationToken::new();
        watch_disconnect(rx, |id| *id == 7, closed.clone());

        tx.unbounded_send(3).unwrap();
        tokio::task::yield_now().await;
        assert!(!closed.is_cancelled());

        tx.unbounded_send(7).unwrap();
        timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("link should be reported closed");
    }

    #[tokio::test]
    async fn test_watch_disconnect_cancels_when_events_end() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
        let closed = CancellationToken::new();
        watch_disconnect(rx, |_| false, closed.clone());

        drop(tx);
        timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("link should be reported closed");
    }
}
