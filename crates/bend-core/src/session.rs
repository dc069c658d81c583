//! Device session state machine.
//!
//! A [`DeviceSession`] owns at most one device and one connection at a time.
//! It selects a sensor, opens the link, writes the sample-rate and stretch
//! commands, starts notifications, and then watches the link. When the link
//! drops without being asked to, it reconnects with the same settings.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected
//!      ▲                         │             │ link lost
//!      └──── retries exhausted ──┴─ Reconnecting ◀┘
//! ```
//!
//! Cancellation tokens form a tree. The session token parents one token per
//! connection attempt, which parents the connection's own token, which
//! parents every notification listener. A new `connect` cancels the previous
//! attempt; `disconnect` cancels the session token and replaces it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bend_types::codec::{decode_battery_level, decode_string, stretch_command};
use bend_types::{DeviceHandle, DeviceInfo, EndpointKey, SampleRate, SelectionFilter, uuids};

use crate::bus::StreamBus;
use crate::cache::CharacteristicCache;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{DisconnectReason, EventReceiver, EventSender, SessionEvent, SessionState};
use crate::notify::NotificationHub;
use crate::retry::{RetryConfig, Sleeper, TokioSleeper, with_retry_using};
use crate::traits::{GattLink, SensorTransport};

/// Configuration for a [`DeviceSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Retry budget for an explicit `connect`.
    pub connect_retry: RetryConfig,
    /// Retry budget for recovery after link loss.
    pub reconnect_retry: RetryConfig,
    /// Whether link loss triggers reconnection at all.
    pub auto_reconnect: bool,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryConfig::for_connect(),
            reconnect_retry: RetryConfig::for_connect(),
            auto_reconnect: true,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Builder Methods ====================

    #[must_use]
    pub fn connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    #[must_use]
    pub fn reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.reconnect_retry = retry;
        self
    }

    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.connect_retry.validate()?;
        self.reconnect_retry.validate()?;
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Settings written to the sensor on every (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSettings {
    pub sample_rate: SampleRate,
    pub stretch: bool,
}

/// Everything that belongs to one established link.
#[derive(Clone)]
struct Connection {
    attempt: u64,
    device: DeviceHandle,
    link: Arc<dyn GattLink>,
    cache: Arc<CharacteristicCache>,
    hub: Arc<NotificationHub>,
    token: CancellationToken,
    streaming: bool,
}

impl Connection {
    fn new(
        attempt: u64,
        device: DeviceHandle,
        link: Arc<dyn GattLink>,
        bus: StreamBus,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let cache = Arc::new(CharacteristicCache::new(Arc::clone(&link)));
        let hub = Arc::new(NotificationHub::new(
            Arc::clone(&link),
            Arc::clone(&cache),
            bus,
            token.clone(),
        ));
        Self {
            attempt,
            device,
            link,
            cache,
            hub,
            token,
            streaming: false,
        }
    }

    /// Write the configuration commands and start the sample stream.
    ///
    /// A characteristic that cannot notify is not fatal; the connection is
    /// returned with `streaming == false`.
    async fn configure(
        &mut self,
        settings: StreamSettings,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> Result<()> {
        let angle = self.cache.resolve(EndpointKey::ANGLE).await?;
        ensure_live(cancel)?;

        debug!("writing sample rate {}", settings.sample_rate);
        self.link
            .write(&angle, &settings.sample_rate.command_bytes())
            .await?;
        ensure_live(cancel)?;

        debug!("writing stretch toggle {}", settings.stretch);
        self.link
            .write(&angle, &stretch_command(settings.stretch))
            .await?;
        ensure_live(cancel)?;

        self.streaming = match self.hub.subscribe(EndpointKey::ANGLE).await {
            Ok(()) => true,
            Err(e @ Error::NotificationStartFailed { .. }) => {
                warn!("connected without live data: {}", e);
                let _ = events.send(SessionEvent::NotificationsUnavailable {
                    device: self.device.clone(),
                    error: e.to_string(),
                });
                false
            }
            Err(e) => return Err(e),
        };
        ensure_live(cancel)
    }

    /// Drop subscriptions and cached handles. Does not touch the link.
    fn reset(&self) {
        self.token.cancel();
        self.hub.clear();
        self.cache.invalidate();
    }

    /// Reset, then close the link.
    async fn close(&self) {
        self.reset();
        if let Err(e) = self.link.disconnect().await {
            debug!("closing link to {} failed: {}", self.device, e);
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

struct Slot {
    device: Option<DeviceHandle>,
    settings: Option<StreamSettings>,
    connection: Option<Connection>,
    /// Id of the most recent attempt. Anything older is stale.
    attempt: u64,
    attempt_token: Option<CancellationToken>,
    session_token: CancellationToken,
}

impl Slot {
    /// Cancel whatever attempt is in flight and start a new one.
    fn begin_attempt(&mut self) -> (u64, CancellationToken) {
        if let Some(previous) = self.attempt_token.take() {
            previous.cancel();
        }
        self.attempt += 1;
        let token = self.session_token.child_token();
        self.attempt_token = Some(token.clone());
        (self.attempt, token)
    }
}

struct SessionInner {
    transport: Arc<dyn SensorTransport>,
    config: SessionConfig,
    bus: StreamBus,
    events: EventSender,
    state: watch::Sender<SessionState>,
    sleeper: Arc<dyn Sleeper>,
    slot: Mutex<Slot>,
}

/// A resilient session with one ADS sensor.
///
/// Cheap state queries are synchronous; everything that touches the radio is
/// async. Share it across tasks with `Arc`.
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state())
            .field("device", &self.device())
            .finish()
    }
}

impl DeviceSession {
    /// Create a session with default configuration and a fresh [`StreamBus`].
    pub fn new(transport: Arc<dyn SensorTransport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn SensorTransport>) -> DeviceSessionBuilder {
        DeviceSessionBuilder {
            transport,
            config: SessionConfig::default(),
            bus: None,
            sleeper: None,
        }
    }

    // ==================== Connection Lifecycle ====================

    /// Select a device, open the link, configure it and start streaming.
    ///
    /// Any attempt still in flight is cancelled first and any existing link
    /// is closed quietly. The open/configure/subscribe sequence is retried
    /// per [`SessionConfig::connect_retry`].
    ///
    /// # Errors
    ///
    /// - [`Error::NoDeviceSelected`] if nothing matches `filter`.
    /// - [`Error::ConnectionFailed`] with [`ConnectionFailureReason::RetriesExhausted`]
    ///   once the budget is spent, or [`ConnectionFailureReason::Cancelled`] if a
    ///   newer `connect` or a `disconnect` superseded this one.
    #[tracing::instrument(level = "info", skip_all, fields(rate = %sample_rate, stretch = enable_stretch))]
    pub async fn connect(
        &self,
        filter: SelectionFilter,
        sample_rate: SampleRate,
        enable_stretch: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let settings = StreamSettings {
            sample_rate,
            stretch: enable_stretch,
        };

        let (attempt, token, previous) = {
            let mut slot = inner.slot();
            let (attempt, token) = slot.begin_attempt();
            slot.settings = Some(settings);
            let previous = slot.connection.take();
            inner.set_state(SessionState::Connecting);
            (attempt, token, previous)
        };

        if let Some(previous) = previous {
            debug!("closing previous link to {}", previous.device);
            previous.close().await;
        }

        let selected = inner.transport.request_device(&filter).await;
        let device = match selected {
            Ok(Some(device)) => device,
            Ok(None) => {
                inner.abandon_attempt(attempt);
                return Err(Error::NoDeviceSelected);
            }
            Err(e) => {
                inner.abandon_attempt(attempt);
                return Err(e);
            }
        };

        {
            let mut slot = inner.slot();
            if slot.attempt != attempt || token.is_cancelled() {
                return Err(cancelled(&device));
            }
            slot.device = Some(device.clone());
        }
        info!("selected {}", device);

        inner
            .run_connect(attempt, device, settings, token, &inner.config.connect_retry)
            .await
    }

    /// Close the session on request.
    ///
    /// Clears the device first, so the link watcher sees an explicit
    /// disconnect and does not reconnect. Cancels every subscription, any
    /// backoff wait and any attempt in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] if the session is already disconnected.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let (marker, device, connection) = {
            let mut slot = inner.slot();
            if *inner.state.borrow() == SessionState::Disconnected {
                return Err(Error::NotPaired);
            }
            let device = slot.device.take();
            let connection = slot.connection.take();
            slot.attempt_token = None;
            slot.attempt += 1;
            let old = std::mem::replace(&mut slot.session_token, CancellationToken::new());
            old.cancel();
            (slot.attempt, device, connection)
        };

        if let Some(connection) = connection {
            connection.close().await;
        }

        {
            let slot = inner.slot();
            if slot.attempt == marker {
                inner.set_state(SessionState::Disconnected);
            }
        }

        if let Some(device) = device {
            info!("disconnected from {}", device);
            inner.emit(SessionEvent::Disconnected {
                device,
                reason: DisconnectReason::UserRequested,
            });
        }
        Ok(())
    }

    // ==================== Characteristic I/O ====================

    /// Write raw bytes to an endpoint on the current link. Not retried.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceUninitialized`] with no active link.
    /// - [`Error::CharacteristicNotFound`] if the endpoint does not exist.
    pub async fn write_characteristic(&self, endpoint: EndpointKey, data: &[u8]) -> Result<()> {
        let connection = self.inner.connection()?;
        let info = connection.cache.resolve(endpoint).await?;
        connection.link.write(&info, data).await
    }

    /// Read an endpoint on the current link and decode it. Not retried.
    ///
    /// # Errors
    ///
    /// Same as [`write_characteristic`](Self::write_characteristic).
    pub async fn read_characteristic<T, F>(&self, endpoint: EndpointKey, decode: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let connection = self.inner.connection()?;
        let info = connection.cache.resolve(endpoint).await?;
        let data = connection.link.read(&info).await?;
        Ok(decode(&data))
    }

    /// Battery level in percent.
    pub async fn read_battery(&self) -> Result<u8> {
        let level = self
            .read_characteristic(EndpointKey::BATTERY_LEVEL, decode_battery_level)
            .await??;
        Ok(level)
    }

    /// Strings from the Device Information service.
    pub async fn read_device_info(&self) -> Result<DeviceInfo> {
        let read = |characteristic| {
            self.read_characteristic(EndpointKey::device_info(characteristic), decode_string)
        };

        Ok(DeviceInfo {
            name: self
                .device()
                .map(|d| d.display_name().to_string())
                .unwrap_or_default(),
            sensor_type: read(uuids::SENSOR_TYPE).await?,
            firmware: read(uuids::FIRMWARE_REVISION).await?,
            hardware: read(uuids::HARDWARE_REVISION).await?,
            software: read(uuids::SOFTWARE_REVISION).await?,
            manufacturer: read(uuids::MANUFACTURER_NAME).await?,
        })
    }

    // ==================== Observation ====================

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Receiver that tracks every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// The bus every decoded sample is published on.
    pub fn bus(&self) -> &StreamBus {
        &self.inner.bus
    }

    /// The selected device, until an explicit disconnect or a failed attempt.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.inner.slot().device.clone()
    }

    /// Settings of the latest connect request.
    pub fn settings(&self) -> Option<StreamSettings> {
        self.inner.slot().settings
    }

    /// True when connected with notifications running.
    pub fn is_streaming(&self) -> bool {
        self.inner
            .slot()
            .connection
            .as_ref()
            .is_some_and(|c| c.streaming && c.hub.active_count() > 0)
    }

    /// Cached characteristics on the current link.
    pub fn cached_characteristics(&self) -> usize {
        self.inner
            .slot()
            .connection
            .as_ref()
            .map_or(0, |c| c.cache.len())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let slot = self.inner.slot();
        slot.session_token.cancel();
        if let Some(connection) = slot.connection.as_ref() {
            connection.reset();
            debug!("session dropped with {} still linked", connection.device);
        }
    }
}

impl SessionInner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        // Slot holds plain data; a panic elsewhere cannot leave it torn.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Publish a state transition. Called with the slot locked so state and
    /// slot never disagree.
    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("session state -> {}", next);
            self.emit(SessionEvent::StateChanged { state: next });
        }
    }

    fn connection(&self) -> Result<Connection> {
        self.slot()
            .connection
            .clone()
            .ok_or(Error::ServiceUninitialized)
    }

    /// Forget a failed attempt, if it is still the current one.
    fn abandon_attempt(&self, attempt: u64) {
        let mut slot = self.slot();
        if slot.attempt == attempt {
            slot.attempt_token = None;
            slot.device = None;
            self.set_state(SessionState::Disconnected);
        }
    }

    /// One try at open + configure + subscribe. Never leaves a link open on error.
    async fn establish(
        &self,
        attempt: u64,
        device: &DeviceHandle,
        settings: StreamSettings,
        token: &CancellationToken,
    ) -> Result<Connection> {
        let link = self.transport.connect(device).await?;
        let mut connection = Connection::new(attempt, device.clone(), link, self.bus.clone(), token);

        let configured = match ensure_live(token) {
            Ok(()) => connection.configure(settings, token, &self.events).await,
            Err(e) => Err(e),
        };
        match configured {
            Ok(()) => Ok(connection),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Run the connect sequence under the retry policy and install the result.
    async fn run_connect(
        self: &Arc<Self>,
        attempt: u64,
        device: DeviceHandle,
        settings: StreamSettings,
        token: CancellationToken,
        retry: &RetryConfig,
    ) -> Result<()> {
        let result = with_retry_using(retry, &token, "connect", self.sleeper.as_ref(), || {
            self.establish(attempt, &device, settings, &token)
        })
        .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                if token.is_cancelled() {
                    debug!("connect attempt {} superseded", attempt);
                    return Err(cancelled(&device));
                }
                let mut slot = self.slot();
                if slot.attempt != attempt {
                    return Err(cancelled(&device));
                }
                slot.attempt_token = None;
                slot.device = None;
                self.set_state(SessionState::Disconnected);
                drop(slot);

                error!("giving up on {}: {}", device, e);
                return Err(Error::connection_failed(
                    Some(device.id.clone()),
                    ConnectionFailureReason::RetriesExhausted {
                        attempts: retry.total_attempts(),
                        last_error: e.to_string(),
                    },
                ));
            }
        };

        let installed = {
            let mut slot = self.slot();
            let current = slot.attempt == attempt && !token.is_cancelled();
            if current {
                slot.connection = Some(connection.clone());
                self.set_state(SessionState::Connected);
            }
            current
        };
        if !installed {
            connection.close().await;
            return Err(cancelled(&device));
        }

        info!(
            "connected to {} at {} (stretch {})",
            device,
            settings.sample_rate,
            if settings.stretch { "on" } else { "off" }
        );
        self.emit(SessionEvent::Connected {
            device,
            sample_rate: settings.sample_rate,
            stretch: settings.stretch,
            streaming: connection.streaming,
        });
        self.watch_link(connection);
        Ok(())
    }

    fn watch_link(self: &Arc<Self>, connection: Connection) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = connection.token.cancelled() => return,
                () = connection.link.closed() => {}
            }
            if let Some(session) = session.upgrade() {
                session.handle_link_loss(connection).await;
            }
        });
    }

    /// React to a link that closed without `disconnect` being called.
    async fn handle_link_loss(self: Arc<Self>, lost: Connection) {
        let (attempt, token, device, settings) = {
            let mut slot = self.slot();
            let Some(device) = slot.device.clone() else {
                debug!("link closed after explicit disconnect");
                return;
            };
            let current = slot
                .connection
                .as_ref()
                .is_some_and(|c| c.attempt == lost.attempt);
            if !current {
                debug!("stale link {} closed", lost.attempt);
                return;
            }

            slot.connection = None;
            lost.reset();

            if !self.config.auto_reconnect {
                slot.device = None;
                slot.attempt_token = None;
                self.set_state(SessionState::Disconnected);
                drop(slot);
                warn!("link to {} lost", device);
                self.emit(SessionEvent::Disconnected {
                    device,
                    reason: DisconnectReason::LinkLost,
                });
                return;
            }

            let settings = slot.settings.unwrap_or_default();
            let (attempt, token) = slot.begin_attempt();
            self.set_state(SessionState::Reconnecting);
            (attempt, token, device, settings)
        };

        warn!("link to {} lost, reconnecting", device);
        self.emit(SessionEvent::Disconnected {
            device: device.clone(),
            reason: DisconnectReason::LinkLost,
        });
        self.emit(SessionEvent::ReconnectStarted {
            device: device.clone(),
        });
        lost.close().await;

        let retry = self.config.reconnect_retry.clone();
        match self
            .run_connect(attempt, device.clone(), settings, token, &retry)
            .await
        {
            Ok(()) => self.emit(SessionEvent::ReconnectSucceeded { device }),
            Err(e) if e.is_cancelled() => debug!("reconnect to {} cancelled", device),
            Err(e) => self.emit(SessionEvent::ReconnectFailed {
                device,
                error: e.to_string(),
            }),
        }
    }
}

fn cancelled(device: &DeviceHandle) -> Error {
    Error::connection_failed(Some(device.id.clone()), ConnectionFailureReason::Cancelled)
}

/// Builder for [`DeviceSession`].
#[must_use]
pub struct DeviceSessionBuilder {
    transport: Arc<dyn SensorTransport>,
    config: SessionConfig,
    bus: Option<StreamBus>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl DeviceSessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish samples on an existing bus instead of a new one.
    pub fn bus(mut self, bus: StreamBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the backoff timer.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> DeviceSession {
        let (events, _) = tokio::sync::broadcast::channel(self.config.event_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Disconnected);
        DeviceSession {
            inner: Arc::new(SessionInner {
                transport: self.transport,
                config: self.config,
                bus: self.bus.unwrap_or_default(),
                events,
                state,
                sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
                slot: Mutex::new(Slot {
                    device: None,
                    settings: None,
                    connection: None,
                    attempt: 0,
                    attempt_token: None,
                    session_token: CancellationToken::new(),
                }),
            }),
        }
    }
}
