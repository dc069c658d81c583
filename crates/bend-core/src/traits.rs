//! Transport abstractions.
//!
//! The session never touches btleplug directly. It talks to a
//! [`SensorTransport`] that selects devices and opens links, and to the
//! [`GattLink`] each connection hands back. [`crate::ble`] implements both
//! over btleplug; [`crate::mock`] implements them in memory for tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use bend_types::{CharacteristicInfo, DeviceHandle, SelectionFilter};

use crate::error::Result;

/// Selects peripherals and opens links to them.
///
/// # Example
///
/// ```ignore
/// use bend_core::{SensorTransport, Result};
/// use bend_types::SelectionFilter;
///
/// async fn first_sensor<T: SensorTransport>(transport: &T) -> Result<()> {
///     if let Some(device) = transport.request_device(&SelectionFilter::default()).await? {
///         let link = transport.connect(&device).await?;
///         link.disconnect().await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SensorTransport: Send + Sync {
    /// Pick one device matching `filter`, or `None` when nothing matched.
    async fn request_device(&self, filter: &SelectionFilter) -> Result<Option<DeviceHandle>>;

    /// Open a link to a previously selected device.
    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn GattLink>>;
}

/// One open connection to a peripheral.
///
/// A link is single-use: once it is closed, by either side, it never comes
/// back. Reconnecting produces a new link.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate every characteristic of `service`.
    ///
    /// Returns an empty list when the service does not exist.
    async fn discover_service(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>>;

    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>>;

    /// Write a value, with response when the characteristic supports it.
    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()>;

    /// Enable value-change notifications and return the stream of payloads.
    ///
    /// The stream ends when the link closes.
    async fn start_notifications(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Disable value-change notifications.
    async fn stop_notifications(&self, characteristic: &CharacteristicInfo) -> Result<()>;

    /// Close the link. Closing an already closed link is not an error.
    async fn disconnect(&self) -> Result<()>;

    /// Resolves once the link is gone, for whatever reason.
    async fn closed(&self);

    /// Whether the link is still open.
    fn is_open(&self) -> bool;
}
