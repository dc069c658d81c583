//! Notification subscription lifecycle.
//!
//! At most one subscription exists per endpoint. Subscribing again replaces
//! the previous listener; unsubscribing an endpoint that has none is a no-op.
//! Every listener runs under a child of the connection's cancellation token,
//! so tearing the connection down stops all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use bend_types::{EndpointKey, Sample};

use crate::bus::StreamBus;
use crate::cache::CharacteristicCache;
use crate::error::{Error, Result};
use crate::traits::GattLink;

struct ActiveSubscription {
    id: u64,
    token: CancellationToken,
}

type SubscriptionMap = Arc<Mutex<HashMap<EndpointKey, ActiveSubscription>>>;

fn lock(map: &SubscriptionMap) -> MutexGuard<'_, HashMap<EndpointKey, ActiveSubscription>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Starts and stops value-change notifications and republishes them as
/// [`Sample`]s on a [`StreamBus`].
pub struct NotificationHub {
    link: Arc<dyn GattLink>,
    cache: Arc<CharacteristicCache>,
    bus: StreamBus,
    parent: CancellationToken,
    subscriptions: SubscriptionMap,
    next_id: AtomicU64,
    decode_failures: Arc<AtomicU64>,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("active", &self.active_count())
            .field("decode_failures", &self.decode_failures())
            .finish()
    }
}

impl NotificationHub {
    pub fn new(
        link: Arc<dyn GattLink>,
        cache: Arc<CharacteristicCache>,
        bus: StreamBus,
        parent: CancellationToken,
    ) -> Self {
        Self {
            link,
            cache,
            bus,
            parent,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            decode_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start notifications on `endpoint` and publish every payload.
    ///
    /// Sequence numbers restart at zero for each subscription.
    ///
    /// # Errors
    ///
    /// - [`Error::CharacteristicNotFound`] if the endpoint cannot be resolved.
    /// - [`Error::NotificationStartFailed`] if the characteristic cannot notify
    ///   or the transport refuses to start.
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
    pub async fn subscribe(&self, endpoint: EndpointKey) -> Result<()> {
        let info = self.cache.resolve(endpoint).await?;
        if !info.properties.supports_notifications() {
            return Err(Error::notification_start_failed(
                endpoint.characteristic,
                "characteristic supports neither notify nor indicate",
            ));
        }

        // Previous listener goes first. Its low-level stream is replaced by
        // the start below, so there is nothing to stop.
        if let Some(previous) = lock(&self.subscriptions).remove(&endpoint) {
            debug!("replacing subscription {}", previous.id);
            previous.token.cancel();
        }

        let stream = self
            .link
            .start_notifications(&info)
            .await
            .map_err(|e| Error::notification_start_failed(endpoint.characteristic, e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.parent.child_token();
        if let Some(raced) = lock(&self.subscriptions).insert(
            endpoint,
            ActiveSubscription {
                id,
                token: token.clone(),
            },
        ) {
            raced.token.cancel();
        }

        tokio::spawn(listen(
            stream,
            Listener {
                id,
                endpoint,
                token,
                bus: self.bus.clone(),
                subscriptions: Arc::clone(&self.subscriptions),
                decode_failures: Arc::clone(&self.decode_failures),
            },
        ));
        debug!("subscription {} active", id);
        Ok(())
    }

    /// Stop notifications on `endpoint`. Returns false if none were active.
    pub async fn unsubscribe(&self, endpoint: EndpointKey) -> bool {
        let Some(active) = lock(&self.subscriptions).remove(&endpoint) else {
            return false;
        };
        active.token.cancel();

        if let Ok(info) = self.cache.resolve(endpoint).await
            && let Err(e) = self.link.stop_notifications(&info).await
        {
            debug!("stop_notifications on {} failed: {}", endpoint, e);
        }
        true
    }

    /// Cancel every subscription without touching the link.
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.subscriptions).drain().collect();
        for (endpoint, active) in drained {
            trace!("cancelling subscription {} on {}", active.id, endpoint);
            active.token.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_subscribed(&self, endpoint: EndpointKey) -> bool {
        lock(&self.subscriptions).contains_key(&endpoint)
    }

    /// Payloads that could not be decoded since the hub was created.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.clear();
    }
}

struct Listener {
    id: u64,
    endpoint: EndpointKey,
    token: CancellationToken,
    bus: StreamBus,
    subscriptions: SubscriptionMap,
    decode_failures: Arc<AtomicU64>,
}

async fn listen(mut stream: BoxStream<'static, Vec<u8>>, listener: Listener) {
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            biased;
            () = listener.token.cancelled() => {
                trace!("subscription {} cancelled", listener.id);
                break;
            }
            next = stream.next() => {
                let Some(payload) = next else {
                    debug!("notification stream for {} ended", listener.endpoint);
                    break;
                };
                let sample = Sample::from_payload(&payload, sequence, OffsetDateTime::now_utc());
                if sample.is_empty() {
                    listener.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        len = payload.len(),
                        sequence,
                        "undecodable notification payload"
                    );
                }
                sequence += 1;
                listener.bus.publish(&sample);
            }
        }
    }

    // Only remove our own entry; a newer subscription may have replaced it.
    let mut subscriptions = lock(&listener.subscriptions);
    if subscriptions
        .get(&listener.endpoint)
        .is_some_and(|active| active.id == listener.id)
    {
        subscriptions.remove(&listener.endpoint);
    }
}
