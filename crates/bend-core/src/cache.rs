//! Characteristic resolution cache.
//!
//! Resolving an endpoint discovers the whole service once and remembers every
//! characteristic in it. Each connection owns its own cache, and the cache is
//! invalidated on every teardown path, so a handle found here always belongs
//! to the link it was discovered on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};
use uuid::Uuid;

use bend_types::{CharacteristicInfo, EndpointKey};

use crate::error::{Error, Result};
use crate::traits::GattLink;

#[derive(Default)]
struct CacheState {
    services: HashMap<Uuid, HashMap<Uuid, CharacteristicInfo>>,
    /// Bumped by every invalidate. A discovery that started under an older
    /// generation must not insert.
    generation: u64,
    discoveries: u64,
}

/// Lazily populated map of endpoint to resolved characteristic.
pub struct CharacteristicCache {
    link: Arc<dyn GattLink>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for CharacteristicCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacteristicCache")
            .field("len", &self.len())
            .field("discoveries", &self.discovery_count())
            .finish()
    }
}

impl CharacteristicCache {
    pub fn new(link: Arc<dyn GattLink>) -> Self {
        Self {
            link,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state is plain data; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve an endpoint, discovering its service on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::CharacteristicNotFound`] if the service has no such characteristic.
    /// - [`Error::ServiceUninitialized`] if the cache was invalidated while discovery ran.
    /// - Any transport error from discovery.
    pub async fn resolve(&self, endpoint: EndpointKey) -> Result<CharacteristicInfo> {
        let generation = {
            let state = self.lock();
            if let Some(characteristics) = state.services.get(&endpoint.service) {
                trace!("cache hit for {}", endpoint);
                return characteristics
                    .get(&endpoint.characteristic)
                    .copied()
                    .ok_or_else(|| {
                        Error::characteristic_not_found(endpoint.service, endpoint.characteristic)
                    });
            }
            state.generation
        };

        debug!("discovering service {}", endpoint.service);
        let discovered = self.link.discover_service(endpoint.service).await?;

        let characteristics: HashMap<Uuid, CharacteristicInfo> = discovered
            .into_iter()
            .filter(|c| c.key.service == endpoint.service)
            .map(|c| (c.key.characteristic, c))
            .collect();
        let found = characteristics.get(&endpoint.characteristic).copied();

        {
            let mut state = self.lock();
            state.discoveries += 1;
            if state.generation != generation {
                debug!(
                    "dropping discovery of {} that raced an invalidate",
                    endpoint.service
                );
                return Err(Error::ServiceUninitialized);
            }
            debug!(
                "cached {} characteristics for service {}",
                characteristics.len(),
                endpoint.service
            );
            state
                .services
                .entry(endpoint.service)
                .or_insert(characteristics);
        }

        found.ok_or_else(|| Error::characteristic_not_found(endpoint.service, endpoint.characteristic))
    }

    /// Drop every cached entry.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.services.clear();
        state.generation += 1;
    }

    /// Number of cached characteristics across all services.
    pub fn len(&self) -> usize {
        self.lock().services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of discovery calls that completed.
    pub fn discovery_count(&self) -> u64 {
        self.lock().discoveries
    }

    /// Whether `service` has been discovered since the last invalidate.
    pub fn is_discovered(&self, service: Uuid) -> bool {
        self.lock().services.contains_key(&service)
    }
}
