use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use shared::types::{Message, ServiceIdentity, ServiceRecord};

struct PublishedService {
    record: ServiceRecord,
    last_seen: Instant,
}

/// Locally discovered services and when each was last seen
#[derive(Default)]
pub struct PublishedServices {
    services: Mutex<HashMap<ServiceIdentity, PublishedService>>,
}

impl PublishedServices {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceIdentity, PublishedService>> {
        // A panic elsewhere cannot leave the map half-updated
        self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a sighting. Returns true if the service is new or its content
    /// changed; an identical sighting only refreshes `last_seen`.
    pub fn observe(&self, record: ServiceRecord, now: Instant) -> bool {
        let mut services = self.lock();
        if let Some(existing) = services.get_mut(&record.identity) {
            if existing.record == record {
                existing.last_seen = now;
                return false;
            }
        }
        services.insert(
            record.identity.clone(),
            PublishedService { record, last_seen: now },
        );
        true
    }

    /// Remove every service last seen strictly before `cutoff`
    pub fn expire_before(&self, cutoff: Instant) -> Vec<ServiceRecord> {
        let mut services = self.lock();
        let stale: Vec<ServiceIdentity> = services
            .iter()
            .filter(|(_, service)| service.last_seen < cutoff)
            .map(|(identity, _)| identity.clone())
            .collect();

        stale
            .iter()
            .filter_map(|identity| services.remove(identity))
            .map(|service| service.record)
            .collect()
    }

    /// Stop tracking `identity`. Returns true if it was tracked.
    pub fn remove(&self, identity: &ServiceIdentity) -> bool {
        self.lock().remove(identity).is_some()
    }

    /// Full snapshot, sorted by identity
    pub fn snapshot(&self) -> Message {
        let mut records: Vec<ServiceRecord> = self
            .lock()
            .values()
            .map(|service| service.record.clone())
            .collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Message { records }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
