use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use shared::types::{ServiceIdentity, ServiceRecord};
use crate::mdns::ProxyHandle;

/// A remote record currently announced on the local segment. The handle is
/// absent while a replacement registration is pending or after it failed; the
/// identity still counts as announced.
pub struct AnnouncedService {
    pub record: ServiceRecord,
    pub handle: Option<Box<dyn ProxyHandle>>,
}

/// Result of comparing an incoming record with what is announced
pub enum Lookup {
    /// Announced with identical content
    Unchanged,
    /// Announced with different content, or without a live proxy. The entry
    /// stays in place; its old handle, if any, has been taken out and must be
    /// released before registering again.
    Changed(Option<Box<dyn ProxyHandle>>),
    /// Not announced
    Absent,
}

/// Remote services announced locally, one proxy handle per identity
#[derive(Default)]
pub struct AnnouncedServices {
    services: Mutex<HashMap<ServiceIdentity, AnnouncedService>>,
}

impl AnnouncedServices {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceIdentity, AnnouncedService>> {
        self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, identity: &ServiceIdentity) -> bool {
        self.lock().contains_key(identity)
    }

    /// Compare `record` against the announced entry for its identity. If it
    /// differs, the entry's handle is taken out but the identity stays tracked
    /// until `insert` replaces it.
    pub fn take_if_changed(&self, record: &ServiceRecord) -> Lookup {
        let mut services = self.lock();
        let Some(existing) = services.get_mut(&record.identity) else {
            return Lookup::Absent;
        };
        if existing.record == *record && existing.handle.is_some() {
            return Lookup::Unchanged;
        }
        Lookup::Changed(existing.handle.take())
    }

    /// Track a freshly registered proxy. Returns any entry it displaced.
    pub fn insert(&self, record: ServiceRecord, handle: Box<dyn ProxyHandle>) -> Option<AnnouncedService> {
        self.lock().insert(
            record.identity.clone(),
            AnnouncedService { record, handle: Some(handle) },
        )
    }

    /// Remove and return every entry whose identity is not in `seen`
    pub fn retain_seen(&self, seen: &HashSet<ServiceIdentity>) -> Vec<AnnouncedService> {
        let mut services = self.lock();
        let gone: Vec<ServiceIdentity> = services
            .keys()
            .filter(|identity| !seen.contains(*identity))
            .cloned()
            .collect();

        gone.iter()
            .filter_map(|identity| services.remove(identity))
            .collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<AnnouncedService> {
        self.lock().drain().map(|(_, service)| service).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
