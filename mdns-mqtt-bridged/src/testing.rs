//! In-memory stand-ins for the broker and the mDNS daemon

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use anyhow::{bail, Result};
use shared::types::{Message, ServiceIdentity, ServiceRecord};
use crate::bus::Bus;
use crate::mdns::{Browser, DiscoveryEvent, ProxyHandle, ProxyRegistrar};

pub fn event(instance: &str, port: u16) -> DiscoveryEvent {
    DiscoveryEvent {
        instance: instance.to_string(),
        service: "_hap._tcp".to_string(),
        domain: "local".to_string(),
        host: format!("{}.local.", instance),
        port,
        ipv4: vec![Ipv4Addr::new(10, 0, 0, 5)],
        ipv6: Vec::new(),
        txt: vec!["md=1".to_string()],
    }
}

pub fn record(instance: &str, port: u16) -> ServiceRecord {
    event(instance, port).into_record()
}

pub fn payload(records: Vec<ServiceRecord>) -> Vec<u8> {
    serde_json::to_vec(&Message { records }).unwrap()
}

#[derive(Default)]
struct RegistrarLog {
    registered: Vec<ServiceRecord>,
    released: Vec<ServiceIdentity>,
    live: HashMap<ServiceIdentity, usize>,
    failing: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeRegistrar {
    log: Arc<Mutex<RegistrarLog>>,
}

struct FakeHandle {
    identity: ServiceIdentity,
    log: Arc<Mutex<RegistrarLog>>,
}

impl FakeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make registration of `instance` fail
    pub fn fail_for(&self, instance: &str) {
        self.log.lock().unwrap().failing.insert(instance.to_string());
    }

    pub fn recover(&self, instance: &str) {
        self.log.lock().unwrap().failing.remove(instance);
    }

    pub fn registered(&self) -> Vec<ServiceRecord> {
        self.log.lock().unwrap().registered.clone()
    }

    pub fn released(&self) -> Vec<ServiceIdentity> {
        self.log.lock().unwrap().released.clone()
    }

    /// Number of handles acquired and not yet released
    pub fn live(&self) -> usize {
        self.log.lock().unwrap().live.values().sum()
    }

    pub fn live_for(&self, identity: &ServiceIdentity) -> usize {
        self.log.lock().unwrap().live.get(identity).copied().unwrap_or(0)
    }
}

impl ProxyRegistrar for FakeRegistrar {
    fn register(&self, record: &ServiceRecord) -> Result<Box<dyn ProxyHandle>> {
        let mut log = self.log.lock().unwrap();
        if log.failing.contains(&record.identity.instance) {
            bail!("registration of {} refused", record.identity.instance);
        }
        log.registered.push(record.clone());
        *log.live.entry(record.identity.clone()).or_default() += 1;

        Ok(Box::new(FakeHandle {
            identity: record.identity.clone(),
            log: self.log.clone(),
        }))
    }
}

impl ProxyHandle for FakeHandle {
    fn release(self: Box<Self>) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if let Some(count) = log.live.get_mut(&self.identity) {
            *count -= 1;
        }
        log.released.push(self.identity.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    routes: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    fail_publish: AtomicBool,
    reject_subscribe: AtomicBool,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn reject_subscribe(&self) {
        self.reject_subscribe.store(true, Ordering::SeqCst);
    }

    /// Raw payloads published to `topic`, oldest first
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Non-empty payloads published to `topic`, decoded
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.payloads(topic)
            .iter()
            .filter(|payload| !payload.is_empty())
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    /// Hand a payload to the subscriber of `topic`
    pub async fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let tx = self.routes.lock().unwrap().get(topic).cloned();
        tx.expect("no subscriber for topic").send(payload).await.unwrap();
    }
}

#[async_trait]
impl Bus for FakeBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        if self.reject_subscribe.load(Ordering::SeqCst) {
            bail!("Broker rejected subscription to {}", topic);
        }
        let (tx, rx) = mpsc::channel(16);
        self.routes.lock().unwrap().insert(topic.to_string(), tx);
        Ok(rx)
    }
}

/// Replays the same events on every browse
#[derive(Default)]
pub struct FakeBrowser {
    events: Mutex<Vec<DiscoveryEvent>>,
    broken: AtomicBool,
    cycles: AtomicUsize,
}

impl FakeBrowser {
    pub fn new(events: Vec<DiscoveryEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn break_after_current(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn browse(
        &self,
        _service_type: &str,
        _domain: &str,
        window: Duration,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("mDNS browse channel closed");
        }
        self.cycles.fetch_add(1, Ordering::SeqCst);
        let batch = self.events.lock().unwrap().clone();
        for event in batch {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
        tokio::time::sleep(window).await;
        Ok(())
    }
}
