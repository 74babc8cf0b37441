use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::bus::Bus;
use crate::config::TimingConfig;
use crate::filter::ServiceFilter;
use crate::mdns::{Browser, DiscoveryEvent};
use crate::tracking::published::PublishedServices;

const EVENT_CAPACITY: usize = 64;

/// Mirrors locally discovered services to a retained bus topic as full
/// snapshots. Nothing is sent unless the tracked set actually changes.
pub struct Publisher {
    bus: Arc<dyn Bus>,
    browser: Arc<dyn Browser>,
    topic: String,
    filter: ServiceFilter,
    timing: TimingConfig,
    services: PublishedServices,
    /// Serializes snapshot-then-send so snapshots leave in the order taken
    publish_order: tokio::sync::Mutex<()>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        browser: Arc<dyn Browser>,
        topic: impl Into<String>,
        filter: ServiceFilter,
        timing: TimingConfig,
    ) -> Self {
        Self {
            bus,
            browser,
            topic: topic.into(),
            filter,
            timing,
            services: PublishedServices::new(),
            publish_order: tokio::sync::Mutex::new(()),
        }
    }

    /// Run discovery cycles back to back until cancelled. A failed cycle is
    /// returned as an error; there is nothing useful to do without discovery.
    pub async fn run(&self, service_type: &str, domain: &str, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Publishing {}.{} services to {}", service_type, domain, self.topic);

        loop {
            tokio::select! {
                result = self.discover_once(service_type, domain) => {
                    result.with_context(|| format!("Failed to browse for {} services", service_type))?;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Publisher shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// One bounded browse window, handling events as they arrive
    pub async fn discover_once(&self, service_type: &str, domain: &str) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<DiscoveryEvent>(EVENT_CAPACITY);

        let browse = self
            .browser
            .browse(service_type, domain, self.timing.browse_window(), tx);
        let consume = async {
            while let Some(event) = rx.recv().await {
                self.handle_event(event).await;
            }
        };

        let (result, ()) = tokio::join!(browse, consume);
        result
    }

    pub async fn handle_event(&self, event: DiscoveryEvent) {
        let identity = event.identity();
        if !(self.filter)(&identity) {
            tracing::debug!("Not publishing {}, it is announced on behalf of a remote", identity.instance);
            // Tracked before the remote claimed it; withdraw it from the topic
            if self.services.remove(&identity) {
                tracing::info!("Local service {} is now proxied for a remote, removing", identity.instance);
                if let Err(e) = self.publish().await {
                    tracing::error!("Failed to publish after removing {}: {:#}", identity.instance, e);
                }
            }
            return;
        }

        let record = event.into_record();
        if self.services.observe(record, Instant::now()) {
            tracing::info!("Found new or changed local service {}, publishing", identity.instance);
            if let Err(e) = self.publish().await {
                tracing::error!("Failed to publish after discovering {}: {:#}", identity.instance, e);
            }
        }
    }

    /// Send the full tracked set as one retained snapshot. Identities the
    /// filter rejects at send time are left out.
    pub async fn publish(&self) -> Result<()> {
        let _order = self.publish_order.lock().await;

        let mut message = self.services.snapshot();
        message.records.retain(|record| (self.filter)(&record.identity));
        let payload = serde_json::to_vec(&message)
            .context("Failed to serialize snapshot")?;

        self.bus.publish(&self.topic, payload).await?;

        tracing::debug!("Published {} services to {}", message.records.len(), self.topic);
        Ok(())
    }

    /// Drop every service not seen within the staleness window and publish
    /// once if anything went. Returns how many expired.
    pub async fn expire_stale(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.timing.stale_after()) else {
            return 0;
        };

        let expired = self.services.expire_before(cutoff);
        for record in &expired {
            tracing::info!("Local service {} expired, removing", record.identity.instance);
        }

        if !expired.is_empty() {
            tracing::info!("{} services remain after expiry", self.services.len());
            if let Err(e) = self.publish().await {
                tracing::error!("Failed to publish after expiry: {:#}", e);
            }
        }

        expired.len()
    }

    /// Periodic expiry sweep, independent of discovery cycles
    pub async fn run_expiry(&self, cancel: CancellationToken) {
        let period = self.timing.expiry_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.expire_stale().await;
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Clear the retained snapshot so subscribers withdraw everything
    pub async fn clear_topic(&self) -> Result<()> {
        let _order = self.publish_order.lock().await;
        self.bus.publish(&self.topic, Vec::new()).await
    }
}
