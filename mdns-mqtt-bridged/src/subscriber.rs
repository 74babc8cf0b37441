use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::types::{Message, ServiceIdentity};
use crate::bus::Bus;
use crate::mdns::{ProxyHandle, ProxyRegistrar};
use crate::tracking::announced::{AnnouncedService, AnnouncedServices, Lookup};

/// Projects snapshots received from the bus onto the local segment as proxy
/// announcements.
pub struct Subscriber {
    registrar: Arc<dyn ProxyRegistrar>,
    services: AnnouncedServices,
    /// Serializes reconciliation. Held across registrar calls, unlike the
    /// table lock, so `has_service` never waits on the daemon.
    reconcile: tokio::sync::Mutex<()>,
}

impl Subscriber {
    pub fn new(registrar: Arc<dyn ProxyRegistrar>) -> Self {
        Self {
            registrar,
            services: AnnouncedServices::new(),
            reconcile: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to `topic` and handle every message on a background task.
    /// Failing to subscribe is returned as an error.
    pub async fn subscribe(
        self: &Arc<Self>,
        bus: &dyn Bus,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut messages = bus
            .subscribe(topic)
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;

        let subscriber = self.clone();
        let topic = topic.to_string();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = messages.recv() => match message {
                        Some(payload) => subscriber.handle_message(&payload).await,
                        None => {
                            tracing::warn!("Subscription to {} closed", topic);
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        tracing::info!("Subscriber shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// Reconcile local announcements with one received snapshot. An empty
    /// payload withdraws everything; a malformed one is dropped.
    pub async fn handle_message(&self, payload: &[u8]) {
        if payload.is_empty() {
            tracing::info!("Received empty snapshot, withdrawing all remote services");
            self.withdraw_all().await;
            return;
        }

        let message: Message = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to deserialize message: {}", e);
                return;
            }
        };

        let _reconcile = self.reconcile.lock().await;
        let mut seen: HashSet<ServiceIdentity> = HashSet::new();

        for record in message.records {
            seen.insert(record.identity.clone());

            match self.services.take_if_changed(&record) {
                Lookup::Unchanged => continue,
                Lookup::Changed(previous) => {
                    tracing::info!("Updated remote service {}, announcing", record.identity.instance);
                    if let Some(handle) = previous {
                        self.release_handle(&record.identity.instance, handle);
                    }
                }
                Lookup::Absent => {
                    tracing::info!("Received remote service {}, announcing", record.identity.instance);
                }
            }

            let handle = match self.registrar.register(&record) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!("Failed to announce {}: {:#}", record.identity.instance, e);
                    continue;
                }
            };
            if let Some(displaced) = self.services.insert(record, handle) {
                self.release(displaced);
            }
        }

        for service in self.services.retain_seen(&seen) {
            tracing::info!(
                "Remote service {} has stopped, no longer announcing",
                service.record.identity.instance
            );
            self.release(service);
        }

        tracing::debug!("{} remote services announced", self.services.len());
    }

    /// Withdraw every proxy announcement
    pub async fn withdraw_all(&self) {
        let _reconcile = self.reconcile.lock().await;
        for service in self.services.drain() {
            tracing::info!("No longer announcing {}", service.record.identity.instance);
            self.release(service);
        }
    }

    /// Whether `identity` is currently announced on behalf of a remote
    pub fn has_service(&self, identity: &ServiceIdentity) -> bool {
        self.services.contains(identity)
    }

    fn release(&self, service: AnnouncedService) {
        if let Some(handle) = service.handle {
            self.release_handle(&service.record.identity.instance, handle);
        }
    }

    fn release_handle(&self, instance: &str, handle: Box<dyn ProxyHandle>) {
        if let Err(e) = handle.release() {
            tracing::warn!("Failed to withdraw {}: {:#}", instance, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::testing::{payload, record, FakeBus, FakeRegistrar};

    const TOPIC: &str = "mdns/site-b";

    fn subscriber(registrar: &FakeRegistrar) -> Subscriber {
        Subscriber::new(Arc::new(registrar.clone()))
    }

    #[tokio::test]
    async fn test_new_identity_registers_once() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);
        let snapshot = payload(vec![record("a", 80)]);

        subscriber.handle_message(&snapshot).await;
        assert_eq!(registrar.registered(), vec![record("a", 80)]);
        assert!(subscriber.has_service(&record("a", 80).identity));

        subscriber.handle_message(&snapshot).await;
        assert_eq!(registrar.registered().len(), 1, "identical snapshot is a no-op");
        assert_eq!(registrar.live(), 1);
    }

    #[tokio::test]
    async fn test_changed_record_releases_before_reregistering() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);
        let identity = record("a", 80).identity;

        subscriber.handle_message(&payload(vec![record("a", 80)])).await;
        subscriber.handle_message(&payload(vec![record("a", 81)])).await;

        assert_eq!(registrar.registered(), vec![record("a", 80), record("a", 81)]);
        assert_eq!(registrar.released(), vec![identity.clone()]);
        assert_eq!(registrar.live_for(&identity), 1, "old handle must not leak");
    }

    #[tokio::test]
    async fn test_failed_reregistration_keeps_identity_announced() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);
        let identity = record("a", 80).identity;

        subscriber.handle_message(&payload(vec![record("a", 80)])).await;
        registrar.fail_for("a");
        subscriber.handle_message(&payload(vec![record("a", 81)])).await;

        assert!(subscriber.has_service(&identity), "still filtered from local publishing");
        assert_eq!(registrar.live_for(&identity), 0, "old handle must not leak");

        // The next snapshot retries the registration
        registrar.recover("a");
        subscriber.handle_message(&payload(vec![record("a", 81)])).await;
        assert_eq!(registrar.registered(), vec![record("a", 80), record("a", 81)]);
        assert_eq!(registrar.live_for(&identity), 1);

        // A pending entry is withdrawn like any other
        subscriber.handle_message(&payload(Vec::new())).await;
        assert!(!subscriber.has_service(&identity));
        assert_eq!(registrar.live(), 0);
    }

    #[tokio::test]
    async fn test_failed_reregistration_retries_previous_content() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);
        let identity = record("a", 80).identity;

        subscriber.handle_message(&payload(vec![record("a", 80)])).await;
        registrar.fail_for("a");
        subscriber.handle_message(&payload(vec![record("a", 81)])).await;
        registrar.recover("a");

        // Back to the content the entry still carries; it has no proxy, so register
        subscriber.handle_message(&payload(vec![record("a", 80)])).await;
        assert_eq!(registrar.registered(), vec![record("a", 80), record("a", 80)]);
        assert_eq!(registrar.live_for(&identity), 1);
    }

    #[tokio::test]
    async fn test_omitted_identity_is_withdrawn() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);

        subscriber
            .handle_message(&payload(vec![record("a", 80), record("b", 80)]))
            .await;
        subscriber.handle_message(&payload(vec![record("a", 80)])).await;

        assert_eq!(registrar.released(), vec![record("b", 80).identity]);
        assert!(!subscriber.has_service(&record("b", 80).identity));
        assert!(subscriber.has_service(&record("a", 80).identity));
        assert_eq!(registrar.live(), 1);
    }

    #[tokio::test]
    async fn test_empty_records_withdraw_everything() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);

        subscriber
            .handle_message(&payload(vec![record("a", 80), record("b", 80)]))
            .await;
        subscriber.handle_message(&payload(Vec::new())).await;

        assert_eq!(registrar.live(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_clears_all() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);

        subscriber
            .handle_message(&payload(vec![record("a", 80), record("b", 80)]))
            .await;
        subscriber.handle_message(&[]).await;

        assert_eq!(registrar.live(), 0);
        assert_eq!(registrar.released().len(), 2);
        assert!(!subscriber.has_service(&record("a", 80).identity));

        // Clearing an empty set is harmless
        subscriber.handle_message(&[]).await;
        assert_eq!(registrar.released().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let registrar = FakeRegistrar::new();
        let subscriber = subscriber(&registrar);

        subscriber.handle_message(&payload(vec![record("a", 80)])).await;
        subscriber.handle_message(b"{not json").await;

        assert_eq!(registrar.live(), 1, "state is untouched");
        assert!(registrar.released().is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_skips_only_that_record() {
        let registrar = FakeRegistrar::new();
        registrar.fail_for("bad");
        let subscriber = subscriber(&registrar);

        subscriber
            .handle_message(&payload(vec![record("bad", 80), record("good", 80)]))
            .await;

        assert_eq!(registrar.registered(), vec![record("good", 80)]);
        assert!(!subscriber.has_service(&record("bad", 80).identity));
        assert!(subscriber.has_service(&record("good", 80).identity));
    }

    #[tokio::test]
    async fn test_subscribe_feeds_messages_to_handler() {
        let bus = FakeBus::new();
        let registrar = FakeRegistrar::new();
        let subscriber = Arc::new(subscriber(&registrar));
        let cancel = CancellationToken::new();

        let task = subscriber.subscribe(&bus, TOPIC, cancel.clone()).await.unwrap();
        bus.deliver(TOPIC, payload(vec![record("a", 80)])).await;

        for _ in 0..100 {
            if subscriber.has_service(&record("a", 80).identity) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(subscriber.has_service(&record("a", 80).identity));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_an_error() {
        let bus = FakeBus::new();
        bus.reject_subscribe();
        let subscriber = Arc::new(subscriber(&FakeRegistrar::new()));

        let result = subscriber.subscribe(&bus, TOPIC, CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
