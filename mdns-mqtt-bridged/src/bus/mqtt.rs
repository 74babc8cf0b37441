use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use anyhow::{anyhow, bail, Context, Result};
use shared::protocol::{BUS_ACK_TIMEOUT, CLIENT_ID_PREFIX};
use crate::config::MqttConfig;
use super::Bus;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 64;

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// Hands SUBACKs to a `subscribe` call, but only while one is waiting.
/// Acks for resubscriptions after a reconnect are dropped.
struct SubAckGate {
    waiting: AtomicBool,
    tx: mpsc::UnboundedSender<SubAck>,
}

impl SubAckGate {
    fn new(tx: mpsc::UnboundedSender<SubAck>) -> Self {
        Self {
            waiting: AtomicBool::new(false),
            tx,
        }
    }

    fn open(&self) {
        self.waiting.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.waiting.store(false, Ordering::SeqCst);
    }

    /// Returns true if the ack was handed on
    fn offer(&self, ack: SubAck) -> bool {
        if !self.waiting.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(ack).is_ok()
    }
}

/// MQTT connection driven by a background event-loop task
pub struct MqttBus {
    client: AsyncClient,
    routes: Routes,
    gate: Arc<SubAckGate>,
    subacks: tokio::sync::Mutex<mpsc::UnboundedReceiver<SubAck>>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect and wait for the broker's CONNACK
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let (host, port) = config.broker()?;
        let client_id = client_id(config);

        let mut options = MqttOptions::new(client_id.clone(), host.clone(), port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        if let Some(topic) = &config.publish_topic {
            // Clears the retained snapshot if we vanish without a clean disconnect
            options.set_last_will(LastWill::new(topic, Vec::new(), QoS::AtLeastOnce, true));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(SubAckGate::new(suback_tx));
        let closing = Arc::new(AtomicBool::new(false));
        let (connected_tx, connected_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            routes.clone(),
            gate.clone(),
            closing.clone(),
            connected_tx,
        ));

        match tokio::time::timeout(BUS_ACK_TIMEOUT, connected_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                return Err(e).with_context(|| format!("Failed to connect to MQTT broker {}:{}", host, port))
            }
            Ok(Err(_)) => bail!("MQTT event loop exited before connecting"),
            Err(_) => bail!("Timeout connecting to MQTT broker {}:{}", host, port),
        }

        tracing::info!("Connected to MQTT broker {}:{} as {}", host, port, client_id);

        Ok(Self {
            client,
            routes,
            gate,
            subacks: tokio::sync::Mutex::new(suback_rx),
            closing,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Disconnect cleanly. Requests queued before this one, such as a final
    /// publish, are written before the event loop stops.
    pub async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .context("Failed to disconnect from MQTT broker")?;

        let driver = self.driver.lock().ok().and_then(|mut driver| driver.take());
        if let Some(driver) = driver {
            match tokio::time::timeout(BUS_ACK_TIMEOUT, driver).await {
                Ok(Ok(())) => tracing::info!("Disconnected from MQTT broker"),
                Ok(Err(e)) => bail!("MQTT event loop panicked: {}", e),
                Err(_) => bail!("Timeout flushing MQTT connection"),
            }
        }
        Ok(())
    }
}

impl MqttBus {
    async fn await_suback(
        &self,
        subacks: &mut mpsc::UnboundedReceiver<SubAck>,
        topic: &str,
    ) -> Result<SubAck> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;

        match tokio::time::timeout(BUS_ACK_TIMEOUT, subacks.recv()).await {
            Ok(Some(ack)) => Ok(ack),
            Ok(None) => bail!("MQTT event loop exited while subscribing to {}", topic),
            Err(_) => bail!("Timeout subscribing to MQTT topic {}", topic),
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        // One subscribe in flight at a time so the next SUBACK is ours
        let mut subacks = self.subacks.lock().await;
        while subacks.try_recv().is_ok() {}

        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(topic.to_string(), tx);
        }

        self.gate.open();
        let ack = self.await_suback(&mut subacks, topic).await;
        self.gate.close();
        let ack = ack?;

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            bail!("Broker rejected subscription to {}", topic);
        }

        tracing::info!("Subscribed to {}", topic);
        Ok(rx)
    }
}

/// Poll the connection until a clean disconnect. Incoming publishes are
/// routed by exact topic; after a reconnect every routed topic is subscribed
/// again.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    gate: Arc<SubAckGate>,
    closing: Arc<AtomicBool>,
    connected: oneshot::Sender<Result<()>>,
) {
    let mut connected = Some(connected);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(connected) = connected.take() {
                    let _ = connected.send(Ok(()));
                    continue;
                }
                tracing::info!("Reconnected to MQTT broker");
                resubscribe(&client, routed_topics(&routes));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let route = routes
                    .lock()
                    .ok()
                    .and_then(|routes| routes.get(&publish.topic).cloned());
                match route {
                    Some(tx) => {
                        if tx.send(publish.payload.to_vec()).await.is_err() {
                            tracing::debug!("Dropping message for closed subscription {}", publish.topic);
                        }
                    }
                    None => tracing::debug!("Ignoring message on unrouted topic {}", publish.topic),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if !gate.offer(ack) {
                    tracing::debug!("Ignoring SUBACK nobody is waiting for");
                }
            }
            // Everything queued ahead of the DISCONNECT has been written
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                if let Some(connected) = connected.take() {
                    let _ = connected.send(Err(anyhow!(e)));
                    return;
                }
                if closing.load(Ordering::SeqCst) {
                    tracing::warn!("MQTT connection closed during shutdown: {}", e);
                    return;
                }
                tracing::warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Queue a subscribe for each topic without waiting on the request channel,
/// which only the event-loop task drains. Topics that do not fit are handed
/// to a task of their own. Returns how many were deferred.
fn resubscribe(client: &AsyncClient, topics: Vec<String>) -> usize {
    let mut deferred = 0;
    for topic in topics {
        if client.try_subscribe(topic.as_str(), QoS::AtLeastOnce).is_ok() {
            continue;
        }
        deferred += 1;
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                tracing::error!("Failed to resubscribe to {}: {}", topic, e);
            }
        });
    }
    deferred
}

fn routed_topics(routes: &Routes) -> Vec<String> {
    routes
        .lock()
        .map(|routes| routes.keys().cloned().collect())
        .unwrap_or_default()
}

/// Publishers get a stable id derived from their topic, so a restarted bridge
/// takes over its previous session.
fn client_id(config: &MqttConfig) -> String {
    if let Some(client_id) = &config.client_id {
        return client_id.clone();
    }

    let seed = match &config.publish_topic {
        Some(topic) => topic.clone(),
        None => {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("{}/{}", host, std::process::id())
        }
    };

    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    format!("{}-{}", CLIENT_ID_PREFIX, &digest[..8])
}
