pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use anyhow::Result;

/// Broker-mediated topic channel
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish at least once with the retained flag set
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe at least once. Payloads for `topic` arrive on the returned
    /// channel; an error means the broker did not confirm the subscription.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}
