mod bus;
mod config;
mod filter;
mod mdns;
mod publisher;
mod subscriber;
mod tracking;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::bus::mqtt::MqttBus;
use crate::config::Config;
use crate::mdns::MdnsEngine;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mdns_mqtt_bridged=info"))
        )
        .init();

    tracing::info!("Starting mdns-mqtt-bridged");

    // Config file is optional; the environment can supply everything
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())
        .context("Failed to initialize config")?;

    if let Some(path) = &config_path {
        tracing::info!("Loaded config from {}", path.display());
    }

    if config.mqtt.publish_topic.is_none() && config.mqtt.subscribe_topic.is_none() {
        tracing::info!("No publish or subscribe topic configured. Nothing to do.");
        return Ok(());
    }

    let engine = Arc::new(MdnsEngine::new(std::slice::from_ref(&config.mdns.interface))?);
    let bus = Arc::new(MqttBus::connect(&config.mqtt).await?);
    let cancel = CancellationToken::new();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let subscriber = match &config.mqtt.subscribe_topic {
        Some(topic) => {
            let subscriber = Arc::new(Subscriber::new(engine.clone()));
            let task = subscriber
                .subscribe(bus.as_ref(), topic, cancel.clone())
                .await
                .context("Failed to initialize subscriber")?;
            tasks.push(task);
            Some(subscriber)
        }
        None => None,
    };

    let publisher = config.mqtt.publish_topic.as_ref().map(|topic| {
        let filter = filter::exclude_announced(subscriber.clone());
        Arc::new(Publisher::new(
            bus.clone(),
            engine.clone(),
            topic.as_str(),
            filter,
            config.timing.clone(),
        ))
    });

    let mut discovery = publisher.as_ref().map(|publisher| {
        let expiry_publisher = publisher.clone();
        let expiry_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { expiry_publisher.run_expiry(expiry_cancel).await }));

        let run_publisher = publisher.clone();
        let run_cancel = cancel.clone();
        let service_type = config.mdns.service_type.clone();
        let domain = config.mdns.domain.clone();
        tokio::spawn(async move { run_publisher.run(&service_type, &domain, run_cancel).await })
    });

    // Run until interrupted or discovery breaks
    let (outcome, discovery_ended) = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
            (Ok(()), false)
        }
        result = wait_for_discovery(discovery.as_mut()) => (result, true),
    };
    if discovery_ended {
        discovery = None;
    }

    // Nothing may publish after the topic is cleared
    cancel.cancel();
    if let Some(task) = discovery {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Discovery ended with an error: {:#}", e),
            Err(e) => tracing::error!("Discovery task panicked: {}", e),
        }
    }
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task panicked: {}", e);
        }
    }

    if let Some(publisher) = &publisher {
        if let Err(e) = publisher.clear_topic().await {
            tracing::error!("Failed to clear published snapshot: {:#}", e);
        }
    }

    if let Some(subscriber) = &subscriber {
        subscriber.withdraw_all().await;
    }

    if let Err(e) = bus.disconnect().await {
        tracing::error!("{:#}", e);
    }

    if let Err(e) = engine.shutdown() {
        tracing::error!("{:#}", e);
    }

    tracing::info!("Shutdown complete");
    outcome
}

/// Resolves only if the discovery loop ends; never without a publisher
async fn wait_for_discovery(task: Option<&mut JoinHandle<Result<()>>>) -> Result<()> {
    match task {
        Some(task) => task
            .await
            .context("Discovery task panicked")?
            .context("mDNS discovery failed"),
        None => std::future::pending().await,
    }
}
