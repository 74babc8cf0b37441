use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use mdns_sd::{ServiceEvent, ServiceInfo};
use anyhow::{anyhow, Context, Result};
use super::{type_domain, Browser, DiscoveryEvent, MdnsEngine};

#[async_trait]
impl Browser for MdnsEngine {
    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
        window: Duration,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<()> {
        let ty_domain = type_domain(service_type, domain);
        let receiver = self
            .daemon
            .browse(&ty_domain)
            .with_context(|| format!("Failed to browse {}", ty_domain))?;

        tracing::debug!("Browsing {} for {:?}", ty_domain, window);

        let deadline = Instant::now() + window;
        let result = loop {
            let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(event) => event,
                Err(_) => break Ok(()),
            };

            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => match convert_service_info(&info) {
                    Some(event) => {
                        tracing::debug!("Resolved service: {}", info.get_fullname());
                        if events.send(event).await.is_err() {
                            break Ok(());
                        }
                    }
                    None => {
                        tracing::debug!("Skipping unparseable service name {}", info.get_fullname());
                    }
                },
                Ok(_) => {}
                Err(e) => break Err(anyhow!("mDNS browse channel for {} closed: {}", ty_domain, e)),
            }
        };

        if let Err(e) = self.daemon.stop_browse(&ty_domain) {
            tracing::warn!("Failed to stop browsing {}: {}", ty_domain, e);
        }

        result
    }
}

/// Convert an mdns-sd ServiceInfo to a DiscoveryEvent
fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveryEvent> {
    let (service, domain) = split_type_domain(info.get_type())?;
    let instance = info
        .get_fullname()
        .strip_suffix(info.get_type())?
        .strip_suffix('.')?
        .to_string();

    // The daemon reports an unordered set; sort so equal sets compare equal
    let mut ipv4: Vec<Ipv4Addr> = Vec::new();
    let mut ipv6: Vec<Ipv6Addr> = Vec::new();
    for addr in info.get_addresses().iter() {
        match addr {
            IpAddr::V4(v4) => ipv4.push(*v4),
            IpAddr::V6(v6) => ipv6.push(*v6),
        }
    }
    ipv4.sort();
    ipv6.sort();

    let txt = info
        .get_properties()
        .iter()
        .map(|prop| match prop.val() {
            Some(val) => format!("{}={}", prop.key(), String::from_utf8_lossy(val)),
            None => prop.key().to_string(),
        })
        .collect();

    Some(DiscoveryEvent {
        instance,
        service,
        domain,
        host: info.get_hostname().to_string(),
        port: info.get_port(),
        ipv4,
        ipv6,
        txt,
    })
}

/// "_hap._tcp.local." -> ("_hap._tcp", "local")
fn split_type_domain(ty_domain: &str) -> Option<(String, String)> {
    let trimmed = ty_domain.trim_end_matches('.');
    let (service, domain) = trimmed.rsplit_once('.')?;
    if service.is_empty() || domain.is_empty() {
        return None;
    }
    Some((service.to_string(), domain.to_string()))
}
