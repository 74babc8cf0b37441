pub mod advertise;
pub mod browser;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use shared::types::{ServiceIdentity, ServiceRecord};

/// A service resolved on the local segment
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub instance: String,
    pub service: String,
    pub domain: String,
    pub host: String,
    pub port: u16,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub txt: Vec<String>,
}

impl DiscoveryEvent {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(&self.instance, &self.service, &self.domain)
    }

    /// Build the bus record. IPv4 addresses come first, and IPv4-mapped IPv6
    /// addresses are folded back to IPv4.
    pub fn into_record(self) -> ServiceRecord {
        let identity = self.identity();
        let ips = self
            .ipv4
            .into_iter()
            .map(IpAddr::V4)
            .chain(self.ipv6.into_iter().map(IpAddr::V6))
            .map(|ip| ip.to_canonical())
            .collect();

        ServiceRecord {
            identity,
            host: self.host,
            port: self.port,
            ips,
            txt: self.txt,
        }
    }
}

/// Source of discovery events for one service type
#[async_trait]
pub trait Browser: Send + Sync {
    /// Browse for `window`, sending every resolved service to `events`.
    /// Returns once the window lapses; an error means browsing is broken.
    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
        window: Duration,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<()>;
}

/// Announces records on the local segment on behalf of remote hosts
pub trait ProxyRegistrar: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<Box<dyn ProxyHandle>>;
}

/// A live proxy announcement. Dropping it without `release` leaves it
/// announced until the daemon exits.
pub trait ProxyHandle: Send {
    fn release(self: Box<Self>) -> Result<()>;
}

/// mdns-sd daemon bound to a fixed interface set
pub struct MdnsEngine {
    daemon: ServiceDaemon,
    interfaces: Vec<String>,
}

impl MdnsEngine {
    pub fn new(interfaces: &[String]) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .context("Failed to create mDNS daemon")?;
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        for interface in interfaces {
            daemon
                .enable_interface(interface.as_str())
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }

        tracing::info!("mDNS daemon bound to {}", interfaces.join(","));

        Ok(Self {
            daemon,
            interfaces: interfaces.to_vec(),
        })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.daemon
            .shutdown()
            .context("Failed to shut down mDNS daemon")?;
        Ok(())
    }
}

/// "_hap._tcp" + "local" -> "_hap._tcp.local."
pub fn type_domain(service: &str, domain: &str) -> String {
    format!(
        "{}.{}.",
        service.trim_end_matches('.'),
        domain.trim_matches('.')
    )
}
