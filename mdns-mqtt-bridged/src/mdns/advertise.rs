use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::types::ServiceRecord;
use super::{type_domain, MdnsEngine, ProxyHandle, ProxyRegistrar};

/// A record registered on the daemon on behalf of a remote host
pub struct MdnsProxy {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ProxyRegistrar for MdnsEngine {
    fn register(&self, record: &ServiceRecord) -> Result<Box<dyn ProxyHandle>> {
        let identity = &record.identity;
        let ty_domain = type_domain(&identity.service, &identity.domain);
        let host = fqdn(&record.host);
        let properties = txt_pairs(&record.txt);

        let service_info = ServiceInfo::new(
            &ty_domain,
            &identity.instance,
            &host,
            &record.ips[..],
            record.port,
            &properties[..],
        )
        .with_context(|| format!("Failed to create ServiceInfo for {}", identity.instance))?;

        let fullname = service_info.get_fullname().to_string();

        self.daemon
            .register(service_info)
            .with_context(|| format!("Failed to register proxy for {}", fullname))?;

        tracing::debug!(
            "Registered proxy {} for {}:{} on {}",
            fullname,
            host,
            record.port,
            self.interfaces.join(",")
        );

        Ok(Box::new(MdnsProxy {
            daemon: self.daemon.clone(),
            fullname,
        }))
    }
}

impl ProxyHandle for MdnsProxy {
    fn release(self: Box<Self>) -> Result<()> {
        self.daemon
            .unregister(&self.fullname)
            .with_context(|| format!("Failed to unregister proxy {}", self.fullname))?;

        tracing::debug!("Unregistered proxy {}", self.fullname);
        Ok(())
    }
}

fn fqdn(host: &str) -> String {
    if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{}.", host)
    }
}

/// "key=value" attributes back into ordered pairs. A bare "key" gets an
/// empty value.
fn txt_pairs(txt: &[String]) -> Vec<(String, String)> {
    txt.iter()
        .map(|attr| match attr.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (attr.clone(), String::new()),
        })
        .collect()
}
