use std::net::IpAddr;
use serde::{Deserialize, Deserializer, Serialize};

/// Unique key of a service across publishers and subscribers.
/// Fields compare with exact, case-sensitive string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Instance label, e.g. "Living Room Lamp"
    pub instance: String,

    /// Service type without domain, e.g. "_hap._tcp"
    pub service: String,

    /// Domain, e.g. "local"
    pub domain: String,
}

impl ServiceIdentity {
    pub fn new(
        instance: impl Into<String>,
        service: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            service: service.into(),
            domain: domain.into(),
        }
    }
}

/// One discovered service as carried on the bus.
///
/// Equality is structural and order-sensitive: two records are equal only
/// when identity, host, port and every address and TXT attribute match
/// position by position. This is what decides whether a discovery event or
/// an incoming snapshot is actually novel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(flatten)]
    pub identity: ServiceIdentity,

    /// Target host, e.g. "lamp.local."
    pub host: String,

    pub port: u16,

    /// Addresses in announcement order, IPv4 first
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ips: Vec<IpAddr>,

    /// TXT attributes as "key=value" strings in announcement order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub txt: Vec<String>,
}

/// Full snapshot of one publisher's live services. Not a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub records: Vec<ServiceRecord>,
}

/// Some publishers encode an empty list as `null`.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
