use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{
    BROWSE_WINDOW, DEFAULT_DOMAIN, DEFAULT_SERVICE_TYPE, EXPIRY_INTERVAL, STALE_AFTER,
};

const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker address: "tcp://host:port", "mqtt://host:port" or "host[:port]"
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Topic our local services are published to. No publisher without it.
    #[serde(default)]
    pub publish_topic: Option<String>,
    /// Topic remote services are received from. No subscriber without it.
    #[serde(default)]
    pub subscribe_topic: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    #[serde(default)]
    pub interface: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_domain")]
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_browse_window")]
    pub browse_window_secs: u64,
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_browse_window() -> u64 {
    BROWSE_WINDOW.as_secs()
}

fn default_expiry_interval() -> u64 {
    EXPIRY_INTERVAL.as_secs()
}

fn default_stale_after() -> u64 {
    STALE_AFTER.as_secs()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: None,
            password: None,
            publish_topic: None,
            subscribe_topic: None,
            client_id: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            service_type: default_service_type(),
            domain: default_domain(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            browse_window_secs: default_browse_window(),
            expiry_interval_secs: default_expiry_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl TimingConfig {
    pub fn browse_window(&self) -> Duration {
        Duration::from_secs(self.browse_window_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl MqttConfig {
    /// Split the broker address into host and port
    pub fn broker(&self) -> Result<(String, u16)> {
        parse_broker_address(&self.address)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Overlay values from the environment. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(address) = var("MQTT_ADDRESS") {
            self.mqtt.address = address;
        }
        if let Some(username) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = var("MQTT_PUBLISH_TOPIC") {
            self.mqtt.publish_topic = Some(topic);
        }
        if let Some(topic) = var("MQTT_SUBSCRIBE_TOPIC") {
            self.mqtt.subscribe_topic = Some(topic);
        }
        if let Some(client_id) = var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(client_id);
        }
        if let Some(interface) = var("MDNS_INTERFACE") {
            self.mdns.interface = interface;
        }

        // An empty topic in the file means "not configured"
        for topic in [&mut self.mqtt.publish_topic, &mut self.mqtt.subscribe_topic] {
            if topic.as_deref() == Some("") {
                *topic = None;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.address.is_empty() {
            bail!("MQTT broker address is required (mqtt.address or MQTT_ADDRESS)");
        }
        self.mqtt.broker()?;
        if self.mdns.interface.is_empty() {
            bail!("mDNS interface is required (mdns.interface or MDNS_INTERFACE)");
        }
        if self.timing.browse_window_secs == 0 || self.timing.expiry_interval_secs == 0 {
            bail!("Browse window and expiry interval must be non-zero");
        }
        Ok(())
    }
}

fn parse_broker_address(address: &str) -> Result<(String, u16)> {
    let rest = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address);

    if rest.contains("://") {
        bail!("Unsupported broker scheme in {}", address);
    }

    // Bracketed IPv6 literal, e.g. [fd00::1]:1883
    if let Some(inner) = rest.strip_prefix('[') {
        let (host, tail) = inner
            .split_once(']')
            .with_context(|| format!("Unterminated IPv6 literal in {}", address))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("Invalid broker port in {}", address))?,
            None => DEFAULT_MQTT_PORT,
        };
        return Ok((host.to_string(), port));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid broker port in {}", address))?;
            Ok((host.to_string(), port))
        }
        Some(_) => bail!("Missing broker host in {}", address),
        None if rest.is_empty() => bail!("Missing broker host in {}", address),
        None => Ok((rest.to_string(), DEFAULT_MQTT_PORT)),
    }
}
