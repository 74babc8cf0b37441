use std::time::Duration;

/// Service type bridged when none is configured
pub const DEFAULT_SERVICE_TYPE: &str = "_hap._tcp";

/// mDNS domain bridged when none is configured
pub const DEFAULT_DOMAIN: &str = "local";

/// How long one discovery cycle browses before it is restarted
pub const BROWSE_WINDOW: Duration = Duration::from_secs(30);

/// How often the publisher sweeps for stale services
pub const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// A published service not re-discovered within this window is dropped
pub const STALE_AFTER: Duration = Duration::from_secs(180);

/// Bound on waiting for the broker to acknowledge a connect or subscribe
pub const BUS_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix of generated MQTT client ids
pub const CLIENT_ID_PREFIX: &str = "mdns2mqtt";
