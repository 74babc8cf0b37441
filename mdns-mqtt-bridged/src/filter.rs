use std::sync::Arc;
use shared::types::ServiceIdentity;
use crate::subscriber::Subscriber;

/// Decides whether a locally discovered identity may be published
pub type ServiceFilter = Arc<dyn Fn(&ServiceIdentity) -> bool + Send + Sync>;

pub fn accept_all() -> ServiceFilter {
    Arc::new(|_: &ServiceIdentity| true)
}

/// Reject whatever `subscriber` is announcing on behalf of a remote, so its
/// proxies are not echoed back onto the bus.
pub fn exclude_announced(subscriber: Option<Arc<Subscriber>>) -> ServiceFilter {
    match subscriber {
        Some(subscriber) => Arc::new(move |identity: &ServiceIdentity| !subscriber.has_service(identity)),
        None => accept_all(),
    }
}
