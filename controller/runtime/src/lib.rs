#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use overlay_controller_core as core;
pub use overlay_controller_k8s_api as k8s;
pub use overlay_controller_k8s_index as index;

mod args;
mod dns;
mod ovs;
mod store;

pub use self::{args::Args, dns::SystemResolver, ovs::OvsOfctl, store::KubeBindingStore};

use index::EndpointsHandler;
use tokio::sync::watch;

/// Publishes the latest filtered endpoint set to subscribers.
#[derive(Debug)]
pub struct PublishEndpoints(watch::Sender<Vec<k8s::Endpoints>>);

// === impl PublishEndpoints ===

impl Default for PublishEndpoints {
    fn default() -> Self {
        Self(watch::Sender::new(Vec::new()))
    }
}

impl PublishEndpoints {
    pub fn subscribe(&self) -> watch::Receiver<Vec<k8s::Endpoints>> {
        self.0.subscribe()
    }
}

impl EndpointsHandler for PublishEndpoints {
    fn on_endpoints_update(&self, endpoints: Vec<k8s::Endpoints>) {
        tracing::debug!(endpoints = endpoints.len(), "Publishing endpoints");
        self.0.send_replace(endpoints);
    }
}
