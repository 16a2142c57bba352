#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod network;
mod watch;

pub use self::watch::{Event, Watch};
pub use k8s_openapi::api::{
    self,
    core::v1::{EndpointAddress, EndpointSubset, Endpoints, Namespace},
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
use tracing::info_span;

/// Cluster-wide resource watches.
pub struct ResourceWatches {
    pub net_namespaces_rx: Watch<network::NetNamespace>,
    pub host_subnets_rx: Watch<network::HostSubnet>,
    pub egress_policies_rx: Watch<network::EgressNetworkPolicy>,
    pub namespaces_rx: Watch<Namespace>,
}

// === impl ResourceWatches ===

impl ResourceWatches {
    /// Limits the amount of time a watch can be idle before being reset.
    ///
    /// Must be less than 295 or Kubernetes throws an error.
    pub const DEFAULT_TIMEOUT_SECS: u32 = 290;

    pub fn new(client: Client, start_version: Option<u64>) -> Self {
        let config = watcher::Config::default().timeout(Self::DEFAULT_TIMEOUT_SECS);

        Self {
            net_namespaces_rx: Watch::from(watcher(Api::all(client.clone()), config.clone()))
                .skip_until(start_version)
                .instrument(info_span!("netnamespaces")),
            host_subnets_rx: Watch::from(watcher(Api::all(client.clone()), config.clone()))
                .skip_until(start_version)
                .instrument(info_span!("hostsubnets")),
            egress_policies_rx: Watch::from(watcher(Api::all(client.clone()), config.clone()))
                .skip_until(start_version)
                .instrument(info_span!("egressnetworkpolicies")),
            namespaces_rx: Watch::from(watcher(Api::all(client), config))
                .skip_until(start_version)
                .instrument(info_span!("namespaces")),
        }
    }
}

/// Watches the endpoints of a single namespace.
pub fn namespace_endpoints(client: Client, namespace: &str) -> Watch<Endpoints> {
    let config = watcher::Config::default().timeout(ResourceWatches::DEFAULT_TIMEOUT_SECS);
    Watch::from(watcher(Api::namespaced(client, namespace), config))
        .instrument(info_span!("endpoints", ns = %namespace))
}
