//! Filters service endpoints that point at destinations a namespace's firewall blocks.
//!
//! The proxy cannot apply egress policy itself, so an `Endpoints` object with any address that
//! its namespace may not reach is withheld in its entirety.

use crate::{firewall::Firewall, sync::Handler};
use overlay_controller_core::ClusterNetworks;
use overlay_controller_k8s_api::{Endpoints, ResourceExt};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Consumes the filtered endpoint set.
pub trait EndpointsHandler: Send + Sync {
    /// Called with the complete set of endpoints each time it may have changed. Equivalent sets
    /// may be delivered more than once.
    fn on_endpoints_update(&self, endpoints: Vec<Endpoints>);
}

pub struct EndpointFilter {
    networks: ClusterNetworks,
    firewall: Arc<Firewall>,
    downstream: Arc<dyn EndpointsHandler>,

    /// Held while filtering and forwarding so that updates reach the downstream handler in order.
    all: Mutex<BTreeMap<(String, String), Endpoints>>,

    forwarded: AtomicU64,
    dropped: AtomicU64,
}

// === impl EndpointFilter ===

impl EndpointFilter {
    pub fn new(
        networks: ClusterNetworks,
        firewall: Arc<Firewall>,
        downstream: Arc<dyn EndpointsHandler>,
    ) -> Self {
        Self {
            networks,
            firewall,
            downstream,
            all: Default::default(),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Replaces the complete endpoint set.
    pub fn on_endpoints_update(&self, endpoints: Vec<Endpoints>) {
        let mut all = self.all.lock();
        *all = endpoints.into_iter().map(|ep| (key(&ep), ep)).collect();
        self.forward(&all);
    }

    pub fn apply(&self, endpoints: Endpoints) {
        let mut all = self.all.lock();
        all.insert(key(&endpoints), endpoints);
        self.forward(&all);
    }

    pub fn delete(&self, endpoints: &Endpoints) {
        let mut all = self.all.lock();
        if all.remove(&key(endpoints)).is_some() {
            self.forward(&all);
        }
    }

    /// Drops the endpoints of a deleted namespace.
    pub fn remove_namespace(&self, namespace: &str) {
        let mut all = self.all.lock();
        let before = all.len();
        all.retain(|(ns, _), _| ns != namespace);
        if all.len() != before {
            debug!(%namespace, removed = before - all.len(), "Removed namespace endpoints");
            self.forward(&all);
        }
    }

    /// Re-runs the filter against the current endpoint set.
    pub fn refilter(&self) {
        let all = self.all.lock();
        self.forward(&all);
    }

    /// Re-runs the filter whenever the firewall changes.
    pub async fn run_refilter(self: Arc<Self>, mut changes: watch::Receiver<u64>) {
        while changes.changed().await.is_ok() {
            let generation = *changes.borrow_and_update();
            debug!(generation, "Firewall changed");
            self.refilter();
        }
        info!("Firewall dropped");
    }

    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn forward(&self, all: &BTreeMap<(String, String), Endpoints>) {
        if self.firewall.is_empty() {
            self.forwarded
                .fetch_add(all.len() as u64, Ordering::Relaxed);
            self.downstream
                .on_endpoints_update(all.values().cloned().collect());
            return;
        }

        let filtered = all
            .iter()
            .filter(|((ns, name), ep)| match self.blocked_addr(ns, ep) {
                Some(addr) => {
                    warn!(
                        namespace = %ns,
                        %name,
                        %addr,
                        "Service has an endpoint pointing to a firewalled destination"
                    );
                    false
                }
                None => true,
            })
            .map(|(_, ep)| ep.clone())
            .collect::<Vec<_>>();

        let dropped = all.len() - filtered.len();
        trace!(forwarded = filtered.len(), dropped, "Filtered endpoints");
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        self.forwarded
            .fetch_add(filtered.len() as u64, Ordering::Relaxed);
        self.downstream.on_endpoints_update(filtered);
    }

    /// Returns the first external address of `ep` that the firewall blocks.
    fn blocked_addr(&self, namespace: &str, ep: &Endpoints) -> Option<IpAddr> {
        ep.subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .filter_map(|addr| match addr.ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!(ip = %addr.ip, "Ignoring unparseable endpoint address");
                    None
                }
            })
            .filter(|ip| !self.networks.contains(ip))
            .find(|ip| self.firewall.blocks(namespace, *ip))
    }
}

impl std::fmt::Debug for EndpointFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointFilter")
            .field("networks", &self.networks)
            .field("endpoints", &self.all.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Handler<Endpoints> for EndpointFilter {
    async fn apply(&self, endpoints: Endpoints) -> anyhow::Result<()> {
        EndpointFilter::apply(self, endpoints);
        Ok(())
    }

    async fn delete(&self, endpoints: Endpoints) -> anyhow::Result<()> {
        EndpointFilter::delete(self, &endpoints);
        Ok(())
    }
}

fn key(ep: &Endpoints) -> (String, String) {
    (ep.namespace().unwrap_or_default(), ep.name_any())
}
