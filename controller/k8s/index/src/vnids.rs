use crate::{firewall::Firewall, sync::Handler};
use ahash::AHashMap as HashMap;
use overlay_controller_core::Vnid;
use overlay_controller_k8s_api::{network::NetNamespace, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The network id of every namespace, as published through `NetNamespace` resources.
#[derive(Debug, Default)]
pub struct VnidMap {
    ids: RwLock<HashMap<String, Vnid>>,
}

/// Maintains a [`VnidMap`] from the `NetNamespace` watch.
///
/// The firewall is notified whenever a namespace joins or leaves the global network, since that
/// changes whether its policy is enforced.
#[derive(Clone, Debug)]
pub struct NetNamespaces {
    vnids: Arc<VnidMap>,
    firewall: Arc<Firewall>,
}

// === impl VnidMap ===

impl VnidMap {
    pub fn get(&self, namespace: &str) -> Option<Vnid> {
        self.ids.read().get(namespace).copied()
    }

    /// Namespaces without a known id are not global.
    pub fn is_global(&self, namespace: &str) -> bool {
        self.get(namespace).is_some_and(Vnid::is_global)
    }

    /// Returns the previous id, if any.
    pub fn set(&self, namespace: impl Into<String>, vnid: Vnid) -> Option<Vnid> {
        self.ids.write().insert(namespace.into(), vnid)
    }

    pub fn remove(&self, namespace: &str) -> Option<Vnid> {
        self.ids.write().remove(namespace)
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

// === impl NetNamespaces ===

impl NetNamespaces {
    pub fn new(vnids: Arc<VnidMap>, firewall: Arc<Firewall>) -> Self {
        Self { vnids, firewall }
    }
}

#[async_trait::async_trait]
impl Handler<NetNamespace> for NetNamespaces {
    #[instrument(skip_all, fields(name = %netns.name_any()))]
    async fn apply(&self, netns: NetNamespace) -> anyhow::Result<()> {
        let name = netns.spec.net_name;
        let vnid = Vnid::new(netns.spec.net_id);
        let old = self.vnids.set(name.clone(), vnid);
        debug!(namespace = %name, %vnid, "Updated network id");

        if old.map(Vnid::is_global) != Some(vnid.is_global()) {
            self.firewall.notify();
        }
        Ok(())
    }

    #[instrument(skip_all, fields(name = %netns.name_any()))]
    async fn delete(&self, netns: NetNamespace) -> anyhow::Result<()> {
        if let Some(vnid) = self.vnids.remove(&netns.spec.net_name) {
            debug!(namespace = %netns.spec.net_name, %vnid, "Removed network id");
            if vnid.is_global() {
                self.firewall.notify();
            }
        }
        Ok(())
    }
}
