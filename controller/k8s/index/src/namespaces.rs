//! Reacts to namespace lifecycle: binds each namespace to a network id and maintains a watch on
//! its endpoints.

use crate::{endpoints::EndpointFilter, sync};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use overlay_controller_core::{Assignment, Registry, RegistryError, Vnid};
use overlay_controller_k8s_api::{
    network::REQUESTED_VNID_ANNOTATION, Endpoints, Namespace, ResourceExt, Watch,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Opens an endpoints watch scoped to a namespace.
pub type EndpointsWatches = Arc<dyn Fn(&str) -> Watch<Endpoints> + Send + Sync>;

pub struct Namespaces {
    registry: Option<Arc<Registry>>,
    endpoints: Arc<EndpointFilter>,
    watches: EndpointsWatches,
    running: Mutex<HashMap<String, Running>>,
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

// === impl Namespaces ===

impl Namespaces {
    /// When `registry` is `None` network ids are managed elsewhere and only endpoint watches are
    /// maintained.
    pub fn new(
        registry: Option<Arc<Registry>>,
        endpoints: Arc<EndpointFilter>,
        watches: EndpointsWatches,
    ) -> Self {
        Self {
            registry,
            endpoints,
            watches,
            running: Default::default(),
        }
    }

    /// The namespaces with a running endpoints watch.
    pub fn watched(&self) -> Vec<String> {
        let mut names = self.running.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    async fn bind(&self, registry: &Registry, ns: &Namespace) -> Result<()> {
        let name = ns.name_any();
        let requested = requested_assignment(ns);
        match registry.get(&name).await {
            Ok(binding) => match requested {
                Some(assignment) if !satisfies(binding.vnid, assignment) => {
                    registry.update(&name, assignment).await?;
                }
                _ => debug!(vnid = %binding.vnid, "Already bound"),
            },
            Err(RegistryError::NamespaceNotFound(_)) => {
                registry
                    .create(&name, ns.uid(), requested.unwrap_or(Assignment::Next))
                    .await?;
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    fn start_watch(&self, name: &str) {
        let mut running = self.running.lock();
        if running.contains_key(name) {
            return;
        }
        let (stop, stop_rx) = oneshot::channel();
        let watch = (self.watches)(name);
        let task = tokio::spawn(
            sync::run_until(watch, self.endpoints.clone(), stop_rx)
                .instrument(info_span!("endpoints", ns = %name)),
        );
        running.insert(name.to_string(), Running { stop, task });
        debug!("Started endpoints watch");
    }

    /// Returns once the namespace's endpoints watch has exited, so that it can no longer deliver
    /// updates.
    async fn stop_watch(&self, name: &str) {
        let Some(Running { stop, task }) = self.running.lock().remove(name) else {
            return;
        };
        let _ = stop.send(());
        if let Err(error) = task.await {
            warn!(%error, "Endpoints watch failed");
        }
        debug!("Stopped endpoints watch");
    }
}

#[async_trait::async_trait]
impl sync::Handler<Namespace> for Namespaces {
    #[instrument(skip_all, fields(ns = %ns.name_any()))]
    async fn apply(&self, ns: Namespace) -> Result<()> {
        if ns.metadata.deletion_timestamp.is_some() {
            debug!("Namespace is terminating");
            return Ok(());
        }

        self.start_watch(&ns.name_any());
        if let Some(registry) = self.registry.as_deref() {
            self.bind(registry, &ns).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(ns = %ns.name_any()))]
    async fn delete(&self, ns: Namespace) -> Result<()> {
        let name = ns.name_any();
        self.stop_watch(&name).await;
        self.endpoints.remove_namespace(&name);

        if let Some(registry) = self.registry.as_deref() {
            match registry.delete(&name).await {
                Ok(()) => info!("Released network binding"),
                Err(RegistryError::NamespaceNotFound(_)) => debug!("Namespace was not bound"),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Namespaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespaces")
            .field("registry", &self.registry)
            .field("watched", &self.running.lock().len())
            .finish_non_exhaustive()
    }
}

/// Reads the network id a namespace asks for: `global` or a number.
fn requested_assignment(ns: &Namespace) -> Option<Assignment> {
    let value = ns.annotations().get(REQUESTED_VNID_ANNOTATION)?;
    if value.eq_ignore_ascii_case("global") {
        return Some(Assignment::Global);
    }
    match value.parse::<Vnid>() {
        Ok(vnid) => Some(Assignment::Exact(vnid)),
        Err(error) => {
            warn!(annotation = %value, %error, "Ignoring invalid requested network id");
            None
        }
    }
}

fn satisfies(current: Vnid, assignment: Assignment) -> bool {
    match assignment {
        Assignment::Global => current.is_global(),
        Assignment::Exact(vnid) => current == vnid,
        Assignment::Next => true,
    }
}
