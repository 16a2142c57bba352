//! Dispatches watch events to a handler, one at a time and in order.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use overlay_controller_k8s_api::{Event, ResourceExt, Watch};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Receives the objects of a single resource type.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    async fn apply(&self, obj: T) -> anyhow::Result<()>;

    /// Called with the last known state of the object.
    async fn delete(&self, obj: T) -> anyhow::Result<()>;
}

/// An object's `(namespace, name)`.
type Key = (Option<String>, String);

/// Tracks the last known state of every object so that a relist can synthesize the deletions
/// that occurred while the watch was down.
struct Dispatch<T, H> {
    handler: H,
    known: HashMap<Key, T>,
    relisted: Option<HashSet<Key>>,
}

/// Processes events from `watch` until the stream ends.
pub async fn run<T, H>(mut watch: Watch<T>, handler: H)
where
    T: ResourceExt + Clone + Send + Sync + 'static,
    H: Handler<T>,
{
    let mut dispatch = Dispatch::new(handler);
    while let Some(ev) = watch.recv().await {
        dispatch.handle(ev).await;
    }
    info!("Watch ended");
}

/// Processes events from `watch` until `stop` fires or its sender is dropped.
pub async fn run_until<T, H>(mut watch: Watch<T>, handler: H, mut stop: oneshot::Receiver<()>)
where
    T: ResourceExt + Clone + Send + Sync + 'static,
    H: Handler<T>,
{
    let mut dispatch = Dispatch::new(handler);
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                debug!("Stopped");
                return;
            }
            ev = watch.recv() => match ev {
                Some(ev) => dispatch.handle(ev).await,
                None => {
                    info!("Watch ended");
                    return;
                }
            },
        }
    }
}

#[async_trait::async_trait]
impl<T, H> Handler<T> for Arc<H>
where
    T: Send + 'static,
    H: Handler<T> + ?Sized,
{
    async fn apply(&self, obj: T) -> anyhow::Result<()> {
        (**self).apply(obj).await
    }

    async fn delete(&self, obj: T) -> anyhow::Result<()> {
        (**self).delete(obj).await
    }
}

// === impl Dispatch ===

impl<T, H> Dispatch<T, H>
where
    T: ResourceExt + Clone + Send + Sync + 'static,
    H: Handler<T>,
{
    fn new(handler: H) -> Self {
        Self {
            handler,
            known: HashMap::new(),
            relisted: None,
        }
    }

    async fn handle(&mut self, ev: Event<T>) {
        match ev {
            Event::Init => {
                self.relisted = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key(&obj));
                }
                self.apply(obj).await;
            }
            Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let gone = self
                    .known
                    .keys()
                    .filter(|k| !relisted.contains(*k))
                    .cloned()
                    .collect::<Vec<_>>();
                for k in gone {
                    if let Some(obj) = self.known.remove(&k) {
                        debug!(ns = ?k.0, name = %k.1, "Deleted while not watching");
                        self.delete(obj).await;
                    }
                }
            }
            Event::Apply(obj) => self.apply(obj).await,
            Event::Delete(obj) => {
                self.known.remove(&key(&obj));
                self.delete(obj).await;
            }
        }
    }

    async fn apply(&mut self, obj: T) {
        let (ns, name) = key(&obj);
        self.known.insert((ns.clone(), name.clone()), obj.clone());
        if let Err(error) = self.handler.apply(obj).await {
            warn!(ns = ns.as_deref().unwrap_or(""), %name, %error, "Failed to apply");
        }
    }

    async fn delete(&mut self, obj: T) {
        let (ns, name) = key(&obj);
        if let Err(error) = self.handler.delete(obj).await {
            warn!(ns = ns.as_deref().unwrap_or(""), %name, %error, "Failed to delete");
        }
    }
}

fn key<T: ResourceExt>(obj: &T) -> Key {
    (obj.namespace(), obj.name_any())
}
