//! Namespace-to-VNID bindings.
//!
//! The registry owns the allocator: every reservation it makes is provisional until the binding
//! that references it has been durably written, and is rolled back if that write fails. An id is
//! only released once no surviving binding references it and no update that will reference it is
//! in flight.

use crate::vnid::{AllocError, Allocator, Vnid};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The number of times an update is attempted when the stored binding changes underneath it.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// A namespace's network binding as persisted in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceBinding {
    pub name: String,
    pub vnid: Vnid,
    pub uid: Option<String>,

    /// Set by the store. Updates are rejected with [`StoreError::Conflict`] if the stored
    /// version no longer matches.
    pub resource_version: Option<String>,
}

/// How a namespace's VNID is chosen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// The smallest free id.
    Next,

    /// A specific id. On create the id must be free; on update an id already held by another
    /// namespace joins that namespace's network.
    Exact(Vnid),

    /// The global id: not isolated from any other namespace.
    Global,
}

/// Durable storage of namespace bindings.
#[async_trait::async_trait]
pub trait BindingStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<NamespaceBinding, StoreError>;

    async fn list(&self) -> Result<Vec<NamespaceBinding>, StoreError>;

    async fn create(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError>;

    /// Replaces the binding if its `resource_version` still matches the stored one.
    async fn update(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("binding not found")]
    NotFound,

    #[error("binding was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("namespace {0} has no network binding")]
    NamespaceNotFound(String),

    #[error(transparent)]
    Allocator(#[from] AllocError),

    #[error("network binding for namespace {0} was modified concurrently")]
    ConflictingUpdate(String),

    #[error("failed to write network binding for namespace {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },
}

pub struct Registry {
    store: Arc<dyn BindingStore>,
    allocator: Arc<Allocator>,
    global_namespaces: HashSet<String>,

    /// Ids that an in-flight update is about to reference, with the number of such updates.
    holds: Mutex<HashMap<Vnid, usize>>,
}

/// Keeps an id reserved while a binding that references it is being written.
struct Hold<'a> {
    holds: &'a Mutex<HashMap<Vnid, usize>>,
    vnid: Vnid,
}

// === impl Registry ===

impl Registry {
    pub fn new(
        store: Arc<dyn BindingStore>,
        allocator: Arc<Allocator>,
        global_namespaces: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            allocator,
            global_namespaces: global_namespaces.into_iter().collect(),
            holds: Default::default(),
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Reserves the ids of all stored bindings. Must complete before any other operation so that
    /// ids are never handed out twice across restarts.
    pub async fn sync(&self) -> Result<(), RegistryError> {
        let bindings = self.store.list().await.map_err(|source| RegistryError::Store {
            name: "*".to_string(),
            source,
        })?;

        let mut seen = HashSet::new();
        for NamespaceBinding { name, vnid, .. } in bindings {
            if vnid.is_global() || !seen.insert(vnid) {
                continue;
            }
            match self.allocator.allocate(vnid) {
                Ok(()) => debug!(namespace = %name, %vnid, "Reserved stored network id"),
                Err(AllocError::AlreadyAllocated(_)) => {}
                Err(error) => {
                    warn!(namespace = %name, %vnid, %error, "Stored network id cannot be reserved")
                }
            }
        }
        info!(allocated = self.allocator.allocated_count(), "Synced network ids");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<NamespaceBinding, RegistryError> {
        self.store
            .get(name)
            .await
            .map_err(|source| self.store_error(name, source))
    }

    #[instrument(skip(self, uid), fields(namespace = %name))]
    pub async fn create(
        &self,
        name: &str,
        uid: Option<String>,
        assignment: Assignment,
    ) -> Result<NamespaceBinding, RegistryError> {
        let assignment = if self.global_namespaces.contains(name) {
            Assignment::Global
        } else {
            assignment
        };

        let vnid = match assignment {
            Assignment::Global => Vnid::GLOBAL,
            Assignment::Exact(vnid) if vnid.is_global() => Vnid::GLOBAL,
            Assignment::Exact(vnid) => {
                self.allocator.allocate(vnid)?;
                vnid
            }
            Assignment::Next => self.allocator.allocate_next()?,
        };

        let binding = NamespaceBinding {
            name: name.to_string(),
            vnid,
            uid,
            resource_version: None,
        };
        match self.store.create(binding).await {
            Ok(binding) => {
                info!(%vnid, "Assigned network id");
                Ok(binding)
            }
            Err(source) => {
                // The reservation was provisional, unless another namespace joined it meanwhile.
                self.release_if_unreferenced(vnid).await;
                Err(RegistryError::Store {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    #[instrument(skip(self), fields(namespace = %name))]
    pub async fn update(
        &self,
        name: &str,
        assignment: Assignment,
    ) -> Result<NamespaceBinding, RegistryError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let old = self.get(name).await?;
            let Some((vnid, hold)) = self.choose(&old, assignment)? else {
                debug!(vnid = %old.vnid, "Network id unchanged");
                return Ok(old);
            };

            let update = NamespaceBinding {
                vnid,
                ..old.clone()
            };
            let res = self.store.update(update).await;
            drop(hold);

            match res {
                Ok(updated) => {
                    info!(old = %old.vnid, new = %vnid, "Changed network id");
                    self.release_if_unreferenced(old.vnid).await;
                    return Ok(updated);
                }
                Err(error) => {
                    self.release_if_unreferenced(vnid).await;
                    match error {
                        StoreError::Conflict => {
                            debug!(attempt, "Binding changed concurrently; retrying");
                            continue;
                        }
                        source => return Err(self.store_error(name, source)),
                    }
                }
            }
        }

        Err(RegistryError::ConflictingUpdate(name.to_string()))
    }

    #[instrument(skip(self), fields(namespace = %name))]
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let binding = self.get(name).await?;
        match self.store.delete(name).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(source) => return Err(self.store_error(name, source)),
        }
        info!(vnid = %binding.vnid, "Deleted network binding");
        self.release_if_unreferenced(binding.vnid).await;
        Ok(())
    }

    /// Picks the id for an update. Returns `None` if the id does not change.
    ///
    /// An `Exact` id that is already reserved is held by another network, which the namespace
    /// joins.
    fn choose(
        &self,
        old: &NamespaceBinding,
        assignment: Assignment,
    ) -> Result<Option<(Vnid, Option<Hold<'_>>)>, AllocError> {
        let (vnid, hold) = match assignment {
            Assignment::Global => (Vnid::GLOBAL, None),
            Assignment::Exact(vnid) if vnid.is_global() => (vnid, None),
            Assignment::Exact(vnid) if vnid == old.vnid => return Ok(None),
            Assignment::Exact(vnid) => (vnid, Some(self.hold(vnid)?)),
            Assignment::Next => {
                let hold = self.hold_next()?;
                (hold.vnid, Some(hold))
            }
        };

        if vnid == old.vnid {
            return Ok(None);
        }
        Ok(Some((vnid, hold)))
    }

    /// Reserves `vnid` unless it is already reserved, and keeps it from being released until the
    /// hold is dropped.
    fn hold(&self, vnid: Vnid) -> Result<Hold<'_>, AllocError> {
        let mut holds = self.holds.lock();
        match self.allocator.allocate(vnid) {
            Ok(()) | Err(AllocError::AlreadyAllocated(_)) => {}
            Err(error) => return Err(error),
        }
        *holds.entry(vnid).or_default() += 1;
        Ok(Hold {
            holds: &self.holds,
            vnid,
        })
    }

    fn hold_next(&self) -> Result<Hold<'_>, AllocError> {
        let mut holds = self.holds.lock();
        let vnid = self.allocator.allocate_next()?;
        *holds.entry(vnid).or_default() += 1;
        Ok(Hold {
            holds: &self.holds,
            vnid,
        })
    }

    /// Releases `vnid` unless a live binding still references it or an update is about to.
    ///
    /// The store is re-read immediately before releasing so that a binding created concurrently
    /// keeps its id. Bindings still being written are covered by their hold.
    async fn release_if_unreferenced(&self, vnid: Vnid) {
        if vnid.is_global() {
            return;
        }

        match self.store.list().await {
            Ok(bindings) => {
                if let Some(holder) = bindings.iter().find(|b| b.vnid == vnid) {
                    debug!(%vnid, holder = %holder.name, "Network id still in use");
                    return;
                }
                let holds = self.holds.lock();
                if holds.contains_key(&vnid) {
                    debug!(%vnid, "Network id has an update in flight");
                    return;
                }
                self.allocator.release(vnid);
                drop(holds);
                debug!(%vnid, "Released network id");
            }
            Err(error) => {
                // The id stays reserved until the next sync.
                warn!(%vnid, %error, "Failed to list bindings; network id not released");
            }
        }
    }

    fn store_error(&self, name: &str, source: StoreError) -> RegistryError {
        match source {
            StoreError::NotFound => RegistryError::NamespaceNotFound(name.to_string()),
            StoreError::Conflict => RegistryError::ConflictingUpdate(name.to_string()),
            source => RegistryError::Store {
                name: name.to_string(),
                source,
            },
        }
    }
}

// === impl Hold ===

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        let mut holds = self.holds.lock();
        if let Some(n) = holds.get_mut(&self.vnid) {
            *n -= 1;
            if *n == 0 {
                holds.remove(&self.vnid);
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("allocator", &self.allocator)
            .field("global_namespaces", &self.global_namespaces)
            .finish_non_exhaustive()
    }
}
