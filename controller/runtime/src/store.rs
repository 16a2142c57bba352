use crate::{
    core::{BindingStore, NamespaceBinding, StoreError, Vnid},
    k8s::{
        network::{NetNamespace, NetNamespaceSpec, NAMESPACE_UID_ANNOTATION},
        Api, Client, ObjectMeta, ResourceExt,
    },
};
use anyhow::anyhow;
use kube::api::{DeleteParams, ListParams, PostParams};

/// Persists namespace bindings as cluster-scoped `NetNamespace` resources named after their
/// namespace.
#[derive(Clone)]
pub struct KubeBindingStore {
    api: Api<NetNamespace>,
}

// === impl KubeBindingStore ===

impl KubeBindingStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

impl std::fmt::Debug for KubeBindingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBindingStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BindingStore for KubeBindingStore {
    async fn get(&self, name: &str) -> Result<NamespaceBinding, StoreError> {
        let netns = self.api.get(name).await.map_err(store_error)?;
        Ok(to_binding(netns))
    }

    async fn list(&self) -> Result<Vec<NamespaceBinding>, StoreError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(store_error)?;
        Ok(list.items.into_iter().map(to_binding).collect())
    }

    async fn create(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError> {
        let netns = self
            .api
            .create(&PostParams::default(), &from_binding(binding))
            .await
            .map_err(store_error)?;
        Ok(to_binding(netns))
    }

    async fn update(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError> {
        if binding.resource_version.is_none() {
            return Err(StoreError::Other(anyhow!(
                "binding for {} has no resource version",
                binding.name
            )));
        }
        let name = binding.name.clone();
        let netns = self
            .api
            .replace(&name, &PostParams::default(), &from_binding(binding))
            .await
            .map_err(store_error)?;
        Ok(to_binding(netns))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn to_binding(netns: NetNamespace) -> NamespaceBinding {
    let uid = netns.annotations().get(NAMESPACE_UID_ANNOTATION).cloned();
    NamespaceBinding {
        name: netns.spec.net_name,
        vnid: Vnid::new(netns.spec.net_id),
        uid,
        resource_version: netns.metadata.resource_version,
    }
}

fn from_binding(binding: NamespaceBinding) -> NetNamespace {
    let NamespaceBinding {
        name,
        vnid,
        uid,
        resource_version,
    } = binding;
    NetNamespace {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            annotations: uid.map(|uid| {
                std::iter::once((NAMESPACE_UID_ANNOTATION.to_string(), uid)).collect()
            }),
            resource_version,
            ..Default::default()
        },
        spec: NetNamespaceSpec {
            net_name: name,
            net_id: vnid.get(),
        },
    }
}

fn store_error(error: kube::Error) -> StoreError {
    if let kube::Error::Api(rsp) = &error {
        match rsp.code {
            404 => return StoreError::NotFound,
            409 => return StoreError::Conflict,
            _ => {}
        }
    }
    StoreError::Other(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_round_trip_through_resources() {
        let binding = NamespaceBinding {
            name: "ns-a".to_string(),
            vnid: Vnid::new(11),
            uid: Some("uid-a".to_string()),
            resource_version: Some("42".to_string()),
        };
        let netns = from_binding(binding.clone());
        assert_eq!(netns.name_any(), "ns-a");
        assert_eq!(netns.spec.net_id, 11);
        assert_eq!(
            netns.annotations().get(NAMESPACE_UID_ANNOTATION).map(String::as_str),
            Some("uid-a")
        );
        assert_eq!(to_binding(netns), binding);
    }

    #[test]
    fn maps_api_status_codes() {
        let api_error = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: String::new(),
                reason: String::new(),
                code,
            })
        };
        assert!(matches!(store_error(api_error(404)), StoreError::NotFound));
        assert!(matches!(store_error(api_error(409)), StoreError::Conflict));
        assert!(matches!(store_error(api_error(500)), StoreError::Other(_)));
    }
}
