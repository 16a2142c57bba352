use crate::{
    endpoints::{EndpointFilter, EndpointsHandler},
    firewall::Firewall,
    hosts::HostSubnets,
    namespaces::Namespaces,
    sync::Handler,
    vnids::VnidMap,
};
use futures::prelude::*;
use maplit::btreemap;
use overlay_controller_core::{
    Allocator, BindingStore, ClusterNetworks, EgressDns, EgressRule, FlowController,
    FlowError, NamespaceBinding, OvsCtl, Registry, RegistryError, Resolve, RuleAction,
    StoreError, Vnid,
};
use overlay_controller_k8s_api::{
    network::{HostSubnet, HostSubnetSpec, REQUESTED_VNID_ANNOTATION},
    watcher, EndpointAddress, EndpointSubset, Endpoints, Event, Namespace, ObjectMeta,
    ResourceExt, Watch,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use tokio::sync::watch;

// === Endpoint filter ===

/// Publishes the names of the forwarded endpoints.
struct Downstream(watch::Sender<Vec<String>>);

impl EndpointsHandler for Downstream {
    fn on_endpoints_update(&self, endpoints: Vec<Endpoints>) {
        let names = endpoints
            .iter()
            .map(|ep| format!("{}/{}", ep.namespace().unwrap_or_default(), ep.name_any()))
            .collect();
        self.0.send_replace(names);
    }
}

struct NoDns;

#[async_trait::async_trait]
impl Resolve for NoDns {
    async fn lookup_ip(&self, _: &str) -> anyhow::Result<Vec<IpAddr>> {
        anyhow::bail!("resolution disabled")
    }
}

fn endpoints(ns: &str, name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

fn networks() -> ClusterNetworks {
    ClusterNetworks {
        cluster_network: "10.128.0.0/14".parse().unwrap(),
        service_network: "172.30.0.0/16".parse().unwrap(),
    }
}

fn deny_all() -> Vec<EgressRule> {
    vec![EgressRule::parse(RuleAction::Deny, Some("0.0.0.0/0"), None).unwrap()]
}

fn filter() -> (
    Arc<Firewall>,
    Arc<EndpointFilter>,
    watch::Receiver<Vec<String>>,
) {
    let firewall = Arc::new(Firewall::new(
        Arc::new(VnidMap::default()),
        Arc::new(EgressDns::new(Arc::new(NoDns))),
    ));
    let (tx, rx) = watch::channel(vec![]);
    let filter = Arc::new(EndpointFilter::new(
        networks(),
        firewall.clone(),
        Arc::new(Downstream(tx)),
    ));
    (firewall, filter, rx)
}

#[test]
fn endpoints_pass_through_without_a_firewall() {
    let (_, filter, rx) = filter();
    filter.on_endpoints_update(vec![
        endpoints("ns-a", "web", &["8.8.8.8"]),
        endpoints("ns-a", "db", &["10.128.0.5"]),
    ]);
    assert_eq!(*rx.borrow(), vec!["ns-a/db", "ns-a/web"]);
    assert_eq!(filter.dropped_count(), 0);
}

#[test]
fn cluster_and_service_addresses_are_exempt() {
    let (firewall, filter, rx) = filter();
    firewall.apply_policy("ns-a", "p1", deny_all());

    filter.on_endpoints_update(vec![
        endpoints("ns-a", "pods", &["10.128.0.5"]),
        endpoints("ns-a", "svc", &["172.30.0.10"]),
        endpoints("ns-a", "external", &["10.128.0.6", "8.8.8.8"]),
        endpoints("ns-b", "external", &["8.8.8.8"]),
    ]);
    assert_eq!(
        *rx.borrow(),
        vec!["ns-a/pods", "ns-a/svc", "ns-b/external"],
        "the whole object is withheld when any address is blocked"
    );
    assert_eq!(filter.dropped_count(), 1);
}

#[test]
fn filtering_is_idempotent() {
    let (firewall, filter, mut rx) = filter();
    firewall.apply_policy("ns-a", "p1", deny_all());
    let input = vec![
        endpoints("ns-a", "b", &["8.8.4.4"]),
        endpoints("ns-b", "a", &["8.8.8.8"]),
    ];

    filter.on_endpoints_update(input.clone());
    let first = rx.borrow_and_update().clone();
    filter.on_endpoints_update(input.into_iter().rev().collect());
    let second = rx.borrow_and_update().clone();
    assert_eq!(first, second);
    assert_eq!(first, vec!["ns-b/a"]);
}

#[test]
fn incremental_updates() {
    let (firewall, filter, rx) = filter();
    firewall.apply_policy("ns-a", "p1", deny_all());

    EndpointFilter::apply(&filter, endpoints("ns-a", "web", &["10.128.0.5"]));
    assert_eq!(*rx.borrow(), vec!["ns-a/web"]);

    // The endpoint moves outside the cluster.
    EndpointFilter::apply(&filter, endpoints("ns-a", "web", &["8.8.8.8"]));
    assert!(rx.borrow().is_empty());

    EndpointFilter::apply(&filter, endpoints("ns-b", "web", &["8.8.8.8"]));
    EndpointFilter::apply(&filter, endpoints("ns-c", "web", &["8.8.8.8"]));
    EndpointFilter::delete(&filter, &endpoints("ns-b", "web", &[]));
    assert_eq!(*rx.borrow(), vec!["ns-c/web"]);

    filter.remove_namespace("ns-c");
    assert!(rx.borrow().is_empty());
}

#[tokio::test]
async fn firewall_changes_refilter() {
    let (firewall, filter, mut rx) = filter();
    filter.on_endpoints_update(vec![endpoints("ns-a", "web", &["8.8.8.8"])]);
    assert_eq!(*rx.borrow_and_update(), vec!["ns-a/web"]);

    let task = tokio::spawn(filter.clone().run_refilter(firewall.subscribe()));

    firewall.apply_policy("ns-a", "p1", deny_all());
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().is_empty());

    firewall.delete_policy("ns-a", "p1");
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), vec!["ns-a/web"]);

    task.abort();
}

// === Host subnets ===

#[derive(Default)]
struct Ovs(Mutex<Vec<String>>);

#[async_trait::async_trait]
impl OvsCtl for Ovs {
    async fn add_flow(&self, directive: &str) -> Result<(), FlowError> {
        self.0.lock().push(format!("add {directive}"));
        Ok(())
    }

    async fn del_flows(&self, directive: &str) -> Result<(), FlowError> {
        self.0.lock().push(format!("del {directive}"));
        Ok(())
    }
}

fn host_subnet(host: &str, ip: &str, subnet: &str) -> HostSubnet {
    HostSubnet::new(
        host,
        HostSubnetSpec {
            host: host.to_string(),
            host_ip: ip.to_string(),
            subnet: subnet.to_string(),
        },
    )
}

#[tokio::test]
async fn host_subnets_program_flows() {
    let ovs = Arc::new(Ovs::default());
    let flows = Arc::new(FlowController::new(ovs.clone(), Ipv4Addr::new(192, 168, 0, 1)));
    let hosts = HostSubnets::new(flows.clone());

    hosts
        .apply(host_subnet("local", "192.168.0.1", "10.128.0.0/23"))
        .await
        .unwrap();
    assert!(ovs.0.lock().is_empty());

    let remote = host_subnet("remote", "192.168.0.2", "10.128.2.0/23");
    hosts.apply(remote.clone()).await.unwrap();
    assert_eq!(ovs.0.lock().len(), 2);
    assert_eq!(flows.host_count(), 1);

    hosts.delete(remote).await.unwrap();
    assert_eq!(
        ovs.0.lock()[2..],
        [
            "del table=6,cookie=0xc0a80002/0xffffffff".to_string(),
            "del table=7,cookie=0xc0a80002/0xffffffff".to_string(),
        ]
    );
    assert_eq!(flows.host_count(), 0);

    let err = hosts
        .apply(host_subnet("bad", "not-an-ip", "10.128.4.0/23"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not-an-ip"), "{err}");
}

#[tokio::test]
async fn moved_host_drops_flows_for_old_address() {
    let ovs = Arc::new(Ovs::default());
    let flows = Arc::new(FlowController::new(ovs.clone(), Ipv4Addr::new(192, 168, 0, 1)));
    let hosts = HostSubnets::new(flows.clone());

    hosts
        .apply(host_subnet("remote", "192.168.0.2", "10.128.2.0/23"))
        .await
        .unwrap();
    hosts
        .apply(host_subnet("remote", "192.168.0.3", "10.128.2.0/23"))
        .await
        .unwrap();
    assert_eq!(flows.host_count(), 1);
    assert_eq!(
        ovs.0.lock()[2..4],
        [
            "del table=6,cookie=0xc0a80002/0xffffffff".to_string(),
            "del table=7,cookie=0xc0a80002/0xffffffff".to_string(),
        ]
    );

    // The last programmed address is removed even if the deleted object disagrees.
    hosts
        .delete(host_subnet("remote", "192.168.0.9", "10.128.2.0/23"))
        .await
        .unwrap();
    assert_eq!(flows.host_count(), 0);
    assert_eq!(
        ovs.0.lock().last().map(String::as_str),
        Some("del table=7,cookie=0xc0a80003/0xffffffff")
    );
}

// === Namespaces ===

#[derive(Default)]
struct MemStore(Mutex<BTreeMap<String, NamespaceBinding>>);

#[async_trait::async_trait]
impl BindingStore for MemStore {
    async fn get(&self, name: &str) -> Result<NamespaceBinding, StoreError> {
        self.0.lock().get(name).cloned().ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<NamespaceBinding>, StoreError> {
        Ok(self.0.lock().values().cloned().collect())
    }

    async fn create(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError> {
        let mut bindings = self.0.lock();
        if bindings.contains_key(&binding.name) {
            return Err(StoreError::Conflict);
        }
        bindings.insert(binding.name.clone(), binding.clone());
        Ok(binding)
    }

    async fn update(&self, binding: NamespaceBinding) -> Result<NamespaceBinding, StoreError> {
        let mut bindings = self.0.lock();
        let stored = bindings.get_mut(&binding.name).ok_or(StoreError::NotFound)?;
        *stored = binding.clone();
        Ok(binding)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.0
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

fn namespace(name: &str, requested: Option<&str>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            annotations: requested.map(|v| {
                btreemap! {
                    REQUESTED_VNID_ANNOTATION.to_string() => v.to_string(),
                }
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn namespaces() -> (Arc<Registry>, Namespaces) {
    let registry = Arc::new(Registry::new(
        Arc::new(MemStore::default()),
        Arc::new(Allocator::default()),
        vec!["default".to_string()],
    ));
    let (_, filter, _) = filter();
    let handler = Namespaces::new(
        Some(registry.clone()),
        filter,
        Arc::new(|_: &str| {
            Watch::from(stream::pending::<Result<Event<Endpoints>, watcher::Error>>())
        }),
    );
    (registry, handler)
}

#[tokio::test]
async fn namespace_lifecycle_binds_and_releases_ids() {
    let (registry, namespaces) = namespaces();

    namespaces.apply(namespace("ns-a", None)).await.unwrap();
    assert_eq!(registry.get("ns-a").await.unwrap().vnid, Vnid::new(10));

    let err = namespaces
        .apply(namespace("ns-b", Some("10")))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::Allocator(_))
        ),
        "{err}"
    );
    assert_eq!(namespaces.watched(), vec!["ns-a", "ns-b"]);

    namespaces.delete(namespace("ns-a", None)).await.unwrap();
    assert!(!registry.allocator().is_allocated(Vnid::new(10)));
    assert_eq!(namespaces.watched(), vec!["ns-b"]);

    namespaces
        .apply(namespace("ns-b", Some("10")))
        .await
        .unwrap();
    assert_eq!(registry.get("ns-b").await.unwrap().vnid, Vnid::new(10));
}

#[tokio::test]
async fn requested_ids_are_applied_to_existing_bindings() {
    let (registry, namespaces) = namespaces();

    namespaces.apply(namespace("ns-a", None)).await.unwrap();
    namespaces.apply(namespace("ns-b", None)).await.unwrap();
    assert_eq!(registry.get("ns-b").await.unwrap().vnid, Vnid::new(11));

    // ns-b joins ns-a's network.
    namespaces
        .apply(namespace("ns-b", Some("10")))
        .await
        .unwrap();
    assert_eq!(registry.get("ns-b").await.unwrap().vnid, Vnid::new(10));
    assert!(!registry.allocator().is_allocated(Vnid::new(11)));

    namespaces
        .apply(namespace("ns-b", Some("global")))
        .await
        .unwrap();
    assert!(registry.get("ns-b").await.unwrap().vnid.is_global());

    // Configured global namespaces never consume an id.
    namespaces.apply(namespace("default", None)).await.unwrap();
    assert!(registry.get("default").await.unwrap().vnid.is_global());

    // Invalid requests are ignored.
    namespaces
        .apply(namespace("ns-c", Some("bogus")))
        .await
        .unwrap();
    assert_eq!(
        registry.get("ns-c").await.unwrap().vnid,
        Vnid::new(11),
        "the smallest free id"
    );
}

#[tokio::test]
async fn deleting_an_unbound_namespace_is_not_an_error() {
    let (_, namespaces) = namespaces();
    namespaces.delete(namespace("ns-x", None)).await.unwrap();
}

#[tokio::test]
async fn deleting_a_namespace_waits_for_its_endpoints_watch() {
    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Event<Endpoints>, watcher::Error>>();
    let rx = Mutex::new(Some(rx));
    let (_, filter, out) = filter();
    let namespaces = Namespaces::new(
        None,
        filter,
        Arc::new(move |_: &str| match rx.lock().take() {
            Some(rx) => Watch::from(rx),
            None => Watch::from(stream::pending()),
        }),
    );

    namespaces.apply(namespace("ns-a", None)).await.unwrap();
    tx.unbounded_send(Ok(Event::Apply(endpoints("ns-a", "web", &["10.128.0.5"]))))
        .unwrap();
    while out.borrow().is_empty() {
        tokio::task::yield_now().await;
    }

    namespaces.delete(namespace("ns-a", None)).await.unwrap();
    assert!(tx.is_closed(), "the watch task must have exited");
    assert!(out.borrow().is_empty());
    assert!(namespaces.watched().is_empty());
}
