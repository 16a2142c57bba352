//! Custom resources of the `network.overlay.io` API group.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation through which a namespace requests a specific network id (or `global`).
pub const REQUESTED_VNID_ANNOTATION: &str = "network.overlay.io/requested-vnid";

/// Annotation recording the uid of the namespace a `NetNamespace` was created for.
pub const NAMESPACE_UID_ANNOTATION: &str = "network.overlay.io/namespace-uid";

/// Binds a namespace to its virtual network id.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "network.overlay.io", version = "v1", kind = "NetNamespace")]
#[serde(rename_all = "camelCase")]
pub struct NetNamespaceSpec {
    pub net_name: String,
    pub net_id: u32,
}

/// The subnet assigned to a host, and the address its tunnel endpoint is reachable on.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "network.overlay.io", version = "v1", kind = "HostSubnet")]
#[serde(rename_all = "camelCase")]
pub struct HostSubnetSpec {
    pub host: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    pub subnet: String,
}

/// Ordered egress rules for the pods of a namespace.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.overlay.io",
    version = "v1",
    kind = "EgressNetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressNetworkPolicySpec {
    #[serde(default)]
    pub egress: Vec<EgressNetworkPolicyRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressNetworkPolicyRule {
    #[serde(rename = "type")]
    pub rule_type: EgressNetworkPolicyRuleType,
    pub to: EgressNetworkPolicyPeer,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EgressNetworkPolicyRuleType {
    Allow,
    Deny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressNetworkPolicyPeer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr_selector: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}
