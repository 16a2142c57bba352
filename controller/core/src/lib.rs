#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dns;
pub mod egress;
pub mod flow;
pub mod registry;
pub mod vnid;

pub use self::{
    dns::{DnsCache, DnsErrors, EgressDns, Resolve},
    egress::{EgressRule, FirewallRule, InvalidRule, RuleAction, RuleTarget},
    flow::{FlowController, FlowError, OvsCtl},
    registry::{Assignment, BindingStore, NamespaceBinding, Registry, RegistryError, StoreError},
    vnid::{AllocError, Allocator, Vnid},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// The networks whose addresses are never subject to egress filtering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNetworks {
    pub cluster_network: IpNet,
    pub service_network: IpNet,
}

impl ClusterNetworks {
    pub fn contains(&self, addr: &std::net::IpAddr) -> bool {
        self.cluster_network.contains(addr) || self.service_network.contains(addr)
    }
}
