//! Overlay network controller indexes
//!
//! Each index consumes one watched resource type through a [`sync::Handler`]:
//!
//! - `NetNamespace` resources publish each namespace's network id into the [`vnids::VnidMap`].
//! - `EgressNetworkPolicy` resources are resolved (DNS names included) into the
//!   [`firewall::Firewall`].
//! - `HostSubnet` resources drive the tunnel flows of the [`overlay_controller_core::FlowController`].
//! - `Namespace` resources are bound to network ids in the registry, and each live namespace gets
//!   its own `Endpoints` watch feeding the [`endpoints::EndpointFilter`].
//!
//! ```text
//! [ NetNamespace ] -> [ VnidMap ] -> [ Firewall ] <- [ EgressNetworkPolicy ] + [ DNS ]
//!                                        |
//!                                        v
//! [ Namespace ] -> [ Endpoints watch ] -> [ EndpointFilter ] -> proxy
//! ```
//!
//! The firewall signals every change so that the endpoint filter can re-run against the last
//! known endpoint set.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod firewall;
pub mod hosts;
pub mod metrics;
pub mod namespaces;
pub mod policies;
pub mod sync;
pub mod vnids;

#[cfg(test)]
mod tests;

pub use self::{
    endpoints::{EndpointFilter, EndpointsHandler},
    firewall::Firewall,
    hosts::HostSubnets,
    namespaces::{EndpointsWatches, Namespaces},
    policies::EgressPolicies,
    sync::Handler,
    vnids::{NetNamespaces, VnidMap},
};
