use crate::sync::Handler;
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use overlay_controller_core::{FlowController, Ipv4Net};
use overlay_controller_k8s_api::{network::HostSubnet, ResourceExt};
use parking_lot::Mutex;
use std::{net::Ipv4Addr, sync::Arc};
use tracing::{info, instrument};

/// Programs tunnel flows for every `HostSubnet`.
#[derive(Debug)]
pub struct HostSubnets {
    flows: Arc<FlowController>,

    /// The address each `HostSubnet` was last programmed with, by name.
    host_ips: Mutex<HashMap<String, Ipv4Addr>>,
}

impl HostSubnets {
    pub fn new(flows: Arc<FlowController>) -> Self {
        Self {
            flows,
            host_ips: Default::default(),
        }
    }
}

#[async_trait::async_trait]
impl Handler<HostSubnet> for HostSubnets {
    #[instrument(skip_all, fields(name = %hs.name_any(), host = %hs.spec.host))]
    async fn apply(&self, hs: HostSubnet) -> Result<()> {
        let host_ip = parse_host_ip(&hs)?;
        let subnet = hs
            .spec
            .subnet
            .parse::<Ipv4Net>()
            .with_context(|| format!("invalid subnet {:?}", hs.spec.subnet))?;

        let name = hs.name_any();
        let previous = self.host_ips.lock().get(&name).copied();
        if let Some(old) = previous.filter(|old| *old != host_ip) {
            info!(%old, new = %host_ip, "Host address changed");
            self.flows.delete_rules(old).await?;
        }
        self.flows.add_rules(host_ip, subnet).await?;
        self.host_ips.lock().insert(name, host_ip);
        Ok(())
    }

    #[instrument(skip_all, fields(name = %hs.name_any(), host = %hs.spec.host))]
    async fn delete(&self, hs: HostSubnet) -> Result<()> {
        let name = hs.name_any();
        let recorded = self.host_ips.lock().get(&name).copied();
        let host_ip = match recorded {
            Some(ip) => ip,
            None => parse_host_ip(&hs)?,
        };
        self.flows.delete_rules(host_ip).await?;
        self.host_ips.lock().remove(&name);
        Ok(())
    }
}

fn parse_host_ip(hs: &HostSubnet) -> Result<Ipv4Addr> {
    hs.spec
        .host_ip
        .parse()
        .with_context(|| format!("invalid host IP {:?}", hs.spec.host_ip))
}
