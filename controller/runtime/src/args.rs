use crate::{
    core::{Allocator, ClusterNetworks, EgressDns, FlowController, IpNet, Registry},
    dns::SystemResolver,
    index::{
        self, metrics::Instrumented, EgressPolicies, EndpointFilter, EndpointsWatches, Firewall,
        HostSubnets, Namespaces, NetNamespaces, VnidMap,
    },
    k8s::{self, ResourceWatches},
    ovs::OvsOfctl,
    store::KubeBindingStore,
    PublishEndpoints,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry as Prometheus;
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "overlay-controller", about = "A multi-tenant overlay network controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "overlay=info,warn",
        env = "OVERLAY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Network CIDR of pod IPs.
    #[clap(long)]
    cluster_network: IpNet,

    /// Network CIDR of service IPs.
    #[clap(long)]
    service_network: IpNet,

    /// The tunnel address of this host. Flows are never installed for it.
    #[clap(long)]
    local_host_ip: Ipv4Addr,

    /// Namespaces that are bound to the global network when first seen.
    #[clap(long, default_value = "default", value_delimiter = ',')]
    global_namespaces: Vec<String>,

    #[clap(long, default_value = "br0")]
    ovs_bridge: String,

    #[clap(long, default_value = "1800")]
    dns_refresh_interval_secs: u64,

    /// Disables network id assignment. Ids are then expected to be managed by another replica.
    #[clap(long)]
    registry_disabled: bool,

    /// Skips watch events at or before this resource version.
    #[clap(long)]
    start_resource_version: Option<u64>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            cluster_network,
            service_network,
            local_host_ip,
            global_namespaces,
            ovs_bridge,
            dns_refresh_interval_secs,
            registry_disabled,
            start_resource_version,
        } = self;

        if dns_refresh_interval_secs == 0 {
            bail!("--dns-refresh-interval-secs must be positive");
        }

        let networks = ClusterNetworks {
            cluster_network,
            service_network,
        };

        // Build the shared state that the watch loops maintain.
        let allocator = Arc::new(Allocator::default());
        let resolver = SystemResolver::from_system_conf()?;
        let dns = Arc::new(EgressDns::new(Arc::new(resolver)));
        let vnids = Arc::new(VnidMap::default());
        let firewall = Arc::new(Firewall::new(vnids.clone(), dns.clone()));
        let flows = Arc::new(FlowController::new(
            Arc::new(OvsOfctl::new(ovs_bridge)),
            local_host_ip,
        ));
        let publish = Arc::new(PublishEndpoints::default());
        let endpoints = Arc::new(EndpointFilter::new(
            networks,
            firewall.clone(),
            publish.clone(),
        ));

        let mut prom = <Prometheus>::default();
        index::metrics::register(
            prom.sub_registry_with_prefix("overlay"),
            Instrumented {
                allocator: (!registry_disabled).then(|| allocator.clone()),
                firewall: Some(firewall.clone()),
                dns: Some(dns.clone()),
                flows: Some(flows.clone()),
                endpoints: Some(endpoints.clone()),
            },
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Ids held by existing bindings must be reserved before any namespace is processed.
        let registry = if registry_disabled {
            info!("Network id assignment is disabled");
            None
        } else {
            let store = Arc::new(KubeBindingStore::new(runtime.client()));
            let registry = Registry::new(store, allocator, global_namespaces);
            registry
                .sync()
                .await
                .context("failed to load network bindings")?;
            Some(Arc::new(registry))
        };

        // Spawn resource watches.

        let ResourceWatches {
            net_namespaces_rx,
            host_subnets_rx,
            egress_policies_rx,
            namespaces_rx,
        } = ResourceWatches::new(runtime.client(), start_resource_version);

        tokio::spawn(
            index::sync::run(net_namespaces_rx, NetNamespaces::new(vnids, firewall.clone()))
                .instrument(info_span!("netnamespaces")),
        );

        tokio::spawn(
            index::sync::run(host_subnets_rx, HostSubnets::new(flows))
                .instrument(info_span!("hostsubnets")),
        );

        tokio::spawn(
            index::sync::run(
                egress_policies_rx,
                EgressPolicies::new(firewall.clone(), dns.clone()),
            )
            .instrument(info_span!("egressnetworkpolicies")),
        );

        let client = runtime.client();
        let watches: EndpointsWatches =
            Arc::new(move |ns: &str| k8s::namespace_endpoints(client.clone(), ns));
        tokio::spawn(
            index::sync::run(
                namespaces_rx,
                Namespaces::new(registry, endpoints.clone(), watches),
            )
            .instrument(info_span!("namespaces")),
        );

        tokio::spawn(
            index::policies::refresh_dns(
                dns,
                firewall.clone(),
                Duration::from_secs(dns_refresh_interval_secs),
            )
            .instrument(info_span!("dns")),
        );

        tokio::spawn(
            endpoints
                .run_refilter(firewall.subscribe())
                .instrument(info_span!("refilter")),
        );

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
