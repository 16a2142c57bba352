use crate::{endpoints::EndpointFilter, firewall::Firewall};
use overlay_controller_core::{Allocator, EgressDns, FlowController};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{counter::ConstCounter, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

/// The components whose state is exported. Absent components are not reported.
#[derive(Clone, Debug, Default)]
pub struct Instrumented {
    pub allocator: Option<Arc<Allocator>>,
    pub firewall: Option<Arc<Firewall>>,
    pub dns: Option<Arc<EgressDns>>,
    pub flows: Option<Arc<FlowController>>,
    pub endpoints: Option<Arc<EndpointFilter>>,
}

pub fn register(reg: &mut Registry, instrumented: Instrumented) {
    reg.register_collector(Box::new(instrumented));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        if let Some(allocator) = &self.allocator {
            gauge(
                &mut encoder,
                "vnids_allocated",
                "The number of allocated network ids",
                allocator.allocated_count(),
            )?;
            gauge(
                &mut encoder,
                "vnids_capacity",
                "The number of allocatable network ids",
                allocator.capacity(),
            )?;
        }

        if let Some(firewall) = &self.firewall {
            gauge(
                &mut encoder,
                "firewall_namespaces",
                "The number of namespaces with egress policies",
                firewall.namespace_count(),
            )?;
            gauge(
                &mut encoder,
                "firewall_conflicted_namespaces",
                "The number of namespaces with more than one egress policy",
                firewall.conflicted_count(),
            )?;
        }

        if let Some(dns) = &self.dns {
            gauge(
                &mut encoder,
                "dns_domains",
                "The number of domain names resolved for egress policies",
                dns.domain_count(),
            )?;
        }

        if let Some(flows) = &self.flows {
            gauge(
                &mut encoder,
                "flow_hosts",
                "The number of remote hosts with installed flows",
                flows.host_count(),
            )?;
        }

        if let Some(endpoints) = &self.endpoints {
            let forwarded = ConstCounter::new(endpoints.forwarded_count());
            let forwarded_encoder = encoder.encode_descriptor(
                "endpoints_forwarded",
                "The number of endpoints forwarded to the proxy",
                None,
                forwarded.metric_type(),
            )?;
            forwarded.encode(forwarded_encoder)?;

            let dropped = ConstCounter::new(endpoints.dropped_count());
            let dropped_encoder = encoder.encode_descriptor(
                "endpoints_dropped",
                "The number of endpoints withheld because they point at firewalled destinations",
                None,
                dropped.metric_type(),
            )?;
            dropped.encode(dropped_encoder)?;
        }

        Ok(())
    }
}

fn gauge(
    encoder: &mut DescriptorEncoder<'_>,
    name: &str,
    help: &str,
    value: usize,
) -> Result<(), std::fmt::Error> {
    let metric_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
    ConstGauge::new(value as i64).encode(metric_encoder)
}
