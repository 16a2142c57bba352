use crate::{firewall::Firewall, sync::Handler};
use anyhow::{bail, Context, Result};
use overlay_controller_core::{EgressDns, EgressRule, RuleAction};
use overlay_controller_k8s_api::{
    network::{EgressNetworkPolicy, EgressNetworkPolicyRuleType},
    ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, instrument, warn};

/// Feeds `EgressNetworkPolicy` resources into the DNS cache and the firewall.
#[derive(Clone, Debug)]
pub struct EgressPolicies {
    firewall: Arc<Firewall>,
    dns: Arc<EgressDns>,
}

// === impl EgressPolicies ===

impl EgressPolicies {
    pub fn new(firewall: Arc<Firewall>, dns: Arc<EgressDns>) -> Self {
        Self { firewall, dns }
    }
}

#[async_trait::async_trait]
impl Handler<EgressNetworkPolicy> for EgressPolicies {
    #[instrument(skip_all, fields(ns = ?policy.namespace(), name = %policy.name_any()))]
    async fn apply(&self, policy: EgressNetworkPolicy) -> Result<()> {
        let (namespace, uid) = identity(&policy)?;
        let rules = parse_rules(&policy).context("invalid egress policy; keeping previous rules")?;

        let domains = rules
            .iter()
            .filter_map(|r| r.dns_name().map(str::to_string))
            .collect::<Vec<_>>();
        let mut addrs_changed = false;
        if domains.is_empty() {
            self.dns.delete_policy(&uid);
        } else {
            let (changed, res) = self.dns.add_policy(&uid, domains).await;
            if let Err(error) = res {
                // Unresolved names are retried on the next refresh.
                warn!(%uid, %error, "Failed to resolve egress policy names");
            }
            addrs_changed = changed;
        }

        self.firewall.apply_policy(&namespace, &uid, rules);
        if addrs_changed {
            // The rules may be unchanged while their addresses are not.
            self.firewall.notify();
        }
        Ok(())
    }

    #[instrument(skip_all, fields(ns = ?policy.namespace(), name = %policy.name_any()))]
    async fn delete(&self, policy: EgressNetworkPolicy) -> Result<()> {
        let (namespace, uid) = identity(&policy)?;
        self.firewall.delete_policy(&namespace, &uid);
        self.dns.delete_policy(&uid);
        Ok(())
    }
}

fn identity(policy: &EgressNetworkPolicy) -> Result<(String, String)> {
    let Some(namespace) = policy.namespace() else {
        bail!("egress policy has no namespace");
    };
    let Some(uid) = policy.uid() else {
        bail!("egress policy has no uid");
    };
    Ok((namespace, uid))
}

fn parse_rules(policy: &EgressNetworkPolicy) -> Result<Vec<EgressRule>> {
    policy
        .spec
        .egress
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let action = match rule.rule_type {
                EgressNetworkPolicyRuleType::Allow => RuleAction::Allow,
                EgressNetworkPolicyRuleType::Deny => RuleAction::Deny,
            };
            EgressRule::parse(
                action,
                rule.to.cidr_selector.as_deref(),
                rule.to.dns_name.as_deref(),
            )
            .with_context(|| format!("rule {i}"))
        })
        .collect()
}

/// Re-resolves egress policy names every `interval`, signaling the firewall when any address
/// changes.
pub async fn refresh_dns(dns: Arc<EgressDns>, firewall: Arc<Firewall>, interval: Duration) {
    let mut timer = time::interval_at(time::Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let changed = dns.refresh_all().await;
        if changed.is_empty() {
            debug!("No DNS changes");
            continue;
        }
        info!(policies = ?changed, "Egress policy addresses changed");
        firewall.notify();
    }
}
