//! Per-namespace egress firewall.
//!
//! A namespace may have at most one egress policy. While more than one exists the namespace is
//! conflicted and all of its egress to external destinations is blocked until the extra policies
//! are removed.

use crate::vnids::VnidMap;
use ahash::AHashMap as HashMap;
use overlay_controller_core::{EgressDns, EgressRule, RuleAction, RuleTarget};
use parking_lot::RwLock;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub struct Firewall {
    vnids: Arc<VnidMap>,
    dns: Arc<EgressDns>,
    namespaces: RwLock<HashMap<String, NamespaceFirewall>>,
    changes: watch::Sender<u64>,
}

/// The policies of a namespace, keyed by UID.
#[derive(Debug, Default)]
struct NamespaceFirewall {
    policies: BTreeMap<String, Vec<EgressRule>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum State<'a> {
    NoPolicy,
    SinglePolicy { uid: &'a str, rules: &'a [EgressRule] },
    Conflicted,
}

// === impl Firewall ===

impl Firewall {
    pub fn new(vnids: Arc<VnidMap>, dns: Arc<EgressDns>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            vnids,
            dns,
            namespaces: Default::default(),
            changes,
        }
    }

    /// Records a namespace's policy. A policy with no rules is removed.
    #[instrument(skip(self, rules), fields(rules = rules.len()))]
    pub fn apply_policy(&self, namespace: &str, uid: &str, rules: Vec<EgressRule>) {
        if rules.is_empty() {
            self.delete_policy(namespace, uid);
            return;
        }

        if self.vnids.is_global(namespace) {
            error!("Egress policies are not enforced in global namespaces");
        }

        let mut namespaces = self.namespaces.write();
        let nsf = namespaces.entry(namespace.to_string()).or_default();
        if nsf.policies.get(uid) == Some(&rules) {
            debug!("Policy unchanged");
            return;
        }
        nsf.policies.insert(uid.to_string(), rules);
        match nsf.policies.len() {
            1 => info!("Updated egress policy"),
            n => error!(
                policies = n,
                "Multiple egress policies in namespace; blocking all external egress"
            ),
        }
        drop(namespaces);

        self.notify();
    }

    #[instrument(skip(self))]
    pub fn delete_policy(&self, namespace: &str, uid: &str) {
        let mut namespaces = self.namespaces.write();
        let Some(nsf) = namespaces.get_mut(namespace) else {
            return;
        };
        if nsf.policies.remove(uid).is_none() {
            return;
        }
        match nsf.policies.len() {
            0 => {
                namespaces.remove(namespace);
                info!("Removed egress policy");
            }
            1 => info!("Removed egress policy; namespace no longer conflicted"),
            n => warn!(policies = n, "Removed egress policy; namespace still conflicted"),
        }
        drop(namespaces);

        self.notify();
    }

    /// Returns true if pods in `namespace` may not reach `addr`.
    ///
    /// Rules are evaluated in order and the first that contains the address decides. An address
    /// that matches no rule is allowed.
    pub fn blocks(&self, namespace: &str, addr: IpAddr) -> bool {
        if self.vnids.is_global(namespace) {
            return false;
        }

        let namespaces = self.namespaces.read();
        let (uid, rules) = match namespaces.get(namespace).map(NamespaceFirewall::state) {
            None | Some(State::NoPolicy) => return false,
            Some(State::Conflicted) => return true,
            Some(State::SinglePolicy { uid, rules }) => (uid, rules),
        };

        for rule in rules {
            let matched = match rule.target {
                RuleTarget::Cidr(net) => net.contains(&addr),
                RuleTarget::DnsName(ref name) => self
                    .dns
                    .cidrs(uid, name)
                    .iter()
                    .any(|net| net.contains(&addr)),
            };
            if matched {
                return rule.action == RuleAction::Deny;
            }
        }
        false
    }

    /// Returns true if no namespace has a policy.
    pub fn is_empty(&self) -> bool {
        self.namespaces.read().is_empty()
    }

    /// Watches for changes that may alter the outcome of [`Firewall::blocks`].
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Signals subscribers that the outcome of [`Firewall::blocks`] may have changed.
    pub fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().len()
    }

    pub fn conflicted_count(&self) -> usize {
        self.namespaces
            .read()
            .values()
            .filter(|nsf| nsf.state() == State::Conflicted)
            .count()
    }
}

impl std::fmt::Debug for Firewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firewall")
            .field("namespaces", &*self.namespaces.read())
            .finish_non_exhaustive()
    }
}

// === impl NamespaceFirewall ===

impl NamespaceFirewall {
    fn state(&self) -> State<'_> {
        let mut policies = self.policies.iter();
        match (policies.next(), policies.next()) {
            (None, _) => State::NoPolicy,
            (Some((uid, rules)), None) => State::SinglePolicy { uid, rules },
            (Some(_), Some(_)) => State::Conflicted,
        }
    }
}
