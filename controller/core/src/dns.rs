//! Resolution of the domain names referenced by egress policies.
//!
//! Each policy gets its own cache so that deleting or replacing a policy drops exactly the names
//! it introduced. Lookups are never performed while the cache table is locked.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use std::{
    collections::hash_map::Entry,
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Resolves domain names to addresses.
#[async_trait::async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>>;
}

/// The IPv4 addresses of a set of domain names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsCache {
    domains: HashMap<String, HashSet<Ipv4Addr>>,
}

/// Every lookup that failed during a single add or refresh.
#[derive(Debug, thiserror::Error)]
pub struct DnsErrors(Vec<DnsError>);

#[derive(Debug)]
pub struct DnsError {
    pub domain: String,
    pub error: anyhow::Error,
}

/// Per-policy DNS caches, keyed by policy UID.
pub struct EgressDns {
    resolver: Arc<dyn Resolve>,
    caches: Mutex<HashMap<String, Policy>>,
    generations: AtomicU64,
}

#[derive(Clone)]
struct Policy {
    generation: u64,
    cache: DnsCache,
}

// === impl DnsCache ===

impl DnsCache {
    /// Resolves and tracks `domains`.
    ///
    /// A domain that fails to resolve is still tracked, with no addresses, so that it is retried
    /// on the next refresh.
    pub async fn add<I, S>(&mut self, resolver: &dyn Resolve, domains: I) -> Result<(), DnsErrors>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut errors = Vec::new();
        for domain in domains {
            let domain = domain.into();
            if self.domains.contains_key(&domain) {
                continue;
            }
            let addrs = match lookup_v4(resolver, &domain).await {
                Ok(addrs) => addrs,
                Err(error) => {
                    errors.push(DnsError {
                        domain: domain.clone(),
                        error,
                    });
                    HashSet::new()
                }
            };
            self.domains.insert(domain, addrs);
        }
        DnsErrors::result(errors)
    }

    /// Re-resolves every tracked domain, returning whether any address set changed.
    ///
    /// A domain whose lookup fails keeps its previous addresses.
    pub async fn refresh(&mut self, resolver: &dyn Resolve) -> (bool, Result<(), DnsErrors>) {
        let mut changed = false;
        let mut errors = Vec::new();
        for (domain, addrs) in self.domains.iter_mut() {
            match lookup_v4(resolver, domain).await {
                Ok(new) => {
                    if new != *addrs {
                        debug!(%domain, old = addrs.len(), new = new.len(), "Addresses changed");
                        *addrs = new;
                        changed = true;
                    }
                }
                Err(error) => errors.push(DnsError {
                    domain: domain.clone(),
                    error,
                }),
            }
        }
        (changed, DnsErrors::result(errors))
    }

    pub fn get(&self, domain: &str) -> Option<&HashSet<Ipv4Addr>> {
        self.domains.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

async fn lookup_v4(resolver: &dyn Resolve, domain: &str) -> anyhow::Result<HashSet<Ipv4Addr>> {
    let addrs = resolver.lookup_ip(domain).await?;
    Ok(addrs
        .into_iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(addr) => {
                debug!(%domain, %addr, "Ignoring IPv6 address");
                None
            }
        })
        .collect())
}

// === impl DnsErrors ===

impl DnsErrors {
    fn result(errors: Vec<DnsError>) -> Result<(), Self> {
        if errors.is_empty() {
            return Ok(());
        }
        Err(Self(errors))
    }

    pub fn errors(&self) -> &[DnsError] {
        &self.0
    }
}

impl fmt::Display for DnsErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to resolve")?;
        for (i, DnsError { domain, error }) in self.0.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{sep}{domain}: {error}")?;
        }
        Ok(())
    }
}

// === impl EgressDns ===

impl EgressDns {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver,
            caches: Default::default(),
            generations: AtomicU64::new(0),
        }
    }

    /// Replaces the cache of the policy identified by `uid`, returning whether its addresses
    /// differ from the cache it replaced (or there was none).
    ///
    /// The cache is installed even if some lookups fail.
    pub async fn add_policy<I, S>(&self, uid: &str, domains: I) -> (bool, Result<(), DnsErrors>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cache = DnsCache::default();
        let res = cache.add(&*self.resolver, domains).await;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let changed = match self.caches.lock().entry(uid.to_string()) {
            Entry::Occupied(mut e) => {
                let changed = e.get().cache != cache;
                e.insert(Policy { generation, cache });
                changed
            }
            Entry::Vacant(e) => {
                e.insert(Policy { generation, cache });
                true
            }
        };
        (changed, res)
    }

    /// Returns true if the policy had a cache.
    pub fn delete_policy(&self, uid: &str) -> bool {
        self.caches.lock().remove(uid).is_some()
    }

    /// The host networks of `domain` as resolved for the policy `uid`, in address order.
    pub fn cidrs(&self, uid: &str, domain: &str) -> Vec<IpNet> {
        let caches = self.caches.lock();
        let mut addrs = caches
            .get(uid)
            .and_then(|e| e.cache.get(domain))
            .map(|addrs| addrs.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        addrs.sort_unstable();
        addrs
            .into_iter()
            .map(|addr| IpNet::V4(Ipv4Net::from(addr)))
            .collect()
    }

    /// Re-resolves every policy's domains and returns the UIDs of policies whose addresses
    /// changed.
    pub async fn refresh_all(&self) -> Vec<String> {
        let snapshot = self
            .caches
            .lock()
            .iter()
            .map(|(uid, e)| (uid.clone(), e.clone()))
            .collect::<Vec<_>>();

        let mut changed = Vec::new();
        for (uid, mut entry) in snapshot {
            let (updated, res) = entry.cache.refresh(&*self.resolver).await;
            if let Err(error) = res {
                warn!(%uid, %error, "DNS refresh failed");
            }
            if !updated {
                continue;
            }

            // The policy may have been deleted or replaced while its names were resolved.
            let mut caches = self.caches.lock();
            match caches.get_mut(&uid) {
                Some(current) if current.generation == entry.generation => {
                    current.cache = entry.cache;
                    changed.push(uid);
                }
                _ => debug!(%uid, "Policy changed during refresh"),
            }
        }
        changed.sort();
        changed
    }

    /// The number of domains tracked across all policies.
    pub fn domain_count(&self) -> usize {
        self.caches.lock().values().map(|e| e.cache.len()).sum()
    }
}

impl fmt::Debug for EgressDns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressDns")
            .field("policies", &self.caches.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeResolver(Mutex<HashMap<String, Option<Vec<IpAddr>>>>);

    impl FakeResolver {
        fn set(&self, name: &str, addrs: &[&str]) {
            let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
            self.0.lock().insert(name.to_string(), Some(addrs));
        }

        fn fail(&self, name: &str) {
            self.0.lock().insert(name.to_string(), None);
        }
    }

    #[async_trait::async_trait]
    impl Resolve for FakeResolver {
        async fn lookup_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
            match self.0.lock().get(name) {
                Some(Some(addrs)) => Ok(addrs.clone()),
                _ => anyhow::bail!("no such host"),
            }
        }
    }

    fn nets(addrs: &[&str]) -> Vec<IpNet> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn resolves_ipv4_only() {
        let resolver = FakeResolver::default();
        resolver.set("example.com", &["1.2.3.4", "2001:db8::1", "1.2.3.5"]);

        let mut cache = DnsCache::default();
        cache.add(&resolver, ["example.com"]).await.unwrap();
        let addrs = cache.get("example.com").unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[tokio::test]
    async fn failures_are_aggregated_and_retried() {
        let resolver = FakeResolver::default();
        resolver.set("good.example.com", &["1.1.1.1"]);
        resolver.fail("bad.example.com");
        resolver.fail("worse.example.com");

        let mut cache = DnsCache::default();
        let err = cache
            .add(
                &resolver,
                ["good.example.com", "bad.example.com", "worse.example.com"],
            )
            .await
            .unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(err.to_string().contains("bad.example.com"));
        assert_eq!(cache.get("good.example.com").unwrap().len(), 1);
        assert!(cache.get("bad.example.com").unwrap().is_empty());

        resolver.set("bad.example.com", &["2.2.2.2"]);
        let (changed, res) = cache.refresh(&resolver).await;
        assert!(changed);
        assert_eq!(res.unwrap_err().errors().len(), 1);
        assert!(cache
            .get("bad.example.com")
            .unwrap()
            .contains(&Ipv4Addr::new(2, 2, 2, 2)));
    }

    #[tokio::test]
    async fn refresh_detects_changes_regardless_of_order() {
        let resolver = FakeResolver::default();
        resolver.set("example.com", &["1.2.3.4", "1.2.3.5"]);
        let mut cache = DnsCache::default();
        cache.add(&resolver, ["example.com"]).await.unwrap();

        resolver.set("example.com", &["1.2.3.5", "1.2.3.4"]);
        let (changed, res) = cache.refresh(&resolver).await;
        assert!(!changed);
        res.unwrap();

        resolver.set("example.com", &["1.2.3.4"]);
        let (changed, _) = cache.refresh(&resolver).await;
        assert!(changed);

        // A failed lookup keeps the last known addresses.
        resolver.fail("example.com");
        let (changed, res) = cache.refresh(&resolver).await;
        assert!(!changed);
        assert!(res.is_err());
        assert_eq!(cache.get("example.com").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn policies_are_scoped_by_uid() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.set("example.com", &["1.2.3.5", "1.2.3.4"]);
        let dns = EgressDns::new(resolver.clone());

        let (changed, res) = dns.add_policy("uid-a", ["example.com"]).await;
        assert!(changed);
        res.unwrap();
        assert_eq!(
            dns.cidrs("uid-a", "example.com"),
            nets(&["1.2.3.4/32", "1.2.3.5/32"])
        );
        assert!(dns.cidrs("uid-b", "example.com").is_empty());
        assert_eq!(dns.domain_count(), 1);

        resolver.set("example.com", &["5.6.7.8"]);
        assert_eq!(dns.refresh_all().await, vec!["uid-a".to_string()]);
        assert_eq!(dns.cidrs("uid-a", "example.com"), nets(&["5.6.7.8/32"]));
        assert!(dns.refresh_all().await.is_empty());

        assert!(dns.delete_policy("uid-a"));
        assert!(!dns.delete_policy("uid-a"));
        assert!(dns.cidrs("uid-a", "example.com").is_empty());
        assert_eq!(dns.domain_count(), 0);
    }

    #[tokio::test]
    async fn readding_a_policy_reports_address_changes() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.set("example.com", &["1.2.3.4"]);
        let dns = EgressDns::new(resolver.clone());

        assert!(dns.add_policy("uid-a", ["example.com"]).await.0);
        let (changed, res) = dns.add_policy("uid-a", ["example.com"]).await;
        assert!(!changed);
        res.unwrap();

        resolver.set("example.com", &["1.2.3.5"]);
        assert!(dns.add_policy("uid-a", ["example.com"]).await.0);
        assert_eq!(dns.cidrs("uid-a", "example.com"), nets(&["1.2.3.5/32"]));
    }
}
