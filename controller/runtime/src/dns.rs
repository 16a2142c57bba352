use crate::core::Resolve;
use anyhow::{Context, Result};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;

/// Resolves egress policy names with the host's resolver configuration.
#[derive(Clone)]
pub struct SystemResolver(TokioAsyncResolver);

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .context("failed to read system resolver configuration")?;
        Ok(Self(resolver))
    }
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SystemResolver").finish()
    }
}

#[async_trait::async_trait]
impl Resolve for SystemResolver {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
        // Policy names are fully qualified; search domains never apply.
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        let lookup = self.0.lookup_ip(fqdn.as_str()).await?;
        Ok(lookup.iter().collect())
    }
}
