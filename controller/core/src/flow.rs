//! Forwarding-plane rules that tunnel traffic for a remote host's subnet to that host.

use ahash::AHashMap as HashMap;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::{fmt, net::Ipv4Addr, sync::Arc};
use tracing::{debug, info, instrument};

/// Holds IP traffic destined to remote subnets.
pub const IP_TABLE: u8 = 6;

/// Holds ARP traffic destined to remote subnets.
pub const ARP_TABLE: u8 = 7;

const PRIORITY: u16 = 100;

/// Identifies every rule installed for a host: its IPv4 address as a 32-bit integer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cookie(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip,
    Arp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowRule {
    pub table: u8,
    pub protocol: Protocol,
    pub cookie: Cookie,
    pub subnet: Ipv4Net,
    pub host: Ipv4Addr,
}

/// Drives the switch's flow tables.
#[async_trait::async_trait]
pub trait OvsCtl: Send + Sync {
    async fn add_flow(&self, directive: &str) -> Result<(), FlowError>;

    async fn del_flows(&self, directive: &str) -> Result<(), FlowError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("ovs-ofctl {command} exited with {status}: {output}")]
    Command {
        command: String,
        status: String,
        output: String,
    },

    #[error("failed to run ovs-ofctl: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs and removes the rules for remote hosts.
pub struct FlowController {
    ovs: Arc<dyn OvsCtl>,
    local_ip: Ipv4Addr,
    installed: Mutex<HashMap<Ipv4Addr, Ipv4Net>>,
}

// === impl Cookie ===

impl From<Ipv4Addr> for Cookie {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

// === impl FlowRule ===

impl FlowRule {
    pub fn for_host(host: Ipv4Addr, subnet: Ipv4Net) -> [Self; 2] {
        let cookie = Cookie::from(host);
        [
            Self {
                table: IP_TABLE,
                protocol: Protocol::Ip,
                cookie,
                subnet,
                host,
            },
            Self {
                table: ARP_TABLE,
                protocol: Protocol::Arp,
                cookie,
                subnet,
                host,
            },
        ]
    }

    /// The `add-flow` directive that installs this rule.
    pub fn directive(&self) -> String {
        let proto = match self.protocol {
            Protocol::Ip => "ip",
            Protocol::Arp => "arp",
        };
        format!(
            "table={},cookie=0x{},priority={},{},nw_dst={},actions=move:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{}->tun_dst,output:1",
            self.table, self.cookie, PRIORITY, proto, self.subnet, self.host,
        )
    }
}

/// The `del-flows` directive that matches every rule in `table` with exactly this cookie.
pub fn delete_directive(table: u8, cookie: Cookie) -> String {
    format!("table={table},cookie=0x{cookie}/0xffffffff")
}

// === impl FlowController ===

impl FlowController {
    pub fn new(ovs: Arc<dyn OvsCtl>, local_ip: Ipv4Addr) -> Self {
        Self {
            ovs,
            local_ip,
            installed: Default::default(),
        }
    }

    /// Installs the rules that tunnel `subnet` to `host`. Reinstalling identical rules is
    /// harmless since the switch replaces flows with the same match.
    #[instrument(skip_all, fields(%host, %subnet))]
    pub async fn add_rules(&self, host: Ipv4Addr, subnet: Ipv4Net) -> Result<(), FlowError> {
        if host == self.local_ip {
            debug!("Skipping local host");
            return Ok(());
        }

        let previous = self.installed.lock().get(&host).copied();
        if let Some(old) = previous.filter(|old| *old != subnet) {
            info!(%old, "Host subnet changed");
            self.delete_flows(host).await?;
            self.installed.lock().remove(&host);
        }

        for rule in FlowRule::for_host(host, subnet) {
            self.ovs.add_flow(&rule.directive()).await?;
        }
        self.installed.lock().insert(host, subnet);
        debug!("Installed flows");
        Ok(())
    }

    /// Removes every rule installed for `host`, whether or not this controller installed it.
    #[instrument(skip_all, fields(%host))]
    pub async fn delete_rules(&self, host: Ipv4Addr) -> Result<(), FlowError> {
        if host == self.local_ip {
            debug!("Skipping local host");
            return Ok(());
        }

        self.delete_flows(host).await?;
        self.installed.lock().remove(&host);
        debug!("Deleted flows");
        Ok(())
    }

    /// The number of remote hosts with installed rules.
    pub fn host_count(&self) -> usize {
        self.installed.lock().len()
    }

    async fn delete_flows(&self, host: Ipv4Addr) -> Result<(), FlowError> {
        let cookie = Cookie::from(host);
        for table in [IP_TABLE, ARP_TABLE] {
            self.ovs
                .del_flows(&delete_directive(table, cookie))
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for FlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowController")
            .field("local_ip", &self.local_ip)
            .field("hosts", &self.host_count())
            .finish_non_exhaustive()
    }
}
