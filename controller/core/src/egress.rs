use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Allow,
    Deny,
}

/// The destination selected by an egress rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleTarget {
    Cidr(IpNet),

    /// Resolved to a set of addresses that is refreshed periodically.
    DnsName(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EgressRule {
    pub action: RuleAction,
    pub target: RuleTarget,
}

/// A rule with its destination resolved to a network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub action: RuleAction,
    pub net: IpNet,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidRule {
    #[error("invalid CIDR {0:?}")]
    Cidr(String),

    #[error("invalid DNS name {0:?}")]
    DnsName(String),

    #[error("rule must select exactly one of a CIDR or a DNS name")]
    Selector,
}

// === impl EgressRule ===

impl EgressRule {
    pub fn parse(
        action: RuleAction,
        cidr_selector: Option<&str>,
        dns_name: Option<&str>,
    ) -> Result<Self, InvalidRule> {
        let target = match (cidr_selector, dns_name) {
            (Some(cidr), None) => RuleTarget::Cidr(parse_cidr(cidr)?),
            (None, Some(name)) => RuleTarget::DnsName(parse_dns_name(name)?),
            _ => return Err(InvalidRule::Selector),
        };
        Ok(Self { action, target })
    }

    pub fn dns_name(&self) -> Option<&str> {
        match self.target {
            RuleTarget::DnsName(ref name) => Some(name),
            RuleTarget::Cidr(_) => None,
        }
    }
}

// === impl FirewallRule ===

impl FirewallRule {
    #[inline]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }
}

fn parse_cidr(s: &str) -> Result<IpNet, InvalidRule> {
    // Host bits are masked off, matching how the forwarding plane interprets the selector.
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    Err(InvalidRule::Cidr(s.to_string()))
}

fn parse_dns_name(s: &str) -> Result<String, InvalidRule> {
    let name = s.trim_end_matches('.').to_ascii_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*')
        });
    if !valid {
        return Err(InvalidRule::DnsName(s.to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_selectors() {
        let rule = EgressRule::parse(RuleAction::Deny, Some("10.1.2.3/8"), None).unwrap();
        assert_eq!(
            rule.target,
            RuleTarget::Cidr("10.0.0.0/8".parse().unwrap())
        );

        let rule = EgressRule::parse(RuleAction::Allow, Some("192.168.1.1"), None).unwrap();
        assert_eq!(
            rule.target,
            RuleTarget::Cidr("192.168.1.1/32".parse().unwrap())
        );

        let rule = EgressRule::parse(RuleAction::Allow, None, Some("Example.COM.")).unwrap();
        assert_eq!(rule.dns_name(), Some("example.com"));
    }

    #[test]
    fn rejects_invalid_selectors() {
        assert!(matches!(
            EgressRule::parse(RuleAction::Deny, Some("10.0.0.0/33"), None),
            Err(InvalidRule::Cidr(_))
        ));
        assert!(matches!(
            EgressRule::parse(RuleAction::Deny, None, Some("bad..name")),
            Err(InvalidRule::DnsName(_))
        ));
        assert!(matches!(
            EgressRule::parse(RuleAction::Deny, None, None),
            Err(InvalidRule::Selector)
        ));
        assert!(matches!(
            EgressRule::parse(RuleAction::Deny, Some("0.0.0.0/0"), Some("example.com")),
            Err(InvalidRule::Selector)
        ));
    }
}
