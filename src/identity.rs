use crate::domain_utils::DomainUtils;
use crate::error::SpfError;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::Resolver;
use std::net::IpAddr;
use std::time::Duration;

/// Resolves the validated domain name of a connecting host (macro `p`).
pub trait IdentityResolver: Send + Sync {
    /// Return a validated name for `ip`, preferring `domain` or one of its
    /// subdomains. `Ok(None)` when no name could be validated.
    fn validated_name(&self, ip: IpAddr, domain: &str) -> Result<Option<String>, SpfError>;
}

/// Maximum number of PTR names checked, RFC 7208 §4.6.4
const MAX_PTR_NAMES: usize = 10;

/// Reverse lookup plus forward confirmation over the system resolver.
pub struct DnsIdentityResolver {
    resolver: Resolver,
}

impl DnsIdentityResolver {
    pub fn new(timeout_seconds: u64) -> anyhow::Result<Self> {
        let (config, mut opts) = match read_system_conf() {
            Ok(system) => system,
            Err(e) => {
                log::warn!("Failed to load system DNS config, using defaults: {e}");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = Duration::from_secs(timeout_seconds);
        opts.attempts = 1;

        let resolver = Resolver::new(config, opts)?;
        Ok(Self { resolver })
    }

    fn confirms(&self, name: &str, ip: IpAddr) -> Result<bool, SpfError> {
        match self.resolver.lookup_ip(name) {
            Ok(response) => Ok(response.iter().any(|addr| addr == ip)),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(SpfError::temp(format!("forward lookup of {name} failed: {e}"))),
            },
        }
    }
}

impl IdentityResolver for DnsIdentityResolver {
    fn validated_name(&self, ip: IpAddr, domain: &str) -> Result<Option<String>, SpfError> {
        let names: Vec<String> = match self.resolver.reverse_lookup(ip) {
            Ok(response) => ptr_candidates(response.iter().map(|name| name.to_string())),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    log::debug!("No PTR records for {ip}");
                    return Ok(None);
                }
                _ => return Err(SpfError::temp(format!("reverse lookup of {ip} failed: {e}"))),
            },
        };

        let mut validated = Vec::new();
        for name in names {
            if self.confirms(&name, ip)? {
                validated.push(name);
            }
        }

        let preferred = preferred_name(&validated, domain);
        log::debug!("Validated name for {ip}: {preferred:?}");
        Ok(preferred)
    }
}

/// Normalized PTR names worth confirming, capped at [`MAX_PTR_NAMES`]
fn ptr_candidates(names: impl IntoIterator<Item = String>) -> Vec<String> {
    names
        .into_iter()
        .take(MAX_PTR_NAMES)
        .map(|name| DomainUtils::normalize(&name))
        .collect()
}

/// First confirmed name within `domain`, otherwise the first confirmed name
fn preferred_name(validated: &[String], domain: &str) -> Option<String> {
    validated
        .iter()
        .find(|name| DomainUtils::is_subdomain_of(name, domain))
        .or_else(|| validated.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_ptr_candidates_are_capped_and_normalized() {
        let many: Vec<String> = (0..15).map(|n| format!("Host{n}.Example.com.")).collect();
        let candidates = ptr_candidates(many);

        assert_eq!(candidates.len(), MAX_PTR_NAMES);
        assert_eq!(candidates[0], "host0.example.com");
        assert_eq!(candidates[9], "host9.example.com");
        assert!(ptr_candidates(Vec::new()).is_empty());
    }

    #[test]
    fn test_preferred_name_favours_current_domain() {
        let validated = names(&["mx.other.net", "mail.example.com", "example.com"]);
        assert_eq!(
            preferred_name(&validated, "example.com").as_deref(),
            Some("mail.example.com")
        );
        assert_eq!(
            preferred_name(&validated, "Example.COM.").as_deref(),
            Some("mail.example.com")
        );
    }

    #[test]
    fn test_preferred_name_falls_back_to_first() {
        let validated = names(&["mx.other.net", "relay.notexample.com"]);
        assert_eq!(
            preferred_name(&validated, "example.com").as_deref(),
            Some("mx.other.net")
        );
        assert_eq!(preferred_name(&[], "example.com"), None);
    }
}
