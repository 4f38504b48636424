//! Built-in checkers for statically configured policies.
//!
//! Only the address-literal mechanisms (`all`, `ip4`, `ip6`) are supported
//! here; they need no DNS and cover locally maintained policies. The inline
//! explanation modifier stands in for a fetched `exp=` TXT record.

use crate::checker::{explain_failure, CheckFlow, CheckResult, Checker, SpfRecord};
use crate::context::{SpfContext, SpfResult};
use crate::error::SpfError;
use crate::macro_expand::MacroExpander;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn from_prefix(c: char) -> Option<Self> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self {
            Qualifier::Pass => "",
            Qualifier::Fail => "-",
            Qualifier::SoftFail => "~",
            Qualifier::Neutral => "?",
        };
        f.write_str(prefix)
    }
}

/// `all`: always matches
#[derive(Debug, Clone)]
pub struct AllMechanism {
    pub qualifier: Qualifier,
}

impl fmt::Display for AllMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}all", self.qualifier)
    }
}

impl Checker for AllMechanism {
    fn check(&self, ctx: &mut SpfContext) -> CheckResult {
        ctx.set_current_result(self.qualifier.result());
        Ok(CheckFlow::Matched)
    }
}

/// `ip4` / `ip6`: matches when the client address is inside the network
#[derive(Debug, Clone)]
pub struct IpMechanism {
    pub qualifier: Qualifier,
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl IpMechanism {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.network.is_ipv4() { "ip4" } else { "ip6" };
        write!(
            f,
            "{}{}:{}/{}",
            self.qualifier, name, self.network, self.prefix_len
        )
    }
}

impl Checker for IpMechanism {
    fn check(&self, ctx: &mut SpfContext) -> CheckResult {
        if self.contains(ctx.ip()) {
            log::debug!("{} matched {}", self, ctx.ip());
            ctx.set_current_result(self.qualifier.result());
            Ok(CheckFlow::Matched)
        } else {
            Ok(CheckFlow::Continue)
        }
    }
}

/// Explanation text published by the domain itself
#[derive(Debug, Clone)]
pub struct ExplanationModifier {
    pub template: String,
    expander: MacroExpander,
}

impl ExplanationModifier {
    pub fn new(template: impl Into<String>, expander: MacroExpander) -> Self {
        Self {
            template: template.into(),
            expander,
        }
    }
}

impl fmt::Display for ExplanationModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exp-text=\"{}\"", self.template)
    }
}

impl Checker for ExplanationModifier {
    fn check(&self, ctx: &mut SpfContext) -> CheckResult {
        explain_failure(&self.expander, &self.template, ctx);
        Ok(CheckFlow::Continue)
    }
}

/// Build a record from mechanism terms such as `ip4:192.0.2.0/24` or `-all`
pub fn build_record(
    terms: &[String],
    explanation: Option<&str>,
    expander: &MacroExpander,
) -> Result<SpfRecord, SpfError> {
    let mut record = SpfRecord::new();

    for term in terms {
        let term = term.trim();
        if term.is_empty() || term.eq_ignore_ascii_case("v=spf1") {
            continue;
        }

        let (qualifier, body) = match term.chars().next().and_then(Qualifier::from_prefix) {
            Some(qualifier) => (qualifier, &term[1..]),
            None => (Qualifier::Pass, term),
        };
        let lower = body.to_ascii_lowercase();

        if lower == "all" {
            record = record.with_mechanism(AllMechanism { qualifier });
        } else if let Some(spec) = lower.strip_prefix("ip4:") {
            record = record.with_mechanism(parse_network(qualifier, spec, false)?);
        } else if let Some(spec) = lower.strip_prefix("ip6:") {
            record = record.with_mechanism(parse_network(qualifier, spec, true)?);
        } else {
            return Err(SpfError::perm(format!("unsupported term '{term}'")));
        }
    }

    if let Some(template) = explanation {
        record = record.with_modifier(ExplanationModifier::new(template, expander.clone()));
    }

    Ok(record)
}

fn parse_network(qualifier: Qualifier, spec: &str, ipv6: bool) -> Result<IpMechanism, SpfError> {
    let (addr, prefix) = match spec.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (spec, None),
    };

    let network: IpAddr = addr
        .parse()
        .map_err(|_| SpfError::perm(format!("invalid network address '{addr}'")))?;
    if network.is_ipv6() != ipv6 {
        return Err(SpfError::perm(format!("address family mismatch in '{spec}'")));
    }

    let max_len = if ipv6 { 128 } else { 32 };
    let prefix_len = match prefix {
        Some(prefix) => prefix
            .parse::<u8>()
            .ok()
            .filter(|len| *len <= max_len)
            .ok_or_else(|| SpfError::perm(format!("invalid prefix length in '{spec}'")))?,
        None => max_len,
    };

    Ok(IpMechanism {
        qualifier,
        network,
        prefix_len,
    })
}
