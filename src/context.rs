use crate::domain_utils::DomainUtils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Terminal SPF results (RFC 7208 §2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        };
        f.write_str(text)
    }
}

/// Per-request evaluation state.
///
/// Identity fields are fixed at construction. Only `current_domain`,
/// `current_result`, `explanation` and the nesting depth move while the
/// record is evaluated.
#[derive(Debug, Clone)]
pub struct SpfContext {
    sender_local_part: String,
    sender_domain: String,
    helo_domain: String,
    ip: IpAddr,
    receiving_domain: String,
    timestamp: u64,
    current_domain: String,
    current_result: Option<SpfResult>,
    explanation: String,
    nesting: usize,
}

impl SpfContext {
    /// Build a context for one MAIL FROM identity check.
    ///
    /// An empty sender is replaced by `postmaster@<helo>` and a sender
    /// without a local-part gets `postmaster`.
    pub fn new(ip: IpAddr, helo_domain: &str, sender: &str) -> Self {
        let helo_domain = helo_domain.trim().to_string();
        let (local_part, sender_domain) = DomainUtils::split_sender(sender, &helo_domain);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            sender_local_part: local_part,
            current_domain: DomainUtils::normalize(&sender_domain),
            sender_domain,
            helo_domain,
            ip,
            receiving_domain: "unknown".to_string(),
            timestamp,
            current_result: None,
            explanation: String::new(),
            nesting: 0,
        }
    }

    pub fn with_receiving_domain(mut self, receiving_domain: impl Into<String>) -> Self {
        self.receiving_domain = receiving_domain.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn sender_local_part(&self) -> &str {
        &self.sender_local_part
    }

    pub fn sender_domain(&self) -> &str {
        &self.sender_domain
    }

    pub fn sender(&self) -> String {
        format!("{}@{}", self.sender_local_part, self.sender_domain)
    }

    pub fn helo_domain(&self) -> &str {
        &self.helo_domain
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn receiving_domain(&self) -> &str {
        &self.receiving_domain
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn current_domain(&self) -> &str {
        &self.current_domain
    }

    /// Switch the domain under evaluation, for `include`/`redirect` recursion
    pub fn set_current_domain(&mut self, domain: impl Into<String>) {
        self.current_domain = domain.into();
    }

    /// True while an `include`/`redirect` target is being evaluated.
    /// Results seen in that state are not final.
    pub fn is_nested(&self) -> bool {
        self.nesting > 0
    }

    pub(crate) fn enter_nested(&mut self) {
        self.nesting += 1;
    }

    pub(crate) fn exit_nested(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    pub fn current_result(&self) -> Option<SpfResult> {
        self.current_result
    }

    pub fn set_current_result(&mut self, result: SpfResult) {
        self.current_result = Some(result);
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn has_explanation(&self) -> bool {
        !self.explanation.is_empty()
    }

    /// Record an explanation unless one is already present.
    /// Returns whether the explanation was stored.
    pub fn set_explanation(&mut self, explanation: impl Into<String>) -> bool {
        if self.has_explanation() {
            return false;
        }
        self.explanation = explanation.into();
        true
    }
}
