use super::PolicyStage;
use crate::domain_utils::DomainUtils;
use crate::error::SpfError;
use std::collections::HashMap;

/// Pre-filter stage consulting a substitute domain's policy, e.g. a locally
/// maintained record standing in for a partner domain.
#[derive(Debug, Clone, Default)]
pub struct DomainRewriteStage {
    rewrites: HashMap<String, String>,
}

impl DomainRewriteStage {
    pub fn new(rewrites: &HashMap<String, String>) -> Self {
        Self {
            rewrites: rewrites
                .iter()
                .map(|(from, to)| (DomainUtils::normalize(from), DomainUtils::normalize(to)))
                .collect(),
        }
    }
}

impl PolicyStage for DomainRewriteStage {
    fn name(&self) -> &str {
        "domain-rewrite"
    }

    fn pre_filter(&self, domain: &str) -> Result<String, SpfError> {
        Ok(self
            .rewrites
            .get(&DomainUtils::normalize(domain))
            .cloned()
            .unwrap_or_else(|| domain.to_string()))
    }
}
