//! Policy chain: ordered stages that may rewrite which domain is consulted
//! before the record is resolved, and rewrite the record afterwards.
//!
//! The chain is a flat list driven by one loop. Pre-filters run in list
//! order; post-filters run in reverse, so the first stage behaves as the
//! outermost wrapper and sees the final record.

pub mod default_explanation;
pub mod domain_rewrite;

pub use default_explanation::{DefaultExplanationChecker, DefaultExplanationStage, DEFAULT_EXPLANATION};
pub use domain_rewrite::DomainRewriteStage;

use crate::checker::SpfRecord;
use crate::error::SpfError;
use crate::record_source::RecordSource;
use std::sync::Arc;

/// One stage of the policy chain.
///
/// Stages are shared by concurrent evaluations and may only hold immutable
/// configuration.
pub trait PolicyStage: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the record is resolved; returns the domain to consult
    fn pre_filter(&self, domain: &str) -> Result<String, SpfError> {
        Ok(domain.to_string())
    }

    /// Runs after the record for `domain` has been resolved
    fn post_filter(&self, _domain: &str, record: SpfRecord) -> Result<SpfRecord, SpfError> {
        Ok(record)
    }
}

/// Several stages acting as one, with the same ordering rules as the chain
pub struct StageGroup {
    name: String,
    stages: Vec<Arc<dyn PolicyStage>>,
}

impl StageGroup {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn PolicyStage>>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }
}

impl PolicyStage for StageGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_filter(&self, domain: &str) -> Result<String, SpfError> {
        apply_pre_filters(&self.stages, domain)
    }

    fn post_filter(&self, domain: &str, record: SpfRecord) -> Result<SpfRecord, SpfError> {
        apply_post_filters(&self.stages, domain, record)
    }
}

fn apply_pre_filters(stages: &[Arc<dyn PolicyStage>], domain: &str) -> Result<String, SpfError> {
    let mut target = domain.to_string();
    for stage in stages {
        let next = stage.pre_filter(&target)?;
        if next != target {
            log::debug!("Stage {} rewrote {} to {}", stage.name(), target, next);
        }
        target = next;
    }
    Ok(target)
}

fn apply_post_filters(
    stages: &[Arc<dyn PolicyStage>],
    domain: &str,
    mut record: SpfRecord,
) -> Result<SpfRecord, SpfError> {
    for stage in stages.iter().rev() {
        record = stage.post_filter(domain, record)?;
    }
    Ok(record)
}

/// Record retrieval wrapped by the configured stages
#[derive(Clone)]
pub struct PolicyChain {
    stages: Vec<Arc<dyn PolicyStage>>,
    source: Arc<dyn RecordSource>,
}

impl PolicyChain {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            stages: Vec::new(),
            source,
        }
    }

    pub fn with_stage(mut self, stage: impl PolicyStage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn push(&mut self, stage: Arc<dyn PolicyStage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Domain the record source will be asked for
    pub fn target_domain(&self, domain: &str) -> Result<String, SpfError> {
        apply_pre_filters(&self.stages, domain)
    }

    /// Resolve the record for `domain` through every stage.
    ///
    /// Post-filters receive the domain originally requested.
    pub fn resolve(&self, domain: &str) -> Result<SpfRecord, SpfError> {
        let target = self.target_domain(domain)?;
        let record = self.source.resolve(&target)?;
        log::debug!("Resolved record for {target}: {record}");
        apply_post_filters(&self.stages, domain, record)
    }
}
