use crate::checker::SpfRecord;
use crate::config::RecordConfig;
use crate::domain_utils::DomainUtils;
use crate::error::SpfError;
use crate::macro_expand::MacroExpander;
use std::collections::HashMap;

/// Supplies the parsed policy for a domain.
///
/// Fails with [`SpfError::None`] when the domain publishes no policy, and
/// with `TempError`/`PermError` for lookup or syntax failures. Timeouts must
/// be reported as `TempError`.
pub trait RecordSource: Send + Sync {
    fn resolve(&self, domain: &str) -> Result<SpfRecord, SpfError>;
}

/// Records held in memory, keyed by normalized domain
#[derive(Debug, Default, Clone)]
pub struct StaticRecordSource {
    records: HashMap<String, SpfRecord>,
}

impl StaticRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: &str, record: SpfRecord) {
        self.records.insert(DomainUtils::normalize(domain), record);
    }

    pub fn with_record(mut self, domain: &str, record: SpfRecord) -> Self {
        self.insert(domain, record);
        self
    }

    /// Build records from configuration entries
    pub fn from_config(
        records: &HashMap<String, RecordConfig>,
        expander: &MacroExpander,
    ) -> Result<Self, SpfError> {
        let mut source = Self::new();
        for (domain, entry) in records {
            let record = crate::mechanisms::build_record(
                &entry.terms,
                entry.explanation.as_deref(),
                expander,
            )
            .map_err(|e| match e {
                SpfError::PermError(msg) => SpfError::perm(format!("record for {domain}: {msg}")),
                other => other,
            })?;
            log::debug!("Loaded record for {domain}: {record}");
            source.insert(domain, record);
        }
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for StaticRecordSource {
    fn resolve(&self, domain: &str) -> Result<SpfRecord, SpfError> {
        self.records
            .get(&DomainUtils::normalize(domain))
            .cloned()
            .ok_or(SpfError::None)
    }
}
