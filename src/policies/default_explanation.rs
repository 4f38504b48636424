use super::PolicyStage;
use crate::checker::{explain_failure, CheckFlow, CheckResult, Checker, SpfRecord};
use crate::context::SpfContext;
use crate::error::SpfError;
use crate::macro_expand::MacroExpander;
use std::fmt;
use std::sync::Arc;

/// Explanation used when neither the domain nor the configuration gives one
pub const DEFAULT_EXPLANATION: &str =
    "See http://www.open-spf.org/Why?s=mfrom;id=%{S};ip=%{C};r=%{R}";

/// Fills in an explanation for failed evaluations that have none.
///
/// Holds only configuration; the result and explanation are read from the
/// context at invocation time, since the record may be consulted while the
/// result is still being decided.
#[derive(Debug, Clone)]
pub struct DefaultExplanationChecker {
    template: Option<String>,
    expander: MacroExpander,
}

impl DefaultExplanationChecker {
    pub fn new(template: Option<String>, expander: MacroExpander) -> Self {
        Self { template, expander }
    }

    pub fn template(&self) -> &str {
        self.template.as_deref().unwrap_or(DEFAULT_EXPLANATION)
    }
}

impl fmt::Display for DefaultExplanationChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.template {
            Some(template) => write!(f, "default-explanation=\"{template}\""),
            None => f.write_str("default-explanation"),
        }
    }
}

impl Checker for DefaultExplanationChecker {
    fn check(&self, ctx: &mut SpfContext) -> CheckResult {
        explain_failure(&self.expander, self.template(), ctx);
        Ok(CheckFlow::Continue)
    }
}

/// Post-filter stage appending a [`DefaultExplanationChecker`] to every record
pub struct DefaultExplanationStage {
    checker: Arc<DefaultExplanationChecker>,
}

impl DefaultExplanationStage {
    pub fn new(template: Option<String>, expander: MacroExpander) -> Self {
        Self {
            checker: Arc::new(DefaultExplanationChecker::new(template, expander)),
        }
    }
}

impl PolicyStage for DefaultExplanationStage {
    fn name(&self) -> &str {
        "default-explanation"
    }

    fn post_filter(&self, domain: &str, mut record: SpfRecord) -> Result<SpfRecord, SpfError> {
        log::debug!("Adding {} to record for {domain}", self.checker);
        record.add_modifier(self.checker.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpfResult;

    fn failed_context() -> SpfContext {
        let mut ctx = SpfContext::new("192.0.2.3".parse().unwrap(), "helo", "user@example.com")
            .with_receiving_domain("mx.example.net");
        ctx.set_current_result(SpfResult::Fail);
        ctx
    }

    #[test]
    fn test_configured_template() {
        let checker = DefaultExplanationChecker::new(
            Some("Mail from %{d} rejected".to_string()),
            MacroExpander::default(),
        );
        let mut ctx = failed_context();

        assert_eq!(checker.check(&mut ctx), Ok(CheckFlow::Continue));
        assert_eq!(ctx.explanation(), "Mail from example.com rejected");
    }

    #[test]
    fn test_built_in_template() {
        let checker = DefaultExplanationChecker::new(None, MacroExpander::default());
        let mut ctx = failed_context();

        checker.check(&mut ctx).unwrap();
        assert_eq!(
            ctx.explanation(),
            "See http://www.open-spf.org/Why?s=mfrom;id=user%40example.com;ip=192.0.2.3;r=mx.example.net"
        );
    }

    #[test]
    fn test_reads_result_at_invocation_time() {
        let checker = DefaultExplanationChecker::new(
            Some("rejected".to_string()),
            MacroExpander::default(),
        );
        let mut ctx = SpfContext::new("192.0.2.3".parse().unwrap(), "helo", "user@example.com");

        checker.check(&mut ctx).unwrap();
        assert_eq!(ctx.explanation(), "");

        ctx.set_current_result(SpfResult::Fail);
        checker.check(&mut ctx).unwrap();
        assert_eq!(ctx.explanation(), "rejected");
    }

    #[test]
    fn test_malformed_template_is_swallowed() {
        let checker =
            DefaultExplanationChecker::new(Some("%{".to_string()), MacroExpander::default());
        let mut ctx = failed_context();

        assert_eq!(checker.check(&mut ctx), Ok(CheckFlow::Continue));
        assert_eq!(ctx.explanation(), "");
        assert_eq!(ctx.current_result(), Some(SpfResult::Fail));
    }

    #[test]
    fn test_stage_appends_checker() {
        let stage = DefaultExplanationStage::new(None, MacroExpander::default());
        let record = stage.post_filter("example.com", SpfRecord::new()).unwrap();
        assert_eq!(record.modifiers.len(), 1);
        assert_eq!(record.to_string(), "v=spf1 default-explanation");
    }
}
