use crate::context::{SpfContext, SpfResult};
use crate::error::SpfError;
use crate::macro_expand::{ExpansionMode, MacroExpander};
use std::fmt;
use std::sync::Arc;

/// What the evaluator should do after a checker returns normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckFlow {
    /// Keep consulting the next checker
    Continue,
    /// A mechanism matched and set the result; first match wins
    Matched,
}

/// Outcome of a single checker invocation
pub type CheckResult = Result<CheckFlow, SpfError>;

/// A unit of policy evaluation: mechanism, modifier or injected checker.
///
/// Checkers are shared between evaluations and must not keep per-request
/// state; everything mutable lives in the [`SpfContext`] they are handed.
pub trait Checker: fmt::Display + Send + Sync {
    fn check(&self, ctx: &mut SpfContext) -> CheckResult;
}

/// Expand `template` into the context's explanation when the evaluation has
/// failed and nothing has explained it yet.
///
/// A Fail seen inside a nested `include`/`redirect` evaluation is not final,
/// so nothing is written while the context is nested. Expansion errors are
/// logged and leave the explanation empty without touching the result.
pub fn explain_failure(expander: &MacroExpander, template: &str, ctx: &mut SpfContext) {
    if ctx.current_result() != Some(SpfResult::Fail) || ctx.has_explanation() {
        return;
    }
    if ctx.is_nested() {
        log::debug!("Deferring explanation for nested domain {}", ctx.current_domain());
        return;
    }

    match expander.expand(template, ctx, ExpansionMode::Explanation) {
        Ok(explanation) => {
            ctx.set_explanation(explanation);
        }
        Err(SpfError::PermError(e)) => {
            log::debug!("Invalid explanation template '{template}': {e}");
        }
        Err(e) => {
            log::warn!("Explanation for {} unavailable: {e}", ctx.current_domain());
        }
    }
}

/// Parsed policy for one domain
#[derive(Clone, Default)]
pub struct SpfRecord {
    pub mechanisms: Vec<Arc<dyn Checker>>,
    pub modifiers: Vec<Arc<dyn Checker>>,
}

impl SpfRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mechanism(mut self, checker: impl Checker + 'static) -> Self {
        self.mechanisms.push(Arc::new(checker));
        self
    }

    pub fn with_modifier(mut self, checker: impl Checker + 'static) -> Self {
        self.modifiers.push(Arc::new(checker));
        self
    }

    /// Append a modifier; callers are responsible for not registering twice
    pub fn add_modifier(&mut self, checker: Arc<dyn Checker>) {
        self.modifiers.push(checker);
    }
}

impl fmt::Debug for SpfRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpfRecord({self})")
    }
}

impl fmt::Display for SpfRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .mechanisms
            .iter()
            .chain(self.modifiers.iter())
            .map(|checker| checker.to_string())
            .collect();
        write!(f, "v=spf1")?;
        for term in terms {
            write!(f, " {term}")?;
        }
        Ok(())
    }
}
