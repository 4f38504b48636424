use crate::checker::{CheckFlow, SpfRecord};
use crate::config::SpfConfig;
use crate::context::{SpfContext, SpfResult};
use crate::domain_utils::DomainUtils;
use crate::error::SpfError;
use crate::identity::{DnsIdentityResolver, IdentityResolver};
use crate::macro_expand::MacroExpander;
use crate::policies::{DefaultExplanationStage, DomainRewriteStage, PolicyChain, PolicyStage};
use crate::record_source::{RecordSource, StaticRecordSource};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;

/// Final answer reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// Domain whose policy was evaluated
    pub domain: String,
    /// Only present for `fail`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Evaluates MAIL FROM identities against the configured policy chain.
///
/// One evaluator can be shared across threads; each call owns its own
/// [`SpfContext`].
pub struct SpfEvaluator {
    chain: PolicyChain,
    receiving_domain: String,
}

pub struct SpfEvaluatorBuilder {
    source: Arc<dyn RecordSource>,
    stages: Vec<Arc<dyn PolicyStage>>,
    identity: Option<Arc<dyn IdentityResolver>>,
    default_explanation: Option<String>,
    explain_failures: bool,
    receiving_domain: String,
}

impl SpfEvaluatorBuilder {
    pub fn stage(mut self, stage: impl PolicyStage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn identity_resolver(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Template used when a failing record has no explanation of its own.
    /// `None` selects the built-in template.
    pub fn default_explanation(mut self, template: Option<String>) -> Self {
        self.default_explanation = template;
        self
    }

    /// Leave failures without an explanation unless the record provides one
    pub fn without_default_explanation(mut self) -> Self {
        self.explain_failures = false;
        self
    }

    pub fn receiving_domain(mut self, domain: impl Into<String>) -> Self {
        self.receiving_domain = domain.into();
        self
    }

    pub fn build(self) -> SpfEvaluator {
        let expander = MacroExpander::new(self.identity);
        let mut chain = PolicyChain::new(self.source);

        // Outermost stage, so its checker is appended after every other stage's
        if self.explain_failures {
            chain.push(Arc::new(DefaultExplanationStage::new(
                self.default_explanation,
                expander,
            )));
        }
        for stage in self.stages {
            chain.push(stage);
        }

        log::debug!("Policy chain: {:?}", chain.stage_names());
        SpfEvaluator {
            chain,
            receiving_domain: self.receiving_domain,
        }
    }
}

impl SpfEvaluator {
    pub fn builder(source: Arc<dyn RecordSource>) -> SpfEvaluatorBuilder {
        SpfEvaluatorBuilder {
            source,
            stages: Vec::new(),
            identity: None,
            default_explanation: None,
            explain_failures: true,
            receiving_domain: "unknown".to_string(),
        }
    }

    pub fn from_config(config: &SpfConfig) -> anyhow::Result<Self> {
        let identity: Option<Arc<dyn IdentityResolver>> = if config.dns.identity_lookup {
            Some(Arc::new(DnsIdentityResolver::new(config.dns.timeout_seconds)?))
        } else {
            None
        };

        let expander = MacroExpander::new(identity.clone());
        let source = StaticRecordSource::from_config(&config.records, &expander)?;

        let mut builder = Self::builder(Arc::new(source))
            .default_explanation(config.default_explanation.clone())
            .receiving_domain(config.receiving_domain.clone());
        if let Some(identity) = identity {
            builder = builder.identity_resolver(identity);
        }
        if !config.rewrites.is_empty() {
            builder = builder.stage(DomainRewriteStage::new(&config.rewrites));
        }

        Ok(builder.build())
    }

    pub fn chain(&self) -> &PolicyChain {
        &self.chain
    }

    pub fn evaluate(&self, ip: IpAddr, helo_domain: &str, sender: &str) -> SpfOutcome {
        let mut ctx = SpfContext::new(ip, helo_domain, sender)
            .with_receiving_domain(self.receiving_domain.clone());
        self.evaluate_context(&mut ctx)
    }

    /// Evaluate a prepared context, leaving the final state in it
    pub fn evaluate_context(&self, ctx: &mut SpfContext) -> SpfOutcome {
        let domain = ctx.current_domain().to_string();

        let result = match self.check_domain(ctx) {
            Ok(result) => result,
            Err(e) => {
                log::debug!("Evaluation of {domain} stopped: {e}");
                e.result()
            }
        };
        ctx.set_current_result(result);

        log::info!(
            "SPF {} for {} from {} (domain {})",
            result,
            ctx.sender(),
            ctx.ip(),
            domain
        );

        let explanation = (result == SpfResult::Fail && ctx.has_explanation())
            .then(|| ctx.explanation().to_string());

        SpfOutcome {
            result,
            domain,
            explanation,
        }
    }

    fn check_domain(&self, ctx: &mut SpfContext) -> Result<SpfResult, SpfError> {
        let domain = ctx.current_domain().to_string();
        if domain.is_empty() || domain.split('.').any(str::is_empty) {
            log::debug!("Not a usable domain: '{domain}'");
            return Err(SpfError::None);
        }

        let record = self.chain.resolve(&domain)?;
        execute_record(&record, ctx)
    }
}

/// Run the mechanisms in order until one matches, then every modifier.
///
/// Without a match the result is `neutral`. A signal from any checker stops
/// the record immediately.
pub fn execute_record(record: &SpfRecord, ctx: &mut SpfContext) -> Result<SpfResult, SpfError> {
    let mut matched = false;
    for mechanism in &record.mechanisms {
        if mechanism.check(ctx)? == CheckFlow::Matched {
            log::debug!("Mechanism {mechanism} matched for {}", ctx.current_domain());
            matched = true;
            break;
        }
    }

    let result = match ctx.current_result() {
        Some(result) if matched => result,
        _ => SpfResult::Neutral,
    };
    ctx.set_current_result(result);

    for modifier in &record.modifiers {
        modifier.check(ctx)?;
    }

    Ok(ctx.current_result().unwrap_or(SpfResult::Neutral))
}

/// Evaluate the record of an `include`/`redirect` target inside the current
/// evaluation.
///
/// `%{d}` follows `domain` while the record runs and the outer domain is
/// restored afterwards, also on error. Failures seen here are not final, so
/// no explanation is recorded for them.
pub fn execute_nested(
    record: &SpfRecord,
    ctx: &mut SpfContext,
    domain: &str,
) -> Result<SpfResult, SpfError> {
    let outer_domain = ctx.current_domain().to_string();
    ctx.set_current_domain(DomainUtils::normalize(domain));
    ctx.enter_nested();

    let result = execute_record(record, ctx);

    ctx.exit_nested();
    ctx.set_current_domain(outer_domain);
    log::debug!("Nested evaluation of {domain}: {result:?}");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckResult, Checker};
    use crate::mechanisms::build_record;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Raise(SpfError);

    impl fmt::Display for Raise {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "raise:{}", self.0)
        }
    }

    impl Checker for Raise {
        fn check(&self, _ctx: &mut SpfContext) -> CheckResult {
            Err(self.0.clone())
        }
    }

    /// Matches when the target domain's record passes
    struct Include {
        chain: PolicyChain,
        domain: String,
    }

    impl fmt::Display for Include {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "include:{}", self.domain)
        }
    }

    impl Checker for Include {
        fn check(&self, ctx: &mut SpfContext) -> CheckResult {
            let record = self.chain.resolve(&self.domain)?;
            match execute_nested(&record, ctx, &self.domain)? {
                SpfResult::Pass => {
                    ctx.set_current_result(SpfResult::Pass);
                    Ok(CheckFlow::Matched)
                }
                _ => Ok(CheckFlow::Continue),
            }
        }
    }

    /// Records the `%{d}` value seen while it runs
    #[derive(Clone, Default)]
    struct SeenDomains(Arc<std::sync::Mutex<Vec<String>>>);

    impl fmt::Display for SeenDomains {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("seen-domains")
        }
    }

    impl Checker for SeenDomains {
        fn check(&self, ctx: &mut SpfContext) -> CheckResult {
            let domain = expand_domain("%{d}", ctx);
            self.0.lock().unwrap().push(domain);
            Ok(CheckFlow::Continue)
        }
    }

    fn expand_domain(template: &str, ctx: &SpfContext) -> String {
        crate::macro_expand::expand(template, ctx, crate::ExpansionMode::Macro).unwrap()
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl fmt::Display for Counter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("counter")
        }
    }

    impl Checker for Counter {
        fn check(&self, _ctx: &mut SpfContext) -> CheckResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CheckFlow::Continue)
        }
    }

    fn record(terms: &[&str], explanation: Option<&str>) -> SpfRecord {
        let terms: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
        build_record(&terms, explanation, &MacroExpander::default()).unwrap()
    }

    fn source_with(domain: &str, record: SpfRecord) -> Arc<dyn RecordSource> {
        Arc::new(StaticRecordSource::new().with_record(domain, record))
    }

    fn evaluator(record: SpfRecord, default_explanation: Option<&str>) -> SpfEvaluator {
        SpfEvaluator::builder(source_with("example.com", record))
            .default_explanation(default_explanation.map(str::to_string))
            .receiving_domain("mx.example.net")
            .build()
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_pass_has_no_explanation() {
        let evaluator = evaluator(
            record(&["ip4:192.0.2.0/24", "-all"], None),
            Some("Mail from %{d} rejected"),
        );
        let outcome = evaluator.evaluate(ip("192.0.2.7"), "mx.example.com", "joe@example.com");

        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.domain, "example.com");
        assert_eq!(outcome.explanation, None);
    }

    #[test]
    fn test_fail_gets_default_explanation() {
        let evaluator = evaluator(
            record(&["ip4:192.0.2.0/24", "-all"], None),
            Some("Mail from %{d} rejected"),
        );
        let outcome = evaluator.evaluate(ip("203.0.113.5"), "mx.example.com", "joe@example.com");

        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(
            outcome.explanation.as_deref(),
            Some("Mail from example.com rejected")
        );
    }

    #[test]
    fn test_fail_uses_built_in_explanation() {
        let evaluator = evaluator(record(&["-all"], None), None);
        let outcome = evaluator.evaluate(ip("203.0.113.5"), "mx.example.com", "joe@example.com");

        assert_eq!(
            outcome.explanation.as_deref(),
            Some("See http://www.open-spf.org/Why?s=mfrom;id=joe%40example.com;ip=203.0.113.5;r=mx.example.net")
        );
    }

    #[test]
    fn test_record_explanation_wins_over_default() {
        let evaluator = evaluator(
            record(&["-all"], Some("%{i} may not send for %{d}")),
            Some("Mail from %{d} rejected"),
        );
        let outcome = evaluator.evaluate(ip("203.0.113.5"), "mx.example.com", "joe@example.com");

        assert_eq!(
            outcome.explanation.as_deref(),
            Some("203.0.113.5 may not send for example.com")
        );
    }

    #[test]
    fn test_malformed_default_explanation_keeps_fail() {
        let evaluator = evaluator(record(&["-all"], None), Some("%{"));
        let outcome = evaluator.evaluate(ip("203.0.113.5"), "mx.example.com", "joe@example.com");

        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.explanation, None);
    }

    #[test]
    fn test_non_fail_results_never_explain() {
        for (terms, expected) in [
            (vec!["~all"], SpfResult::SoftFail),
            (vec!["?all"], SpfResult::Neutral),
            (vec!["+all"], SpfResult::Pass),
            (vec!["ip4:192.0.2.0/24"], SpfResult::Neutral),
        ] {
            let evaluator = evaluator(record(&terms, None), Some("Mail from %{d} rejected"));
            let mut ctx = SpfContext::new(ip("203.0.113.5"), "helo", "joe@example.com");
            let outcome = evaluator.evaluate_context(&mut ctx);

            assert_eq!(outcome.result, expected, "{terms:?}");
            assert_eq!(outcome.explanation, None);
            assert_eq!(ctx.explanation(), "");
        }

        let evaluator = evaluator(record(&["-all"], None), Some("rejected"));
        let outcome = evaluator.evaluate(ip("192.0.2.1"), "helo", "joe@unknown.example");
        assert_eq!(outcome.result, SpfResult::None);
        assert_eq!(outcome.explanation, None);
    }

    #[test]
    fn test_without_default_explanation() {
        let evaluator = SpfEvaluator::builder(source_with("example.com", record(&["-all"], None)))
            .without_default_explanation()
            .build();
        let outcome = evaluator.evaluate(ip("203.0.113.5"), "helo", "joe@example.com");

        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.explanation, None);
        assert!(evaluator.chain().stage_names().is_empty());
    }

    #[test]
    fn test_first_match_wins() {
        let counter = Counter::default();
        let mut record = record(&["ip4:192.0.2.0/24"], None);
        record.mechanisms.push(Arc::new(counter.clone()));
        record.mechanisms.push(Arc::new(crate::mechanisms::AllMechanism {
            qualifier: crate::mechanisms::Qualifier::Fail,
        }));

        let evaluator = evaluator(record, None);
        assert_eq!(
            evaluator.evaluate(ip("192.0.2.9"), "helo", "joe@example.com").result,
            SpfResult::Pass
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        assert_eq!(
            evaluator.evaluate(ip("198.51.100.9"), "helo", "joe@example.com").result,
            SpfResult::Fail
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signals_short_circuit_the_record() {
        for (signal, expected) in [
            (SpfError::None, SpfResult::None),
            (SpfError::Neutral, SpfResult::Neutral),
            (SpfError::perm("bad include"), SpfResult::PermError),
            (SpfError::temp("dns timeout"), SpfResult::TempError),
        ] {
            let counter = Counter::default();
            let mut record = SpfRecord::new().with_mechanism(Raise(signal));
            record.mechanisms.push(Arc::new(counter.clone()));
            record.modifiers.push(Arc::new(counter.clone()));

            let evaluator = evaluator(record, Some("rejected"));
            let outcome = evaluator.evaluate(ip("192.0.2.9"), "helo", "joe@example.com");

            assert_eq!(outcome.result, expected);
            assert_eq!(outcome.explanation, None);
            assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_modifiers_run_after_match() {
        let counter = Counter::default();
        let record = record(&["-all"], None).with_modifier(counter.clone());

        let evaluator = evaluator(record, Some("rejected"));
        let outcome = evaluator.evaluate(ip("192.0.2.9"), "helo", "joe@example.com");

        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.explanation.as_deref(), Some("rejected"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    fn include_evaluator(seen: &SeenDomains) -> SpfEvaluator {
        let template = Some("Mail from %{d} rejected".to_string());
        let included = SpfEvaluator::builder(source_with(
            "inc.example",
            record(&["ip4:198.51.100.0/24", "-all"], None).with_modifier(seen.clone()),
        ))
        .default_explanation(template.clone())
        .build();

        let outer = SpfRecord::new()
            .with_mechanism(Include {
                chain: included.chain().clone(),
                domain: "inc.example".to_string(),
            })
            .with_mechanism(crate::mechanisms::AllMechanism {
                qualifier: crate::mechanisms::Qualifier::Fail,
            })
            .with_modifier(seen.clone());

        SpfEvaluator::builder(source_with("example.com", outer))
            .default_explanation(template)
            .build()
    }

    #[test]
    fn test_include_failure_is_explained_by_outer_domain() {
        let seen = SeenDomains::default();
        let evaluator = include_evaluator(&seen);

        let mut ctx = SpfContext::new(ip("203.0.113.5"), "helo", "joe@example.com");
        let outcome = evaluator.evaluate_context(&mut ctx);

        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.domain, "example.com");
        assert_eq!(
            outcome.explanation.as_deref(),
            Some("Mail from example.com rejected")
        );
        assert_eq!(ctx.current_domain(), "example.com");
        assert_eq!(ctx.current_result(), Some(SpfResult::Fail));
        assert!(!ctx.is_nested());
        assert_eq!(
            *seen.0.lock().unwrap(),
            vec!["inc.example".to_string(), "example.com".to_string()]
        );
    }

    #[test]
    fn test_include_pass_matches_outer_record() {
        let seen = SeenDomains::default();
        let evaluator = include_evaluator(&seen);

        let outcome = evaluator.evaluate(ip("198.51.100.7"), "helo", "joe@example.com");
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.explanation, None);
    }

    #[test]
    fn test_nested_error_restores_outer_domain() {
        let mut ctx = SpfContext::new(ip("192.0.2.1"), "helo", "joe@example.com");
        let record = SpfRecord::new().with_mechanism(Raise(SpfError::temp("dns timeout")));

        let result = execute_nested(&record, &mut ctx, "Inc.Example.");
        assert_eq!(result, Err(SpfError::temp("dns timeout")));
        assert_eq!(ctx.current_domain(), "example.com");
        assert!(!ctx.is_nested());
    }

    #[test]
    fn test_rewrite_stage_substitutes_source() {
        let mut rewrites = std::collections::HashMap::new();
        rewrites.insert("partner.example".to_string(), "partner.local".to_string());

        let evaluator = SpfEvaluator::builder(source_with(
            "partner.local",
            record(&["ip4:198.51.100.0/24", "-all"], None),
        ))
        .stage(DomainRewriteStage::new(&rewrites))
        .default_explanation(Some("%{d} does not permit %{i}".to_string()))
        .build();

        let outcome = evaluator.evaluate(ip("203.0.113.1"), "helo", "joe@partner.example");
        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.domain, "partner.example");
        assert_eq!(
            outcome.explanation.as_deref(),
            Some("partner.example does not permit 203.0.113.1")
        );
    }

    #[test]
    fn test_unusable_domain_is_none() {
        let evaluator = evaluator(record(&["-all"], None), None);
        assert_eq!(
            evaluator.evaluate(ip("192.0.2.9"), "", "").result,
            SpfResult::None
        );
        assert_eq!(
            evaluator.evaluate(ip("192.0.2.9"), "helo", "joe@example..com").result,
            SpfResult::None
        );
    }

    #[test]
    fn test_from_config() {
        let evaluator = SpfEvaluator::from_config(&SpfConfig::default()).unwrap();

        let outcome = evaluator.evaluate(ip("2001:db8::25"), "mx.example.com", "joe@example.com");
        assert_eq!(outcome.result, SpfResult::Pass);

        let outcome = evaluator.evaluate(ip("203.0.113.5"), "mx.example.com", "joe@example.com");
        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(
            outcome.explanation.as_deref(),
            Some("203.0.113.5 is not one of example.com's designated mail servers")
        );
    }

    #[test]
    fn test_concurrent_evaluations_do_not_share_state() {
        let evaluator = evaluator(
            record(&["ip4:192.0.2.0/24", "-all"], None),
            Some("%{i} rejected for %{l}"),
        );

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|n| {
                    let evaluator = &evaluator;
                    scope.spawn(move || {
                        let client = if n % 2 == 0 {
                            format!("192.0.2.{n}")
                        } else {
                            format!("203.0.113.{n}")
                        };
                        let sender = format!("user{n}@example.com");
                        (n, client.clone(), evaluator.evaluate(ip(&client), "helo", &sender))
                    })
                })
                .collect();

            for handle in handles {
                let (n, client, outcome) = handle.join().unwrap();
                if n % 2 == 0 {
                    assert_eq!(outcome.result, SpfResult::Pass);
                    assert_eq!(outcome.explanation, None);
                } else {
                    assert_eq!(outcome.result, SpfResult::Fail);
                    assert_eq!(
                        outcome.explanation,
                        Some(format!("{client} rejected for user{n}"))
                    );
                }
            }
        });
    }

    #[test]
    fn test_outcome_json() {
        let outcome = SpfOutcome {
            result: SpfResult::SoftFail,
            domain: "example.com".to_string(),
            explanation: None,
        };
        assert_eq!(
            serde_json::to_string(&outcome).unwrap(),
            r#"{"result":"softfail","domain":"example.com"}"#
        );
    }
}
