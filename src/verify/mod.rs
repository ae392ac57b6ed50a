//! Semantic verifier
//!
//! Runs over a fully derived netlist. Each rule group is an independent
//! [`Rule`] object returning every violation it finds; the [`Verifier`]
//! runs the groups in a fixed order and reports the first violation as a
//! fatal legality error.

mod broadcast;
mod cross_graph;
mod format;
mod lifecycle;
mod program;
mod structural;

pub use broadcast::BroadcastRule;
pub use cross_graph::CrossGraphRule;
pub use format::FormatRule;
pub use lifecycle::BufferLifecycleRule;
pub use program::ProgramRule;
pub use structural::StructuralRule;

use log::{debug, info};

use crate::error::{CompileError, CompileResult};
use crate::ir::Netlist;

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: &'static str,
    pub message: String,
}

impl Violation {
    pub fn into_error(self) -> CompileError {
        CompileError::legality(self.rule, self.message)
    }
}

/// A group of legality checks over the derived IR
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every violation found, in a deterministic order
    fn check(&self, netlist: &Netlist) -> Vec<Violation>;
}

/// Violation accumulator shared by the rule implementations
pub(crate) struct Findings {
    rule: &'static str,
    violations: Vec<Violation>,
}

impl Findings {
    pub(crate) fn new(rule: &'static str) -> Self {
        Self {
            rule,
            violations: Vec::new(),
        }
    }

    /// Record `msg` unless `cond` holds; returns `cond`
    pub(crate) fn require(&mut self, cond: bool, msg: impl FnOnce() -> String) -> bool {
        if !cond {
            self.push(msg());
        }
        cond
    }

    pub(crate) fn push(&mut self, message: impl Into<String>) {
        self.violations.push(Violation {
            rule: self.rule,
            message: message.into(),
        });
    }

    pub(crate) fn extend(&mut self, violations: impl IntoIterator<Item = Violation>) {
        self.violations.extend(violations);
    }

    pub(crate) fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

pub struct Verifier {
    rules: Vec<Box<dyn Rule>>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    /// Every built-in rule group
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(StructuralRule),
            Box::new(FormatRule),
            Box::new(BufferLifecycleRule),
            Box::new(BroadcastRule),
            Box::new(CrossGraphRule),
            Box::new(ProgramRule),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|rule| rule.name())
    }

    /// Violations of every rule, in rule order
    pub fn check_all(&self, netlist: &Netlist) -> Vec<Violation> {
        self.rules
            .iter()
            .flat_map(|rule| {
                let violations = rule.check(netlist);
                debug!("Rule {}: {} violations", rule.name(), violations.len());
                violations
            })
            .collect()
    }

    /// Fails with the first violation; later rules do not run
    pub fn verify(&self, netlist: &Netlist) -> CompileResult<()> {
        for rule in &self.rules {
            if let Some(first) = rule.check(netlist).into_iter().next() {
                return Err(first.into_error());
            }
            debug!("Rule {} passed", rule.name());
        }
        info!("Verified netlist against {} rule groups", self.rules.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use pretty_assertions::assert_eq;

    struct AlwaysFails;

    impl Rule for AlwaysFails {
        fn name(&self) -> &'static str {
            "always_fails"
        }

        fn check(&self, _netlist: &Netlist) -> Vec<Violation> {
            let mut findings = Findings::new(self.name());
            findings.push("first");
            findings.require(false, || "second".to_string());
            findings.into_violations()
        }
    }

    #[test]
    fn test_default_rule_order() {
        let names: Vec<_> = Verifier::new().rule_names().collect();
        assert_eq!(
            names,
            vec!["structural", "format", "buffer_lifecycle", "broadcast", "cross_graph", "program"]
        );
    }

    #[test]
    fn test_first_violation_is_reported() {
        let netlist = testutil::compile(testutil::simple_pipeline("wormhole_b0")).unwrap();
        let verifier = Verifier::with_rules(vec![Box::new(AlwaysFails)]);
        assert_eq!(verifier.check_all(&netlist).len(), 2);
        let err = verifier.verify(&netlist).unwrap_err();
        assert_eq!(err.to_string(), "Legality error [always_fails]: first");
    }

    #[test]
    fn test_valid_pipeline_has_no_violations() {
        let netlist = testutil::compile(testutil::two_graph_pipeline("wormhole_b0", 0, 1)).unwrap();
        assert!(Verifier::new().check_all(&netlist).is_empty());
    }
}
