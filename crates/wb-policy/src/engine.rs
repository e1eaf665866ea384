//! Policy engine: ordered first-match evaluation with a decision trail

use serde::{Deserialize, Serialize};

use crate::configuration::PolicyConfiguration;
use crate::context::PolicyContext;

type Predicate = Box<dyn Fn(&PolicyContext<'_>) -> bool + Send + Sync>;
type Configure = Box<dyn Fn(&PolicyContext<'_>, &mut PolicyConfiguration) + Send + Sync>;

/// One registered policy: a named predicate plus the configuration delta
/// it applies when it wins.
pub struct Policy {
    name: String,
    predicate: Predicate,
    configure: Configure,
}

impl Policy {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One evaluation record; matched or not, every evaluated policy leaves one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub policy: String,
    pub matched: bool,
    pub reason: String,
}

/// The result of evaluating a message against the engine.
#[derive(Debug)]
pub struct PolicyOutcome {
    /// `None` means no policy matched: a misconfiguration the worker layer
    /// treats as fatal.
    pub configuration: Option<PolicyConfiguration>,
    pub trail: Vec<PolicyDecision>,
}

impl PolicyOutcome {
    pub fn winner(&self) -> Option<&str> {
        self.trail
            .iter()
            .find(|d| d.matched)
            .map(|d| d.policy.as_str())
    }
}

/// Evaluates policies in declaration order; first match wins. The engine
/// does not rank by specificity — registration order is the contract, and
/// a catch-all belongs last.
pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    pub fn builder() -> PolicyEngineBuilder {
        PolicyEngineBuilder {
            policies: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Evaluate `ctx` against the registered policies. Evaluation stops at
    /// the first match; policies after the winner are not evaluated and do
    /// not appear in the trail.
    pub fn evaluate(&self, ctx: &PolicyContext<'_>) -> PolicyOutcome {
        let mut trail = Vec::new();

        for policy in &self.policies {
            let matched = (policy.predicate)(ctx);
            trail.push(PolicyDecision {
                policy: policy.name.clone(),
                matched,
                reason: if matched {
                    "predicate matched".to_string()
                } else {
                    "predicate did not match".to_string()
                },
            });

            if matched {
                let mut configuration = PolicyConfiguration::default();
                (policy.configure)(ctx, &mut configuration);
                return PolicyOutcome {
                    configuration: Some(configuration),
                    trail,
                };
            }
        }

        PolicyOutcome {
            configuration: None,
            trail,
        }
    }
}

/// Declaration-order policy registration.
pub struct PolicyEngineBuilder {
    policies: Vec<Policy>,
}

impl PolicyEngineBuilder {
    /// Register a policy. Order matters: specific before general.
    pub fn policy<P, C>(mut self, name: &str, predicate: P, configure: C) -> Self
    where
        P: Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static,
        C: Fn(&PolicyContext<'_>, &mut PolicyConfiguration) + Send + Sync + 'static,
    {
        self.policies.push(Policy {
            name: name.to_string(),
            predicate: Box::new(predicate),
            configure: Box::new(configure),
        });
        self
    }

    /// Register the catch-all. Always register one, last, to prevent
    /// "no policy matched" failures.
    pub fn default_policy<C>(self, name: &str, configure: C) -> Self
    where
        C: Fn(&PolicyContext<'_>, &mut PolicyConfiguration) + Send + Sync + 'static,
    {
        self.policy(name, |_| true, configure)
    }

    pub fn build(self) -> PolicyEngine {
        PolicyEngine {
            policies: self.policies,
        }
    }
}
