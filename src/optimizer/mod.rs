//! Plan optimizer
//!
//! Local rewrite passes applied to each built plan

mod cost;
mod rules;

pub use cost::*;
pub use rules::*;

use crate::config::BuildOptions;
use crate::error::Result;
use crate::physical::PlanOperator;
use std::sync::Arc;
use tracing::debug;

/// Optimizer trait for plan transformations
pub trait OptimizerRule: Send + Sync {
    /// Name of this rule
    fn name(&self) -> &str;

    /// Apply this rule to the plan
    fn optimize(&self, plan: Arc<PlanOperator>) -> Result<Arc<PlanOperator>>;
}

/// Applies rules to physical plans
pub struct Optimizer {
    rules: Vec<Arc<dyn OptimizerRule>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(&BuildOptions::default())
    }
}

impl Optimizer {
    pub fn new(options: &BuildOptions) -> Self {
        let mut rules: Vec<Arc<dyn OptimizerRule>> = vec![];
        if options.enable_spool_insertion {
            rules.push(Arc::new(rules::CorrelatedSpoolInsertion::new(options)));
        }
        Self { rules }
    }

    /// Create optimizer with custom rules
    pub fn with_rules(rules: Vec<Arc<dyn OptimizerRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Optimize a physical plan
    pub fn optimize(&self, plan: Arc<PlanOperator>) -> Result<Arc<PlanOperator>> {
        let mut current = plan;
        for rule in &self.rules {
            let next = rule.optimize(current.clone())?;
            if next != current {
                debug!(rule = rule.name(), "plan rewritten");
            }
            current = next;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spool_rule_follows_options() {
        let enabled = Optimizer::new(&BuildOptions::default());
        assert_eq!(enabled.rule_names(), vec!["CorrelatedSpoolInsertion"]);
        let disabled = Optimizer::new(&BuildOptions::default().with_spool_insertion(false));
        assert!(disabled.rule_names().is_empty());
    }
}
