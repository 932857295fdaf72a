//! Deferred Gaussian-constraint declarations and their resolved penalty
//! terms.
//!
//! Constraints are declared from user configuration before any worker has
//! spoken, so they can only name parameters. Once the coordinator has
//! reconciled the global parameter list the registry is resolved exactly
//! once: each spec either materialises into a [`PenaltyTerm`] holding
//! global slot indices, or is dropped with a warning when an operand name
//! does not exist.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::formula::FormulaExpr;
use crate::params::FitParameter;

/// A constraint as declared in configuration, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    /// Arithmetic expression over the operand names.
    pub formula: String,
    /// Ordered parameter names the formula may reference.
    pub operands: Vec<String>,
    /// External measurement central value.
    pub mean: f64,
    /// External measurement one-sigma width.
    pub width: f64,
}

/// A resolved, evaluable penalty term.
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyTerm {
    expr: FormulaExpr,
    operand_slots: Vec<usize>,
    mean: f64,
    width: f64,
}

impl PenaltyTerm {
    /// Additive negative-log-likelihood penalty for the given global
    /// parameter values: `(f(x) - mean)^2 / (2 width^2)`.
    pub fn penalty(&self, global_values: &[f64]) -> f64 {
        let operand_values: Vec<f64> = self
            .operand_slots
            .iter()
            .map(|&slot| global_values[slot])
            .collect();
        let deviation = self.expr.eval(&operand_values) - self.mean;
        deviation * deviation / (2.0 * self.width * self.width)
    }
}

/// Holds constraint declarations until the global parameter list exists.
#[derive(Debug, Clone, Default)]
pub struct ConstraintRegistry {
    specs: Vec<ConstraintSpec>,
    resolved: Vec<PenaltyTerm>,
    is_resolved: bool,
}

impl ConstraintRegistry {
    /// Creates an empty registry (the zero-constraint fit).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constraint declaration. Must be called before
    /// [`ConstraintRegistry::resolve`].
    pub fn declare(&mut self, spec: ConstraintSpec) {
        debug_assert!(!self.is_resolved, "constraint declared after resolution");
        self.specs.push(spec);
    }

    /// Number of declared specs (resolved or not).
    pub fn declared_count(&self) -> usize {
        self.specs.len()
    }

    /// Resolves every declared spec against the reconciled global
    /// parameter list. Specs whose operands cannot all be found, or whose
    /// formula fails to parse, are dropped with a warning rather than
    /// silently substituted. Idempotent: later calls are no-ops.
    pub fn resolve(&mut self, params: &[FitParameter]) {
        if self.is_resolved {
            return;
        }
        self.is_resolved = true;
        for spec in &self.specs {
            let mut operand_slots = Vec::with_capacity(spec.operands.len());
            let mut missing = None;
            for name in &spec.operands {
                match params.iter().position(|p| p.name == *name) {
                    Some(slot) => operand_slots.push(slot),
                    None => {
                        missing = Some(name.clone());
                        break;
                    }
                }
            }
            if let Some(name) = missing {
                warn!(
                    formula = %spec.formula,
                    operand = %name,
                    "dropping constraint: operand not in global parameter list"
                );
                continue;
            }
            match FormulaExpr::parse(&spec.formula, &spec.operands) {
                Ok(expr) => self.resolved.push(PenaltyTerm {
                    expr,
                    operand_slots,
                    mean: spec.mean,
                    width: spec.width,
                }),
                Err(err) => {
                    warn!(formula = %spec.formula, error = %err, "dropping unparsable constraint");
                }
            }
        }
    }

    /// Resolved penalty terms; empty before [`ConstraintRegistry::resolve`].
    pub fn terms(&self) -> &[PenaltyTerm] {
        &self.resolved
    }

    /// Total penalty over all resolved terms for the given global values.
    pub fn total_penalty(&self, global_values: &[f64]) -> f64 {
        self.resolved
            .iter()
            .map(|term| term.penalty(global_values))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(formula: &str, operands: &[&str], mean: f64, width: f64) -> ConstraintSpec {
        ConstraintSpec {
            formula: formula.to_string(),
            operands: operands.iter().map(|s| s.to_string()).collect(),
            mean,
            width,
        }
    }

    fn params(names: &[&str]) -> Vec<FitParameter> {
        names.iter().map(|n| FitParameter::new(*n, 1.0)).collect()
    }

    #[test]
    fn resolved_penalty_is_quadratic() {
        let mut registry = ConstraintRegistry::new();
        registry.declare(spec("tau", &["tau"], 1.5, 0.1));
        registry.resolve(&params(&["mass", "tau"]));
        assert_eq!(registry.terms().len(), 1);
        // tau sits at global slot 1; one sigma off => penalty 0.5.
        let penalty = registry.total_penalty(&[0.0, 1.6]);
        assert!((penalty - 0.5).abs() < 1e-12);
        // At the mean the penalty vanishes.
        assert_eq!(registry.total_penalty(&[0.0, 1.5]), 0.0);
    }

    #[test]
    fn unresolvable_operand_drops_constraint() {
        let mut registry = ConstraintRegistry::new();
        registry.declare(spec("tau", &["tau"], 1.5, 0.1));
        registry.declare(spec("ghost", &["ghost"], 0.0, 1.0));
        registry.resolve(&params(&["tau"]));
        assert_eq!(registry.terms().len(), 1);
    }

    #[test]
    fn unparsable_formula_drops_constraint() {
        let mut registry = ConstraintRegistry::new();
        registry.declare(spec("tau +", &["tau"], 1.5, 0.1));
        registry.resolve(&params(&["tau"]));
        assert!(registry.terms().is_empty());
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut registry = ConstraintRegistry::new();
        registry.declare(spec("a / b", &["a", "b"], 1.0, 0.5));
        let p = params(&["a", "b"]);
        registry.resolve(&p);
        registry.resolve(&p);
        assert_eq!(registry.terms().len(), 1);
    }

    #[test]
    fn multi_operand_formula_reads_global_slots() {
        let mut registry = ConstraintRegistry::new();
        registry.declare(spec("a / b", &["a", "b"], 2.0, 0.5));
        registry.resolve(&params(&["x", "a", "b"]));
        // a=6 at slot 1, b=2 at slot 2 => f=3, one sigma above the mean.
        let penalty = registry.total_penalty(&[0.0, 6.0, 2.0]);
        assert!((penalty - 0.5).abs() < 1e-12);
    }
}
