use serde::{Deserialize, Serialize};

/// External-measurement metadata attached to a parameter that carries a
/// Gaussian constraint of its own (single-operand shorthand for a full
/// [`crate::ConstraintSpec`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussConstraintMeta {
    /// External measurement central value.
    pub mean: f64,
    /// External measurement one-sigma width.
    pub width: f64,
}

/// A named scalar fit parameter.
///
/// The name is the parameter's identity: two workers declaring the same
/// name declare the same logical parameter, and the coordinator reconciles
/// them first-seen-wins. Value and error state mutate over the fit; the
/// name never does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    /// Unique name within a fit.
    pub name: String,
    /// Current value, updated every minimizer iteration.
    pub value: f64,
    /// Starting value handed to the minimizer.
    pub init_value: f64,
    /// Value used when the worker generated its dataset (for pulls).
    pub gen_value: f64,
    /// Lower bound, or `f64::NEG_INFINITY` when unbounded below.
    pub min_bound: f64,
    /// Upper bound, or `f64::INFINITY` when unbounded above.
    pub max_bound: f64,
    /// Whether the minimizer must hold the parameter fixed.
    pub fixed: bool,
    /// Whether the parameter is released only in the second fit stage.
    pub second_stage: bool,
    /// Symmetric (parabolic) error after the curvature pass.
    #[serde(default)]
    pub error: f64,
    /// Negative-side error after an asymmetric-error scan.
    #[serde(default)]
    pub neg_error: f64,
    /// Positive-side error after an asymmetric-error scan.
    #[serde(default)]
    pub pos_error: f64,
    /// Global correlation coefficient after the curvature pass.
    #[serde(default)]
    pub global_correlation: f64,
    /// Optional single-parameter Gaussian constraint.
    #[serde(default)]
    pub gauss_constraint: Option<GaussConstraintMeta>,
}

/// One field-level disagreement between two declarations of the same
/// logical parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMismatch {
    /// Field that disagreed (`init_value`, `min_bound`, ...).
    pub field: String,
    /// Value already registered (authoritative).
    pub registered: String,
    /// Value the later declaration carried (discarded).
    pub declared: String,
}

impl FitParameter {
    /// Creates a free, unbounded parameter with the given starting value.
    pub fn new(name: impl Into<String>, init_value: f64) -> Self {
        Self {
            name: name.into(),
            value: init_value,
            init_value,
            gen_value: init_value,
            min_bound: f64::NEG_INFINITY,
            max_bound: f64::INFINITY,
            fixed: false,
            second_stage: false,
            error: 0.0,
            neg_error: 0.0,
            pos_error: 0.0,
            global_correlation: 0.0,
            gauss_constraint: None,
        }
    }

    /// Sets both bounds.
    pub fn with_bounds(mut self, min_bound: f64, max_bound: f64) -> Self {
        self.min_bound = min_bound;
        self.max_bound = max_bound;
        self
    }

    /// Marks the parameter fixed.
    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Marks the parameter as second-stage.
    pub fn with_second_stage(mut self, second_stage: bool) -> Self {
        self.second_stage = second_stage;
        self
    }

    /// Compares this (authoritative) declaration against a later one and
    /// lists every field the two disagree on. The registered values stay
    /// in force; the caller is expected to log the mismatches and move on.
    pub fn consistency_check(&self, declared: &FitParameter) -> Vec<ParamMismatch> {
        let mut mismatches = Vec::new();
        let mut push = |field: &str, registered: String, declared: String| {
            mismatches.push(ParamMismatch {
                field: field.to_string(),
                registered,
                declared,
            });
        };
        if !float_eq(self.init_value, declared.init_value) {
            push(
                "init_value",
                self.init_value.to_string(),
                declared.init_value.to_string(),
            );
        }
        if !float_eq(self.min_bound, declared.min_bound) {
            push(
                "min_bound",
                self.min_bound.to_string(),
                declared.min_bound.to_string(),
            );
        }
        if !float_eq(self.max_bound, declared.max_bound) {
            push(
                "max_bound",
                self.max_bound.to_string(),
                declared.max_bound.to_string(),
            );
        }
        if self.fixed != declared.fixed {
            push("fixed", self.fixed.to_string(), declared.fixed.to_string());
        }
        if self.second_stage != declared.second_stage {
            push(
                "second_stage",
                self.second_stage.to_string(),
                declared.second_stage.to_string(),
            );
        }
        mismatches
    }

    /// Pull of the final value against the generated value, or `None`
    /// when the parameter has no usable error.
    pub fn pull(&self) -> Option<f64> {
        if self.error > 0.0 {
            Some((self.value - self.gen_value) / self.error)
        } else {
            None
        }
    }
}

/// Bitwise-or-both-NaN float comparison; identical declarations must not
/// trip the consistency check on NaN bounds.
fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_declarations_are_consistent() {
        let a = FitParameter::new("mass", 5.28).with_bounds(5.0, 5.5);
        let b = a.clone();
        assert!(a.consistency_check(&b).is_empty());
    }

    #[test]
    fn consistency_check_reports_every_field() {
        let a = FitParameter::new("mass", 5.28).with_bounds(5.0, 5.5);
        let b = FitParameter::new("mass", 5.30)
            .with_bounds(5.1, 5.5)
            .with_fixed(true);
        let mismatches = a.consistency_check(&b);
        let fields: Vec<&str> = mismatches.iter().map(|m| m.field.as_str()).collect();
        assert_eq!(fields, vec!["init_value", "min_bound", "fixed"]);
    }

    #[test]
    fn unbounded_parameters_compare_clean() {
        let a = FitParameter::new("yield", 100.0);
        let b = FitParameter::new("yield", 100.0);
        assert!(a.consistency_check(&b).is_empty());
    }

    #[test]
    fn pull_requires_positive_error() {
        let mut p = FitParameter::new("tau", 1.5);
        p.value = 1.6;
        p.gen_value = 1.5;
        assert_eq!(p.pull(), None);
        p.error = 0.05;
        let pull = p.pull().unwrap();
        assert!((pull - 2.0).abs() < 1e-9);
    }
}
