//! Binary linear program definition.
//!
//! A solver-agnostic export surface: named binary variables, linear rows and
//! a minimized (optionally lexicographic) objective. External MIP backends
//! consume it through [`crate::solver::AllocationSolver`]; the bundled
//! solvers work on the typed [`super::AllocationProgram`] instead and use
//! this model for verification.

use std::fmt;

/// Handle of a variable inside a [`LinearModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// A binary decision variable.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryVar {
    /// Variable name, for export and diagnostics only.
    pub name: String,
    /// Fixed value, if any.
    pub fixed: Option<bool>,
}

impl BinaryVar {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixed: None,
        }
    }

    pub fn fixed(name: impl Into<String>, value: bool) -> Self {
        Self {
            name: name.into(),
            fixed: Some(value),
        }
    }
}

/// Row sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sense::Le => "<=",
            Sense::Ge => ">=",
            Sense::Eq => "=",
        })
    }
}

/// A linear row `Σ coef·var  (sense)  rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
}

impl Constraint {
    /// Left-hand side under a full assignment.
    pub fn lhs(&self, values: &[bool]) -> f64 {
        self.terms
            .iter()
            .filter(|(v, _)| values[v.0])
            .map(|(_, c)| c)
            .sum()
    }

    pub fn is_satisfied_by(&self, values: &[bool], eps: f64) -> bool {
        let lhs = self.lhs(values);
        match self.sense {
            Sense::Le => lhs <= self.rhs + eps,
            Sense::Ge => lhs >= self.rhs - eps,
            Sense::Eq => (lhs - self.rhs).abs() <= eps,
        }
    }
}

/// Objective function.
#[derive(Debug, Clone, PartialEq)]
pub enum Objective {
    /// Minimize a linear combination of variables.
    Minimize { terms: Vec<(VarId, f64)> },
    /// Lexicographic objectives, highest priority first.
    Hierarchical { objectives: Vec<Objective> },
}

impl Objective {
    /// Values of every tier under a full assignment.
    pub fn evaluate(&self, values: &[bool]) -> Vec<f64> {
        match self {
            Objective::Minimize { terms } => vec![terms
                .iter()
                .filter(|(v, _)| values[v.0])
                .map(|(_, c)| c)
                .sum()],
            Objective::Hierarchical { objectives } => {
                objectives.iter().flat_map(|o| o.evaluate(values)).collect()
            }
        }
    }

    fn for_each_var(&self, f: &mut impl FnMut(VarId)) {
        match self {
            Objective::Minimize { terms } => terms.iter().for_each(|(v, _)| f(*v)),
            Objective::Hierarchical { objectives } => {
                objectives.iter().for_each(|o| o.for_each_var(f))
            }
        }
    }
}

/// A pure binary linear program.
///
/// # Examples
///
/// ```
/// use rbc_matching::model::{LinearModel, Objective, Sense};
///
/// let mut model = LinearModel::new("toy");
/// let a = model.add_var("a");
/// let b = model.add_var("b");
/// model.add_row("pick_one", vec![(a, 1.0), (b, 1.0)], Sense::Eq, 1.0);
/// model.set_objective(Objective::Minimize { terms: vec![(a, 2.0), (b, 1.0)] });
/// assert!(model.validate().is_ok());
/// assert!(model.is_satisfied_by(&[false, true]));
/// assert_eq!(model.evaluate(&[false, true]), vec![1.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    /// Model name.
    pub name: String,
    pub vars: Vec<BinaryVar>,
    pub constraints: Vec<Constraint>,
    pub objective: Option<Objective>,
}

impl LinearModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: Vec::new(),
            constraints: Vec::new(),
            objective: None,
        }
    }

    /// Adds a free binary variable and returns its handle.
    pub fn add_var(&mut self, name: impl Into<String>) -> VarId {
        self.vars.push(BinaryVar::new(name));
        VarId(self.vars.len() - 1)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Convenience: add a row from parts.
    pub fn add_row(
        &mut self,
        name: impl Into<String>,
        terms: Vec<(VarId, f64)>,
        sense: Sense,
        rhs: f64,
    ) {
        self.constraints.push(Constraint {
            name: name.into(),
            terms,
            sense,
            rhs,
        });
    }

    pub fn set_objective(&mut self, objective: Objective) {
        self.objective = Some(objective);
    }

    /// Looks a variable up by name (linear scan; diagnostics only).
    pub fn var_by_name(&self, name: &str) -> Option<VarId> {
        self.vars.iter().position(|v| v.name == name).map(VarId)
    }

    /// Checks that every referenced variable exists and coefficients are
    /// finite.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.vars.len();
        for c in &self.constraints {
            for (v, coef) in &c.terms {
                if v.0 >= n {
                    return Err(format!("row {}: undefined variable #{}", c.name, v.0));
                }
                if !coef.is_finite() {
                    return Err(format!("row {}: non-finite coefficient", c.name));
                }
            }
            if !c.rhs.is_finite() {
                return Err(format!("row {}: non-finite right-hand side", c.name));
            }
        }
        if let Some(obj) = &self.objective {
            let mut bad = None;
            obj.for_each_var(&mut |v| {
                if v.0 >= n {
                    bad = Some(v.0);
                }
            });
            if let Some(v) = bad {
                return Err(format!("objective: undefined variable #{v}"));
            }
        }
        Ok(())
    }

    /// Whether a full assignment satisfies every row and fixed value.
    pub fn is_satisfied_by(&self, values: &[bool]) -> bool {
        self.violated_rows(values).is_empty()
    }

    /// Names of the rows (and fixed variables) a full assignment violates.
    pub fn violated_rows(&self, values: &[bool]) -> Vec<&str> {
        if values.len() != self.vars.len() {
            return vec!["<assignment length>"];
        }
        let fixed = self
            .vars
            .iter()
            .zip(values)
            .filter(|(v, x)| v.fixed.is_some_and(|f| f != **x))
            .map(|(v, _)| v.name.as_str());
        let rows = self
            .constraints
            .iter()
            .filter(|c| !c.is_satisfied_by(values, 1e-9))
            .map(|c| c.name.as_str());
        fixed.chain(rows).collect()
    }

    /// Objective tier values under a full assignment (empty without an
    /// objective).
    pub fn evaluate(&self, values: &[bool]) -> Vec<f64> {
        self.objective
            .as_ref()
            .map(|o| o.evaluate(values))
            .unwrap_or_default()
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }
}
