//! Tie-breaking among objective-equivalent selections.
//!
//! Rules are applied in order; a later rule is only consulted when every
//! earlier rule ties within epsilon. Remaining ties keep pool order.

use super::program::{AllocationProgram, Selection, EPS};

/// A secondary criterion over a complete selection. Lower is better.
pub trait TieBreakRule: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, sel: &[bool], program: &AllocationProgram) -> f64;
}

/// Least mismatch penalty on requests due today.
#[derive(Debug, Clone, Copy, Default)]
pub struct FewestTodayMismatches;

impl TieBreakRule for FewestTodayMismatches {
    fn name(&self) -> &str {
        "today_mismatch"
    }

    fn score(&self, sel: &[bool], program: &AllocationProgram) -> f64 {
        program.today_mismatch(sel)
    }
}

/// Oldest average age of the units issued today.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestIssued;

impl TieBreakRule for OldestIssued {
    fn name(&self) -> &str {
        "oldest_issued"
    }

    fn score(&self, sel: &[bool], program: &AllocationProgram) -> f64 {
        let (n, total) = program
            .today_pairs(sel)
            .fold((0u32, 0u64), |(n, t), p| (n + 1, t + u64::from(p.issue_age)));
        if n == 0 {
            0.0
        } else {
            -(total as f64 / f64::from(n))
        }
    }
}

/// Least usability cost on today's issues.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestTodayUsability;

impl TieBreakRule for LowestTodayUsability {
    fn name(&self) -> &str {
        "today_usability"
    }

    fn score(&self, sel: &[bool], program: &AllocationProgram) -> f64 {
        program.today_pairs(sel).map(|p| p.cost.usability).sum()
    }
}

/// Least substitution cost on today's issues.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestTodaySubstitution;

impl TieBreakRule for LowestTodaySubstitution {
    fn name(&self) -> &str {
        "today_substitution"
    }

    fn score(&self, sel: &[bool], program: &AllocationProgram) -> f64 {
        program.today_pairs(sel).map(|p| p.cost.substitution).sum()
    }
}

/// Sequential rule chain.
pub struct TieBreaker {
    rules: Vec<Box<dyn TieBreakRule>>,
    epsilon: f64,
}

impl TieBreaker {
    /// An empty chain: the first pool entry always wins.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            epsilon: EPS,
        }
    }

    /// Mismatches today, then oldest issued, then usability, then
    /// substitution.
    pub fn default_policy() -> Self {
        Self::new()
            .with_rule(FewestTodayMismatches)
            .with_rule(OldestIssued)
            .with_rule(LowestTodayUsability)
            .with_rule(LowestTodaySubstitution)
    }

    pub fn with_rule<R: TieBreakRule + 'static>(mut self, rule: R) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn with_epsilon(mut self, eps: f64) -> Self {
        self.epsilon = eps;
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Index of the preferred selection, `None` for an empty pool.
    pub fn select(&self, pool: &[Selection], program: &AllocationProgram) -> Option<usize> {
        if self.rules.is_empty() {
            return if pool.is_empty() { None } else { Some(0) };
        }
        let scores: Vec<Vec<f64>> = pool
            .iter()
            .map(|sel| self.rules.iter().map(|r| r.score(sel, program)).collect())
            .collect();
        (0..pool.len()).min_by(|&a, &b| {
            for (va, vb) in scores[a].iter().zip(&scores[b]) {
                if (va - vb).abs() > self.epsilon {
                    return va.total_cmp(vb);
                }
            }
            a.cmp(&b)
        })
    }
}

impl Default for TieBreaker {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl std::fmt::Debug for TieBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieBreaker")
            .field("rules", &self.rule_names())
            .field("epsilon", &self.epsilon)
            .finish()
    }
}
