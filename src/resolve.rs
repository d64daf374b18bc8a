//! Resolution of calculated grade components.
//!
//! A discipline's components form a dependency graph: every calculated
//! component points at the components its formula reads. Trimestral
//! components only see dependencies from their own trimester, annual
//! components see every trimester. The graph is ordered once per discipline
//! (`ResolutionPlan::build`) and then evaluated for each student.

use crate::formula::Formula;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalcScope {
    #[default]
    Trimestral,
    Annual,
}

impl CalcScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "trimestral" => Some(CalcScope::Trimestral),
            "annual" | "anual" => Some(CalcScope::Annual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CalcScope::Trimestral => "trimestral",
            CalcScope::Annual => "annual",
        }
    }
}

/// What to do when a calculated component reads a dependency that has no
/// value for the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingValuePolicy {
    #[default]
    TreatAsZero,
    Skip,
}

impl MissingValuePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "treatAsZero" => Some(MissingValuePolicy::TreatAsZero),
            "skip" => Some(MissingValuePolicy::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComponentDef {
    pub id: String,
    pub code: String,
    pub name: String,
    pub weight: f64,
    pub trimester: Option<i64>,
    pub is_calculated: bool,
    pub formula: Option<String>,
    pub depends_on: Vec<String>,
    pub scope: CalcScope,
}

/// Configuration problems found while building a plan. None of them stop
/// the plan; the affected input (or component) is left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PlanIssue {
    UnknownDependency {
        component_id: String,
        component_code: String,
        dependency_id: String,
    },
    CrossTrimesterDependency {
        component_id: String,
        component_code: String,
        dependency_id: String,
        dependency_code: String,
    },
    DuplicateDependencyCode {
        component_id: String,
        component_code: String,
        code: String,
    },
    MissingFormula {
        component_id: String,
        component_code: String,
    },
    BadFormula {
        component_id: String,
        component_code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("calculation cycle between components: {}", .codes.join(", "))]
    Cycle {
        component_ids: Vec<String>,
        codes: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ResolveIssue {
    MissingDependencyValue {
        component_id: String,
        component_code: String,
        missing: Vec<String>,
        skipped: bool,
    },
    NoInputs {
        component_id: String,
        component_code: String,
    },
    FormulaFailed {
        component_id: String,
        component_code: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
struct Input {
    component_id: String,
    code: String,
}

#[derive(Debug, Clone)]
struct Step {
    component_id: String,
    code: String,
    scope: CalcScope,
    formula: Formula,
    inputs: Vec<Input>,
}

#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    direct_ids: Vec<String>,
    steps: Vec<Step>,
    issues: Vec<PlanIssue>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Component id => resolved value.
    pub values: HashMap<String, f64>,
    pub issues: Vec<ResolveIssue>,
}

pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

impl ResolutionPlan {
    pub fn build(components: &[ComponentDef]) -> Result<ResolutionPlan, PlanError> {
        let by_id: HashMap<&str, &ComponentDef> =
            components.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut issues = Vec::new();
        let mut direct_ids = Vec::new();
        let mut steps: Vec<Step> = Vec::new();

        for c in components {
            if !c.is_calculated {
                direct_ids.push(c.id.clone());
                continue;
            }
            let Some(text) = c.formula.as_deref().filter(|t| !t.trim().is_empty()) else {
                warn!(component = %c.code, "calculated component has no formula");
                issues.push(PlanIssue::MissingFormula {
                    component_id: c.id.clone(),
                    component_code: c.code.clone(),
                });
                continue;
            };
            let formula = match Formula::parse(text) {
                Ok(f) => f,
                Err(e) => {
                    warn!(component = %c.code, error = %e, "formula does not parse");
                    issues.push(PlanIssue::BadFormula {
                        component_id: c.id.clone(),
                        component_code: c.code.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let mut inputs: Vec<Input> = Vec::new();
            for dep_id in &c.depends_on {
                let Some(dep) = by_id.get(dep_id.as_str()) else {
                    warn!(component = %c.code, dependency = %dep_id, "unknown dependency skipped");
                    issues.push(PlanIssue::UnknownDependency {
                        component_id: c.id.clone(),
                        component_code: c.code.clone(),
                        dependency_id: dep_id.clone(),
                    });
                    continue;
                };
                if c.scope == CalcScope::Trimestral && dep.trimester != c.trimester {
                    warn!(
                        component = %c.code,
                        dependency = %dep.code,
                        "trimestral component depends on another trimester; skipped"
                    );
                    issues.push(PlanIssue::CrossTrimesterDependency {
                        component_id: c.id.clone(),
                        component_code: c.code.clone(),
                        dependency_id: dep.id.clone(),
                        dependency_code: dep.code.clone(),
                    });
                    continue;
                }
                let code = dep.code.trim().to_uppercase();
                if inputs.iter().any(|i| i.code == code) {
                    warn!(component = %c.code, code = %code, "duplicate dependency code; first wins");
                    issues.push(PlanIssue::DuplicateDependencyCode {
                        component_id: c.id.clone(),
                        component_code: c.code.clone(),
                        code,
                    });
                    continue;
                }
                inputs.push(Input {
                    component_id: dep.id.clone(),
                    code,
                });
            }

            steps.push(Step {
                component_id: c.id.clone(),
                code: c.code.clone(),
                scope: c.scope,
                formula,
                inputs,
            });
        }

        let steps = order_steps(steps)?;
        Ok(ResolutionPlan {
            direct_ids,
            steps,
            issues,
        })
    }

    pub fn issues(&self) -> &[PlanIssue] {
        &self.issues
    }

    /// Calculated component ids in evaluation order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.component_id.as_str()).collect()
    }

    /// `raw` maps component id => entered value for one student.
    pub fn resolve(&self, raw: &HashMap<String, f64>, policy: MissingValuePolicy) -> Resolution {
        let mut values: HashMap<String, f64> = HashMap::new();
        for id in &self.direct_ids {
            if let Some(v) = raw.get(id) {
                values.insert(id.clone(), *v);
            }
        }

        let mut issues = Vec::new();
        for step in &self.steps {
            let mut bindings: HashMap<String, f64> = HashMap::new();
            let mut missing: Vec<String> = Vec::new();
            let mut present = 0_usize;
            for input in &step.inputs {
                match values.get(&input.component_id) {
                    Some(v) => {
                        bindings.insert(input.code.clone(), *v);
                        present += 1;
                    }
                    None => missing.push(input.code.clone()),
                }
            }
            for var in step.formula.variables() {
                if !bindings.contains_key(&var) && !missing.contains(&var) {
                    missing.push(var);
                }
            }

            if present == 0 {
                debug!(component = %step.code, "no dependency values yet; left unset");
                issues.push(ResolveIssue::NoInputs {
                    component_id: step.component_id.clone(),
                    component_code: step.code.clone(),
                });
                continue;
            }

            if !missing.is_empty() {
                let skipped = policy == MissingValuePolicy::Skip;
                warn!(
                    component = %step.code,
                    missing = ?missing,
                    skipped,
                    "missing dependency values"
                );
                issues.push(ResolveIssue::MissingDependencyValue {
                    component_id: step.component_id.clone(),
                    component_code: step.code.clone(),
                    missing: missing.clone(),
                    skipped,
                });
                if skipped {
                    continue;
                }
                for code in missing {
                    bindings.insert(code, 0.0);
                }
            }

            match step.formula.eval(&bindings) {
                Ok(v) => {
                    values.insert(step.component_id.clone(), round_off_2_decimals(v));
                }
                Err(e) => {
                    warn!(component = %step.code, error = %e, "formula evaluation failed");
                    issues.push(ResolveIssue::FormulaFailed {
                        component_id: step.component_id.clone(),
                        component_code: step.code.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Resolution { values, issues }
    }
}

/// Kahn's algorithm. Among ready steps trimestral ones go first, so every
/// trimestral value is final before any annual formula reads it.
fn order_steps(steps: Vec<Step>) -> Result<Vec<Step>, PlanError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.component_id.as_str(), i))
        .collect();

    let mut in_degree = vec![0_usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, s) in steps.iter().enumerate() {
        for input in &s.inputs {
            if let Some(&j) = index.get(input.component_id.as_str()) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready_trimestral: BTreeSet<usize> = BTreeSet::new();
    let mut ready_annual: BTreeSet<usize> = BTreeSet::new();
    let push_ready = |i: usize, t: &mut BTreeSet<usize>, a: &mut BTreeSet<usize>| {
        match steps[i].scope {
            CalcScope::Trimestral => t.insert(i),
            CalcScope::Annual => a.insert(i),
        };
    };
    for i in 0..steps.len() {
        if in_degree[i] == 0 {
            push_ready(i, &mut ready_trimestral, &mut ready_annual);
        }
    }

    let mut order: Vec<usize> = Vec::with_capacity(steps.len());
    loop {
        let next = match ready_trimestral.pop_first() {
            Some(i) => i,
            None => match ready_annual.pop_first() {
                Some(i) => i,
                None => break,
            },
        };
        order.push(next);
        for &d in &dependents[next] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                push_ready(d, &mut ready_trimestral, &mut ready_annual);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] > 0).collect();
        return Err(PlanError::Cycle {
            component_ids: stuck.iter().map(|&i| steps[i].component_id.clone()).collect(),
            codes: stuck.iter().map(|&i| steps[i].code.clone()).collect(),
        });
    }

    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}
