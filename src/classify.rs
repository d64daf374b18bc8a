//! Promotion decision per student and the class-level summary.

use crate::resolve::round_off_2_decimals;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationStatus {
    #[serde(rename = "Transita")]
    Transita,
    #[serde(rename = "Não Transita")]
    NaoTransita,
    #[serde(rename = "Condicional")]
    Condicional,
    #[serde(rename = "AguardandoNotas")]
    AguardandoNotas,
}

impl ClassificationStatus {
    pub fn label(self) -> &'static str {
        match self {
            ClassificationStatus::Transita => "Transita",
            ClassificationStatus::NaoTransita => "Não Transita",
            ClassificationStatus::Condicional => "Condicional",
            ClassificationStatus::AguardandoNotas => "AguardandoNotas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceOutcome {
    #[default]
    Fail,
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationPolicy {
    pub pass_threshold: f64,
    /// Discipline id => threshold, overriding `pass_threshold`.
    pub discipline_thresholds: BTreeMap<String, f64>,
    pub max_conditional_failures: usize,
    pub min_attendance_pct: Option<f64>,
    pub attendance_outcome: AttendanceOutcome,
    pub require_all_grades: bool,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            pass_threshold: 10.0,
            discipline_thresholds: BTreeMap::new(),
            max_conditional_failures: 2,
            min_attendance_pct: None,
            attendance_outcome: AttendanceOutcome::Fail,
            require_all_grades: false,
        }
    }
}

impl ClassificationPolicy {
    pub fn threshold_for(&self, discipline_id: &str) -> f64 {
        self.discipline_thresholds
            .get(discipline_id)
            .copied()
            .unwrap_or(self.pass_threshold)
    }

    fn apply(&mut self, patch: &PolicyPatch) {
        if let Some(v) = patch.pass_threshold {
            self.pass_threshold = v;
        }
        if let Some(m) = &patch.discipline_thresholds {
            for (k, v) in m {
                self.discipline_thresholds.insert(k.clone(), *v);
            }
        }
        if let Some(v) = patch.max_conditional_failures {
            self.max_conditional_failures = v;
        }
        if let Some(v) = patch.min_attendance_pct {
            self.min_attendance_pct = Some(v);
        }
        if let Some(v) = patch.attendance_outcome {
            self.attendance_outcome = v;
        }
        if let Some(v) = patch.require_all_grades {
            self.require_all_grades = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discipline_thresholds: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_conditional_failures: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_attendance_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_outcome: Option<AttendanceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_all_grades: Option<bool>,
}

/// Default policy refined by education level, then by grade-level label.
/// Keys are compared trimmed and lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyBook {
    pub default: ClassificationPolicy,
    pub by_education_level: BTreeMap<String, PolicyPatch>,
    pub by_grade_level: BTreeMap<String, PolicyPatch>,
}

pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

impl PolicyBook {
    pub fn select(&self, education_level: Option<&str>, grade_level: Option<&str>) -> ClassificationPolicy {
        let mut policy = self.default.clone();
        if let Some(level) = education_level.map(normalize_key) {
            if let Some(p) = self
                .by_education_level
                .iter()
                .find(|(k, _)| normalize_key(k) == level)
                .map(|(_, p)| p)
            {
                policy.apply(p);
            }
        }
        if let Some(grade) = grade_level.map(normalize_key) {
            if let Some(p) = self
                .by_grade_level
                .iter()
                .find(|(k, _)| normalize_key(k) == grade)
                .map(|(_, p)| p)
            {
                policy.apply(p);
            }
        }
        policy
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MandatorySubjects(BTreeSet<String>);

impl MandatorySubjects {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, discipline_id: &str) -> bool {
        self.0.contains(discipline_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisciplineGrade {
    pub discipline_id: String,
    pub discipline_name: String,
    pub final_grade: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudentInput {
    /// Only disciplines with a resolved final grade.
    pub grades: Vec<DisciplineGrade>,
    /// Names of class disciplines that have no final grade yet.
    pub pending_disciplines: Vec<String>,
    pub attendance_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentClassification {
    pub average: Option<f64>,
    pub status: ClassificationStatus,
    pub failing_disciplines: Vec<String>,
    pub reasons: Vec<String>,
    pub at_risk_disciplines: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub observation: String,
    pub conditional_enrollment: bool,
    pub retention_reason: Option<String>,
    pub pending_disciplines: Vec<String>,
}

fn names(gs: &[&DisciplineGrade]) -> Vec<String> {
    gs.iter().map(|g| g.discipline_name.clone()).collect()
}

fn awaiting(reason: String, pending: Vec<String>) -> StudentClassification {
    let status = ClassificationStatus::AguardandoNotas;
    StudentClassification {
        average: None,
        status,
        failing_disciplines: Vec::new(),
        observation: format!("{}. {}.", status.label(), reason),
        reasons: vec![reason],
        at_risk_disciplines: Vec::new(),
        recommended_actions: vec!["Lançar as notas em falta".to_string()],
        conditional_enrollment: false,
        retention_reason: None,
        pending_disciplines: pending,
    }
}

pub fn classify_student(
    input: &StudentInput,
    policy: &ClassificationPolicy,
    mandatory: &MandatorySubjects,
) -> StudentClassification {
    let pending = input.pending_disciplines.clone();
    if input.grades.is_empty() {
        return awaiting("Sem notas finais lançadas".to_string(), pending);
    }
    if policy.require_all_grades && !pending.is_empty() {
        return awaiting(format!("Notas em falta: {}", pending.join(", ")), pending);
    }

    let sum: f64 = input.grades.iter().map(|g| g.final_grade).sum();
    let average = round_off_2_decimals(sum / (input.grades.len() as f64));

    let failing: Vec<&DisciplineGrade> = input
        .grades
        .iter()
        .filter(|g| g.final_grade < policy.threshold_for(&g.discipline_id))
        .collect();
    let (mandatory_failing, optional_failing): (Vec<&DisciplineGrade>, Vec<&DisciplineGrade>) =
        failing
            .iter()
            .copied()
            .partition(|g| mandatory.contains(&g.discipline_id));

    let mut reasons: Vec<String> = Vec::new();
    let mut retention_reason: Option<String> = None;
    let mut conditional_enrollment = false;
    let at_risk: Vec<String>;
    let mut status;

    if !mandatory_failing.is_empty() {
        status = ClassificationStatus::NaoTransita;
        at_risk = names(&mandatory_failing);
        for g in &mandatory_failing {
            reasons.push(format!(
                "Negativa em disciplina obrigatória: {} ({:.2})",
                g.discipline_name, g.final_grade
            ));
        }
        for g in &optional_failing {
            reasons.push(format!("Negativa em {} ({:.2})", g.discipline_name, g.final_grade));
        }
        retention_reason = Some(format!(
            "Reprovação em disciplina obrigatória: {}",
            at_risk.join(", ")
        ));
    } else if failing.len() > policy.max_conditional_failures {
        status = ClassificationStatus::NaoTransita;
        at_risk = names(&failing);
        for g in &failing {
            reasons.push(format!("Negativa em {} ({:.2})", g.discipline_name, g.final_grade));
        }
        reasons.push(format!(
            "{} negativas excedem o limite de {} para transição condicional",
            failing.len(),
            policy.max_conditional_failures
        ));
        retention_reason = Some(format!("Excesso de negativas: {}", at_risk.join(", ")));
    } else if !failing.is_empty() {
        status = ClassificationStatus::Condicional;
        conditional_enrollment = true;
        at_risk = names(&failing);
        for g in &failing {
            reasons.push(format!("Negativa em {} ({:.2})", g.discipline_name, g.final_grade));
        }
    } else {
        status = ClassificationStatus::Transita;
        at_risk = Vec::new();
        reasons.push("Positiva em todas as disciplinas avaliadas".to_string());
    }

    let mut actions: Vec<String> = at_risk
        .iter()
        .map(|name| format!("Agendar exame de recurso em {}", name))
        .collect();

    if let (Some(min), Some(pct)) = (policy.min_attendance_pct, input.attendance_pct) {
        if pct < min {
            let reason = format!("Assiduidade insuficiente: {:.1}% (mínimo {:.1}%)", pct, min);
            reasons.push(reason.clone());
            actions.push("Acompanhar a assiduidade com o encarregado de educação".to_string());
            match policy.attendance_outcome {
                AttendanceOutcome::Fail => {
                    status = ClassificationStatus::NaoTransita;
                    conditional_enrollment = false;
                    retention_reason.get_or_insert(reason);
                }
                AttendanceOutcome::Conditional => {
                    if status == ClassificationStatus::Transita {
                        status = ClassificationStatus::Condicional;
                        conditional_enrollment = true;
                    }
                }
            }
        }
    }
    if conditional_enrollment {
        actions.push("Matrícula condicional com plano de recuperação".to_string());
    }

    if !pending.is_empty() {
        reasons.push(format!("Notas em falta: {}", pending.join(", ")));
    }

    let observation = format!(
        "{}. Média: {:.2}. {}.",
        status.label(),
        average,
        reasons.join("; ")
    );

    StudentClassification {
        average: Some(average),
        status,
        failing_disciplines: names(&failing),
        reasons,
        at_risk_disciplines: at_risk,
        recommended_actions: actions,
        observation,
        conditional_enrollment,
        retention_reason: if status == ClassificationStatus::NaoTransita {
            retention_reason
        } else {
            None
        },
        pending_disciplines: pending,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub total: usize,
    /// Transita plus Condicional.
    pub passed: usize,
    pub conditional: usize,
    pub failed: usize,
    pub awaiting: usize,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn class_statistics<'a, I>(rows: I) -> ClassStatistics
where
    I: IntoIterator<Item = &'a StudentClassification>,
{
    let mut stats = ClassStatistics::default();
    let mut averages: Vec<f64> = Vec::new();
    for c in rows {
        stats.total += 1;
        match c.status {
            ClassificationStatus::Transita => stats.passed += 1,
            ClassificationStatus::Condicional => {
                stats.passed += 1;
                stats.conditional += 1;
            }
            ClassificationStatus::NaoTransita => stats.failed += 1,
            ClassificationStatus::AguardandoNotas => {
                stats.awaiting += 1;
                continue;
            }
        }
        if let Some(avg) = c.average {
            averages.push(avg);
        }
    }
    if !averages.is_empty() {
        let sum: f64 = averages.iter().sum();
        stats.average = Some(round_off_2_decimals(sum / (averages.len() as f64)));
        stats.min = averages.iter().copied().reduce(f64::min);
        stats.max = averages.iter().copied().reduce(f64::max);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(id: &str, name: &str, v: f64) -> DisciplineGrade {
        DisciplineGrade {
            discipline_id: id.to_string(),
            discipline_name: name.to_string(),
            final_grade: v,
        }
    }

    fn input(grades: Vec<DisciplineGrade>) -> StudentInput {
        StudentInput {
            grades,
            ..Default::default()
        }
    }

    fn core_subjects() -> MandatorySubjects {
        MandatorySubjects::new(["mat", "por"])
    }

    #[test]
    fn mandatory_failure_dominates() {
        let c = classify_student(
            &input(vec![
                grade("mat", "Matemática", 8.0),
                grade("por", "Português", 12.0),
                grade("his", "História", 9.0),
            ]),
            &ClassificationPolicy::default(),
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::NaoTransita);
        assert_eq!(c.at_risk_disciplines, vec!["Matemática".to_string()]);
        assert_eq!(
            c.failing_disciplines,
            vec!["Matemática".to_string(), "História".to_string()]
        );
        assert!(!c.conditional_enrollment);
        assert_eq!(
            c.retention_reason.as_deref(),
            Some("Reprovação em disciplina obrigatória: Matemática")
        );
        assert_eq!(c.average, Some(9.67));
        assert!(c.observation.starts_with("Não Transita. Média: 9.67."));
        assert_eq!(
            c.recommended_actions,
            vec!["Agendar exame de recurso em Matemática".to_string()]
        );
    }

    #[test]
    fn no_grades_means_awaiting() {
        let c = classify_student(
            &StudentInput {
                pending_disciplines: vec!["Matemática".into()],
                ..Default::default()
            },
            &ClassificationPolicy::default(),
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::AguardandoNotas);
        assert_eq!(c.average, None);
        assert_eq!(c.pending_disciplines, vec!["Matemática".to_string()]);
    }

    #[test]
    fn threshold_is_inclusive() {
        let c = classify_student(
            &input(vec![grade("mat", "Matemática", 10.0), grade("por", "Português", 10.0)]),
            &ClassificationPolicy::default(),
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::Transita);
        assert!(c.failing_disciplines.is_empty());

        let c = classify_student(
            &input(vec![grade("mat", "Matemática", 9.99)]),
            &ClassificationPolicy::default(),
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::NaoTransita);
    }

    #[test]
    fn optional_failures_within_allowance_are_conditional() {
        let c = classify_student(
            &input(vec![
                grade("mat", "Matemática", 14.0),
                grade("por", "Português", 11.0),
                grade("his", "História", 9.0),
                grade("geo", "Geografia", 7.5),
            ]),
            &ClassificationPolicy::default(),
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::Condicional);
        assert!(c.conditional_enrollment);
        assert_eq!(
            c.at_risk_disciplines,
            vec!["História".to_string(), "Geografia".to_string()]
        );
        assert_eq!(c.retention_reason, None);
        assert!(c
            .recommended_actions
            .contains(&"Matrícula condicional com plano de recuperação".to_string()));
    }

    #[test]
    fn too_many_optional_failures_fail() {
        let policy = ClassificationPolicy {
            max_conditional_failures: 1,
            ..Default::default()
        };
        let c = classify_student(
            &input(vec![
                grade("mat", "Matemática", 14.0),
                grade("his", "História", 9.0),
                grade("geo", "Geografia", 7.5),
            ]),
            &policy,
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::NaoTransita);
        assert_eq!(c.at_risk_disciplines.len(), 2);
        assert_eq!(
            c.retention_reason.as_deref(),
            Some("Excesso de negativas: História, Geografia")
        );
    }

    #[test]
    fn per_discipline_threshold_overrides_default() {
        let mut policy = ClassificationPolicy::default();
        policy.discipline_thresholds.insert("ef".into(), 8.0);
        let c = classify_student(
            &input(vec![grade("ef", "Educação Física", 8.5), grade("mat", "Matemática", 12.0)]),
            &policy,
            &core_subjects(),
        );
        assert_eq!(c.status, ClassificationStatus::Transita);
    }

    #[test]
    fn low_attendance_can_fail_or_downgrade() {
        let grades = vec![grade("mat", "Matemática", 15.0), grade("por", "Português", 13.0)];
        let mut policy = ClassificationPolicy {
            min_attendance_pct: Some(75.0),
            ..Default::default()
        };
        let student = StudentInput {
            grades,
            pending_disciplines: Vec::new(),
            attendance_pct: Some(60.0),
        };

        let c = classify_student(&student, &policy, &core_subjects());
        assert_eq!(c.status, ClassificationStatus::NaoTransita);
        assert_eq!(
            c.retention_reason.as_deref(),
            Some("Assiduidade insuficiente: 60.0% (mínimo 75.0%)")
        );

        policy.attendance_outcome = AttendanceOutcome::Conditional;
        let c = classify_student(&student, &policy, &core_subjects());
        assert_eq!(c.status, ClassificationStatus::Condicional);
        assert!(c.conditional_enrollment);

        let ok = StudentInput {
            attendance_pct: Some(90.0),
            ..student.clone()
        };
        let c = classify_student(&ok, &policy, &core_subjects());
        assert_eq!(c.status, ClassificationStatus::Transita);
    }

    #[test]
    fn low_attendance_failure_drops_conditional_enrollment() {
        let policy = ClassificationPolicy {
            min_attendance_pct: Some(75.0),
            ..Default::default()
        };
        let student = StudentInput {
            grades: vec![grade("mat", "Matemática", 14.0), grade("his", "História", 8.0)],
            pending_disciplines: Vec::new(),
            attendance_pct: Some(50.0),
        };

        let c = classify_student(&student, &policy, &core_subjects());
        assert_eq!(c.status, ClassificationStatus::NaoTransita);
        assert!(!c.conditional_enrollment);
        assert_eq!(
            c.recommended_actions,
            vec![
                "Agendar exame de recurso em História".to_string(),
                "Acompanhar a assiduidade com o encarregado de educação".to_string(),
            ]
        );
    }

    #[test]
    fn require_all_grades_waits_for_missing_disciplines() {
        let student = StudentInput {
            grades: vec![grade("mat", "Matemática", 15.0)],
            pending_disciplines: vec!["Português".into()],
            attendance_pct: None,
        };
        let c = classify_student(&student, &ClassificationPolicy::default(), &core_subjects());
        assert_eq!(c.status, ClassificationStatus::Transita);
        assert_eq!(c.average, Some(15.0));

        let policy = ClassificationPolicy {
            require_all_grades: true,
            ..Default::default()
        };
        let c = classify_student(&student, &policy, &core_subjects());
        assert_eq!(c.status, ClassificationStatus::AguardandoNotas);
        assert_eq!(c.average, None);
    }

    #[test]
    fn mandatory_failure_is_never_promoted() {
        let mandatory = core_subjects();
        let values = [0.0, 5.0, 9.99, 10.0, 14.0, 20.0];
        let outcomes = [AttendanceOutcome::Fail, AttendanceOutcome::Conditional];
        for &mat in &values {
            for &his in &values {
                for &max in &[0_usize, 1, 5] {
                    for &outcome in &outcomes {
                        let policy = ClassificationPolicy {
                            max_conditional_failures: max,
                            min_attendance_pct: Some(50.0),
                            attendance_outcome: outcome,
                            ..Default::default()
                        };
                        let student = StudentInput {
                            grades: vec![
                                grade("mat", "Matemática", mat),
                                grade("his", "História", his),
                            ],
                            pending_disciplines: Vec::new(),
                            attendance_pct: Some(40.0),
                        };
                        let c = classify_student(&student, &policy, &mandatory);
                        if mat < 10.0 {
                            assert_eq!(c.status, ClassificationStatus::NaoTransita);
                        }
                        assert_eq!(c, classify_student(&student, &policy, &mandatory));
                    }
                }
            }
        }
    }

    #[test]
    fn policy_book_layers_level_then_grade() {
        let mut book = PolicyBook::default();
        book.by_education_level.insert(
            "Ensino Primário".into(),
            PolicyPatch {
                pass_threshold: Some(5.0),
                max_conditional_failures: Some(0),
                ..Default::default()
            },
        );
        book.by_grade_level.insert(
            "6ª classe".into(),
            PolicyPatch {
                min_attendance_pct: Some(80.0),
                ..Default::default()
            },
        );

        let p = book.select(Some("ensino primário"), Some(" 6ª Classe "));
        assert_eq!(p.pass_threshold, 5.0);
        assert_eq!(p.max_conditional_failures, 0);
        assert_eq!(p.min_attendance_pct, Some(80.0));

        let p = book.select(Some("Ensino Secundário"), None);
        assert_eq!(p, ClassificationPolicy::default());
    }

    #[test]
    fn statistics_skip_awaiting_students() {
        let mandatory = core_subjects();
        let policy = ClassificationPolicy::default();
        let rows = vec![
            classify_student(&input(vec![grade("mat", "Matemática", 14.0)]), &policy, &mandatory),
            classify_student(&input(vec![grade("mat", "Matemática", 8.0)]), &policy, &mandatory),
            classify_student(
                &input(vec![grade("mat", "Matemática", 12.0), grade("his", "História", 7.0)]),
                &policy,
                &mandatory,
            ),
            classify_student(&StudentInput::default(), &policy, &mandatory),
        ];
        let stats = class_statistics(&rows);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.conditional, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.awaiting, 1);
        assert_eq!(stats.passed + stats.failed + stats.awaiting, stats.total);
        assert_eq!(stats.average, Some(10.5));
        assert_eq!(stats.min, Some(8.0));
        assert_eq!(stats.max, Some(14.0));
    }

    #[test]
    fn statistics_of_empty_class() {
        let stats = class_statistics(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average, None);
    }
}
