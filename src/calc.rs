use crate::classify::{
    class_statistics, classify_student, ClassStatistics, ClassificationPolicy, DisciplineGrade,
    MandatorySubjects, PolicyBook, StudentClassification, StudentInput,
};
use crate::db;
use crate::resolve::{
    CalcScope, ComponentDef, MissingValuePolicy, PlanError, PlanIssue, ResolutionPlan,
    ResolveIssue,
};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, debug_span, info, warn};

pub const CALCULATION_SETTINGS_KEY: &str = "setup.calculation";
pub const CLASSIFICATION_SETTINGS_KEY: &str = "setup.classification";

/// Bound on component scales and on the pass thresholds read against them.
pub const GRADE_SCALE_LIMIT: f64 = 1000.0;

/// Discipline names treated as mandatory when a class has no explicit list.
const DEFAULT_MANDATORY_NAMES: [&str; 3] = ["portugues", "lingua portuguesa", "matematica"];

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalculationSettings {
    pub missing_value_policy: MissingValuePolicy,
    /// Component codes that carry a discipline's final grade, most preferred first.
    pub final_codes: Vec<String>,
}

impl Default for CalculationSettings {
    fn default() -> Self {
        Self {
            missing_value_policy: MissingValuePolicy::TreatAsZero,
            final_codes: vec!["MFD".to_string(), "MF".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaFilters {
    pub student_id: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: String,
    pub name: String,
    pub academic_year: Option<String>,
    pub education_level: Option<String>,
    pub grade_level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplineSummary {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct ComponentRow {
    pub def: ComponentDef,
    pub discipline_id: String,
    pub scale_min: f64,
    pub scale_max: f64,
    pub is_final: bool,
    pub sort_order: i64,
}

impl ComponentRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.def.id,
            "disciplineId": self.discipline_id,
            "code": self.def.code,
            "name": self.def.name,
            "weight": self.def.weight,
            "trimester": self.def.trimester,
            "isCalculated": self.def.is_calculated,
            "formula": self.def.formula,
            "dependsOn": self.def.depends_on,
            "scope": self.def.scope.as_str(),
            "scaleMin": self.scale_min,
            "scaleMax": self.scale_max,
            "isFinal": self.is_final,
            "sortOrder": self.sort_order,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StudentSummary {
    pub id: String,
    pub process_no: Option<String>,
    pub full_name: String,
    pub gender: Option<String>,
    pub attendance_pct: Option<f64>,
}

/// Read-only inputs for one class, as loaded from the workspace.
#[derive(Debug, Clone)]
pub struct ClassSnapshot {
    pub class: ClassSummary,
    pub disciplines: Vec<DisciplineSummary>,
    /// Discipline id => components in display order.
    pub components: HashMap<String, Vec<ComponentRow>>,
    pub students: Vec<StudentSummary>,
    /// Student id => component id => entered value.
    pub grades: HashMap<String, HashMap<String, f64>>,
    pub mandatory_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum IssueDetail {
    Plan(PlanIssue),
    Resolve(ResolveIssue),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaIssue {
    pub discipline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub issue: IssueDetail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentColumn {
    pub id: String,
    pub code: String,
    pub name: String,
    pub weight: f64,
    pub trimester: Option<i64>,
    pub is_calculated: bool,
    pub scope: CalcScope,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplineColumn {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
    pub mandatory: bool,
    pub components: Vec<ComponentColumn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDisciplineGrades {
    pub discipline_id: String,
    /// Component id => resolved value (direct and calculated).
    pub grades: BTreeMap<String, f64>,
    pub final_grade: Option<f64>,
    pub final_component_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub student_id: String,
    pub process_no: Option<String>,
    pub full_name: String,
    pub gender: Option<String>,
    pub attendance_pct: Option<f64>,
    pub disciplines: Vec<StudentDisciplineGrades>,
    pub classification: StudentClassification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaModel {
    pub class: ClassSummary,
    pub generated_at: String,
    pub settings: CalculationSettings,
    pub policy: ClassificationPolicy,
    pub mandatory_discipline_ids: Vec<String>,
    pub disciplines: Vec<DisciplineColumn>,
    pub students: Vec<StudentRow>,
    pub statistics: ClassStatistics,
    pub issues: Vec<PautaIssue>,
}

pub fn parse_pauta_filters(raw: Option<&serde_json::Value>) -> Result<PautaFilters, CalcError> {
    let Some(raw) = raw else {
        return Ok(PautaFilters::default());
    };
    let Some(obj) = raw.as_object() else {
        return Err(CalcError::new("bad_params", "filters must be an object"));
    };

    let student_id = match obj.get("studentId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(CalcError::new(
                    "bad_params",
                    "filters.studentId must be string or null",
                ));
            };
            Some(s.to_string())
        }
    };

    let include_inactive = match obj.get("includeInactive") {
        None => false,
        Some(v) if v.is_null() => false,
        Some(v) => {
            let Some(b) = v.as_bool() else {
                return Err(CalcError::new(
                    "bad_params",
                    "filters.includeInactive must be boolean",
                ));
            };
            b
        }
    };

    Ok(PautaFilters {
        student_id,
        include_inactive,
    })
}

pub fn load_calculation_settings(conn: &Connection) -> Result<CalculationSettings, CalcError> {
    let saved = db::settings_get_json(conn, CALCULATION_SETTINGS_KEY)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(saved) = saved else {
        return Ok(CalculationSettings::default());
    };
    // Malformed historical values fall back to defaults rather than block reports.
    Ok(serde_json::from_value(saved).unwrap_or_else(|e| {
        warn!(error = %e, "stored calculation settings are malformed; using defaults");
        CalculationSettings::default()
    }))
}

pub fn load_policy_book(conn: &Connection) -> Result<PolicyBook, CalcError> {
    let saved = db::settings_get_json(conn, CLASSIFICATION_SETTINGS_KEY)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(saved) = saved else {
        return Ok(PolicyBook::default());
    };
    Ok(serde_json::from_value(saved).unwrap_or_else(|e| {
        warn!(error = %e, "stored classification policy is malformed; using defaults");
        PolicyBook::default()
    }))
}

const COMPONENT_COLUMNS: &str = "id, discipline_id, code, name, weight, trimester, is_calculated, \
     formula, depends_on, calc_scope, scale_min, scale_max, is_final, sort_order";

fn component_from_row(r: &Row<'_>) -> rusqlite::Result<ComponentRow> {
    let depends_raw: String = r.get(8)?;
    let depends_on: Vec<String> = serde_json::from_str(&depends_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let scope_raw: String = r.get(9)?;
    Ok(ComponentRow {
        def: ComponentDef {
            id: r.get(0)?,
            code: r.get(2)?,
            name: r.get(3)?,
            weight: r.get(4)?,
            trimester: r.get(5)?,
            is_calculated: r.get::<_, i64>(6)? != 0,
            formula: r.get(7)?,
            depends_on,
            scope: CalcScope::parse(&scope_raw).unwrap_or_default(),
        },
        discipline_id: r.get(1)?,
        scale_min: r.get(10)?,
        scale_max: r.get(11)?,
        is_final: r.get::<_, i64>(12)? != 0,
        sort_order: r.get(13)?,
    })
}

pub fn load_component(conn: &Connection, component_id: &str) -> Result<ComponentRow, CalcError> {
    let sql = format!("SELECT {} FROM components WHERE id = ?", COMPONENT_COLUMNS);
    conn.query_row(&sql, [component_id], component_from_row)
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| CalcError::new("not_found", "component not found"))
}

pub fn load_components(conn: &Connection, discipline_id: &str) -> Result<Vec<ComponentRow>, CalcError> {
    let sql = format!(
        "SELECT {} FROM components WHERE discipline_id = ? ORDER BY sort_order",
        COMPONENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    stmt.query_map([discipline_id], component_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

/// Builds the resolution plan for a discipline. A dependency cycle is a
/// configuration error and is reported as `calculation_cycle`.
pub fn discipline_plan(
    discipline_id: &str,
    discipline_name: &str,
    components: &[ComponentRow],
) -> Result<ResolutionPlan, CalcError> {
    let defs: Vec<ComponentDef> = components.iter().map(|c| c.def.clone()).collect();
    ResolutionPlan::build(&defs).map_err(|e| match &e {
        PlanError::Cycle {
            component_ids,
            codes,
        } => CalcError::new("calculation_cycle", format!("{}: {}", discipline_name, e))
            .with_details(json!({
                "disciplineId": discipline_id,
                "componentIds": component_ids,
                "codes": codes,
            })),
    })
}

pub fn load_class_snapshot(
    conn: &Connection,
    class_id: &str,
    filters: &PautaFilters,
) -> Result<ClassSnapshot, CalcError> {
    let class: Option<ClassSummary> = conn
        .query_row(
            "SELECT id, name, academic_year, education_level, grade_level
             FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok(ClassSummary {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    academic_year: r.get(2)?,
                    education_level: r.get(3)?,
                    grade_level: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some(class) = class else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let disciplines = load_disciplines(conn, class_id)?;

    let mut components: HashMap<String, Vec<ComponentRow>> = HashMap::new();
    for d in &disciplines {
        components.insert(d.id.clone(), load_components(conn, &d.id)?);
    }

    let mut stud_stmt = conn
        .prepare(
            "SELECT id, process_no, full_name, gender, attendance_pct
             FROM students
             WHERE class_id = ? AND (active = 1 OR ?)
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let mut students: Vec<StudentSummary> = stud_stmt
        .query_map((class_id, filters.include_inactive), |r| {
            Ok(StudentSummary {
                id: r.get(0)?,
                process_no: r.get(1)?,
                full_name: r.get(2)?,
                gender: r.get(3)?,
                attendance_pct: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    if let Some(only) = filters.student_id.as_deref() {
        students.retain(|s| s.id == only);
        if students.is_empty() {
            return Err(CalcError::new("not_found", "student not found"));
        }
    }

    let mut grade_stmt = conn
        .prepare(
            "SELECT g.student_id, g.component_id, g.value
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.class_id = ?",
        )
        .map_err(db_err)?;
    let rows = grade_stmt
        .query_map([class_id], |r| {
            let student_id: String = r.get(0)?;
            let component_id: String = r.get(1)?;
            let value: f64 = r.get(2)?;
            Ok((student_id, component_id, value))
        })
        .map_err(db_err)?;
    let mut grades: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for row in rows {
        let (student_id, component_id, value) = row.map_err(db_err)?;
        grades
            .entry(student_id)
            .or_default()
            .insert(component_id, value);
    }

    let mandatory_ids = load_mandatory_ids(conn, class_id)?;

    Ok(ClassSnapshot {
        class,
        disciplines,
        components,
        students,
        grades,
        mandatory_ids,
    })
}

pub fn load_disciplines(conn: &Connection, class_id: &str) -> Result<Vec<DisciplineSummary>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, sort_order FROM disciplines
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        Ok(DisciplineSummary {
            id: r.get(0)?,
            name: r.get(1)?,
            sort_order: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

pub fn load_mandatory_ids(conn: &Connection, class_id: &str) -> Result<Vec<String>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT m.discipline_id
             FROM class_mandatory_disciplines m
             JOIN disciplines d ON d.id = m.discipline_id
             WHERE m.class_id = ?
             ORDER BY d.sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

fn fold_name(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'ô' | 'õ' => 'o',
            'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

/// The configured set, or Portuguese and Mathematics when none is configured.
pub fn effective_mandatory(
    disciplines: &[DisciplineSummary],
    configured: &[String],
) -> MandatorySubjects {
    if !configured.is_empty() {
        return MandatorySubjects::new(configured.iter().cloned());
    }
    MandatorySubjects::new(
        disciplines
            .iter()
            .filter(|d| DEFAULT_MANDATORY_NAMES.contains(&fold_name(&d.name).as_str()))
            .map(|d| d.id.clone()),
    )
}

/// Candidate components for a discipline's final grade, most preferred
/// first: anything flagged `is_final`, then matches for `final_codes` in
/// order (annual before trimestral, later trimester before earlier).
pub fn final_candidates<'a>(
    components: &'a [ComponentRow],
    final_codes: &[String],
) -> Vec<&'a ComponentRow> {
    let mut out: Vec<&ComponentRow> = components.iter().filter(|c| c.is_final).collect();
    for code in final_codes {
        let mut matches: Vec<&ComponentRow> = components
            .iter()
            .filter(|c| !c.is_final && c.def.code.trim().eq_ignore_ascii_case(code.trim()))
            .collect();
        matches.sort_by_key(|c| std::cmp::Reverse(c.def.trimester.unwrap_or(i64::MAX)));
        out.extend(matches);
    }
    out
}

pub fn compute_pauta(ctx: &CalcContext<'_>, filters: &PautaFilters) -> Result<PautaModel, CalcError> {
    let conn = ctx.conn;
    let snapshot = load_class_snapshot(conn, ctx.class_id, filters)?;
    let settings = load_calculation_settings(conn)?;
    let book = load_policy_book(conn)?;
    build_pauta(&snapshot, &settings, &book, chrono::Utc::now().to_rfc3339())
}

/// Pure part of `compute_pauta`: everything after the snapshot is loaded.
pub fn build_pauta(
    snapshot: &ClassSnapshot,
    settings: &CalculationSettings,
    book: &PolicyBook,
    generated_at: String,
) -> Result<PautaModel, CalcError> {
    let class = &snapshot.class;
    let policy = book.select(class.education_level.as_deref(), class.grade_level.as_deref());
    let mandatory = effective_mandatory(&snapshot.disciplines, &snapshot.mandatory_ids);
    let empty: Vec<ComponentRow> = Vec::new();

    let mut issues: Vec<PautaIssue> = Vec::new();
    let mut plans = Vec::with_capacity(snapshot.disciplines.len());
    let mut columns: Vec<DisciplineColumn> = Vec::with_capacity(snapshot.disciplines.len());
    for d in &snapshot.disciplines {
        let rows = snapshot.components.get(&d.id).unwrap_or(&empty);
        let plan = discipline_plan(&d.id, &d.name, rows)?;
        debug!(discipline = %d.name, order = ?plan.order(), "resolution plan built");
        for issue in plan.issues() {
            issues.push(PautaIssue {
                discipline_id: d.id.clone(),
                student_id: None,
                issue: IssueDetail::Plan(issue.clone()),
            });
        }
        let finals = final_candidates(rows, &settings.final_codes);
        if finals.is_empty() && !rows.is_empty() {
            warn!(discipline = %d.name, "no final component configured");
        }
        columns.push(DisciplineColumn {
            id: d.id.clone(),
            name: d.name.clone(),
            sort_order: d.sort_order,
            mandatory: mandatory.contains(&d.id),
            components: rows
                .iter()
                .map(|c| ComponentColumn {
                    id: c.def.id.clone(),
                    code: c.def.code.clone(),
                    name: c.def.name.clone(),
                    weight: c.def.weight,
                    trimester: c.def.trimester,
                    is_calculated: c.def.is_calculated,
                    scope: c.def.scope,
                })
                .collect(),
        });
        plans.push((d, rows, plan, finals));
    }

    let no_grades: HashMap<String, f64> = HashMap::new();
    let mut students: Vec<StudentRow> = Vec::with_capacity(snapshot.students.len());
    for s in &snapshot.students {
        let _span = debug_span!("student", student = %s.id).entered();
        let entered = snapshot.grades.get(&s.id).unwrap_or(&no_grades);

        let mut per_discipline: Vec<StudentDisciplineGrades> = Vec::new();
        let mut finals_for_student: Vec<DisciplineGrade> = Vec::new();
        let mut pending: Vec<String> = Vec::new();

        for (d, rows, plan, finals) in &plans {
            let raw: HashMap<String, f64> = rows
                .iter()
                .filter_map(|c| entered.get(&c.def.id).map(|v| (c.def.id.clone(), *v)))
                .collect();
            let resolution = plan.resolve(&raw, settings.missing_value_policy);
            for issue in resolution.issues {
                issues.push(PautaIssue {
                    discipline_id: d.id.clone(),
                    student_id: Some(s.id.clone()),
                    issue: IssueDetail::Resolve(issue),
                });
            }

            let picked = finals
                .iter()
                .find_map(|c| resolution.values.get(&c.def.id).map(|v| (c.def.id.clone(), *v)));
            match &picked {
                Some((_, v)) => finals_for_student.push(DisciplineGrade {
                    discipline_id: d.id.clone(),
                    discipline_name: d.name.clone(),
                    final_grade: *v,
                }),
                None => pending.push(d.name.clone()),
            }

            per_discipline.push(StudentDisciplineGrades {
                discipline_id: d.id.clone(),
                grades: resolution.values.into_iter().collect(),
                final_grade: picked.as_ref().map(|(_, v)| *v),
                final_component_id: picked.map(|(id, _)| id),
            });
        }

        let classification = classify_student(
            &StudentInput {
                grades: finals_for_student,
                pending_disciplines: pending,
                attendance_pct: s.attendance_pct,
            },
            &policy,
            &mandatory,
        );
        debug!(status = classification.status.label(), "classified");

        students.push(StudentRow {
            student_id: s.id.clone(),
            process_no: s.process_no.clone(),
            full_name: s.full_name.clone(),
            gender: s.gender.clone(),
            attendance_pct: s.attendance_pct,
            disciplines: per_discipline,
            classification,
        });
    }

    let statistics = class_statistics(students.iter().map(|r| &r.classification));
    info!(
        class = %class.name,
        students = statistics.total,
        passed = statistics.passed,
        failed = statistics.failed,
        awaiting = statistics.awaiting,
        issues = issues.len(),
        "pauta generated"
    );

    Ok(PautaModel {
        class: class.clone(),
        generated_at,
        settings: settings.clone(),
        policy,
        mandatory_discipline_ids: mandatory.ids().map(|s| s.to_string()).collect(),
        disciplines: columns,
        students,
        statistics,
        issues,
    })
}
