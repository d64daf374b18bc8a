use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_pautad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pautad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Session {
    fn open(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Session {
            child,
            stdin,
            reader,
            next_id: 0,
        };
        s.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        s
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn class(&mut self, name: &str) -> String {
        let r = self.ok("classes.create", json!({ "name": name }));
        str_field(&r, "classId")
    }

    fn discipline(&mut self, class_id: &str, name: &str) -> String {
        let r = self.ok(
            "disciplines.create",
            json!({ "classId": class_id, "name": name }),
        );
        str_field(&r, "disciplineId")
    }

    fn component(&mut self, params: serde_json::Value) -> String {
        let r = self.ok("components.create", params);
        str_field(&r, "componentId")
    }

    fn student(&mut self, class_id: &str, name: &str) -> String {
        let r = self.ok(
            "students.create",
            json!({ "classId": class_id, "fullName": name }),
        );
        str_field(&r, "studentId")
    }

    fn grade(&mut self, student_id: &str, component_id: &str, value: f64) {
        self.ok(
            "grades.set",
            json!({ "studentId": student_id, "componentId": component_id, "value": value }),
        );
    }

    fn close(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn row_for<'a>(pauta: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    pauta["students"]
        .as_array()
        .expect("students[]")
        .iter()
        .find(|r| r["studentId"] == student_id)
        .unwrap_or_else(|| panic!("no row for {}", student_id))
}

#[test]
fn trimester_averages_feed_the_annual_final() {
    let mut s = Session::open("pautad-scenario-ab");
    let class_id = s.class("10ª A");
    let mat = s.discipline(&class_id, "Matemática");

    let mut mt_ids = Vec::new();
    for t in 1..=3 {
        let p1 = s.component(json!({ "disciplineId": mat, "code": "P1", "trimester": t }));
        let p2 = s.component(json!({ "disciplineId": mat, "code": "P2", "trimester": t }));
        let pt = s.component(json!({ "disciplineId": mat, "code": "PT", "trimester": t }));
        let mt = s.component(json!({
            "disciplineId": mat,
            "code": format!("MT{}", t),
            "trimester": t,
            "isCalculated": true,
            "formula": "(P1+P2+PT)/3",
            "dependsOn": [p1, p2, pt],
        }));
        mt_ids.push((p1, p2, pt, mt));
    }
    let mfd = s.component(json!({
        "disciplineId": mat,
        "code": "MFD",
        "isCalculated": true,
        "scope": "annual",
        "formula": "(MT1+MT2+MT3)/3",
        "dependsOn": mt_ids.iter().map(|ids| ids.3.clone()).collect::<Vec<_>>(),
    }));

    let ana = s.student(&class_id, "Ana Silva");
    let marks = [(12.0, 14.0, 10.0), (14.0, 14.0, 14.0), (10.0, 10.0, 10.0)];
    for ((p1, p2, pt, _), (a, b, c)) in mt_ids.iter().zip(marks) {
        s.grade(&ana, p1, a);
        s.grade(&ana, p2, b);
        s.grade(&ana, pt, c);
    }

    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    let row = row_for(&pauta, &ana);
    let grades = &row["disciplines"][0]["grades"];
    assert_eq!(grades[&mt_ids[0].3].as_f64(), Some(12.0));
    assert_eq!(grades[&mt_ids[1].3].as_f64(), Some(14.0));
    assert_eq!(grades[&mt_ids[2].3].as_f64(), Some(10.0));
    assert_eq!(grades[&mfd].as_f64(), Some(12.0));
    assert_eq!(row["disciplines"][0]["finalGrade"].as_f64(), Some(12.0));
    assert_eq!(row["disciplines"][0]["finalComponentId"], json!(mfd));
    assert_eq!(row["classification"]["status"], "Transita");
    assert_eq!(pauta["issues"].as_array().map(|v| v.len()), Some(0));

    s.close();
}

#[test]
fn mandatory_failure_dominates_and_students_without_grades_wait() {
    let mut s = Session::open("pautad-scenario-cd");
    let class_id = s.class("11ª B");
    let mut finals = Vec::new();
    for name in ["Matemática", "Português", "História"] {
        let d = s.discipline(&class_id, name);
        finals.push(s.component(json!({ "disciplineId": d, "code": "MF" })));
    }

    let bruno = s.student(&class_id, "Bruno Costa");
    let carla = s.student(&class_id, "Carla Dias");
    let ana = s.student(&class_id, "Ana Silva");
    for (component, value) in finals.iter().zip([8.0, 13.0, 9.0]) {
        s.grade(&bruno, component, value);
    }
    for component in &finals {
        s.grade(&ana, component, 14.0);
    }

    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));

    let b = &row_for(&pauta, &bruno)["classification"];
    assert_eq!(b["status"], "Não Transita");
    assert_eq!(b["atRiskDisciplines"], json!(["Matemática"]));
    assert_eq!(b["failingDisciplines"], json!(["Matemática", "História"]));
    assert_eq!(b["conditionalEnrollment"], json!(false));
    assert_eq!(b["average"].as_f64(), Some(10.0));
    assert!(b["retentionReason"].as_str().unwrap_or("").contains("Matemática"));

    let c = &row_for(&pauta, &carla)["classification"];
    assert_eq!(c["status"], "AguardandoNotas");
    assert!(c["average"].is_null());

    let a = &row_for(&pauta, &ana)["classification"];
    assert_eq!(a["status"], "Transita");

    let stats = &pauta["statistics"];
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["passed"], 1);
    assert_eq!(stats["failed"], 1);
    assert_eq!(stats["awaiting"], 1);
    assert_eq!(stats["average"].as_f64(), Some(12.0));
    assert_eq!(stats["min"].as_f64(), Some(10.0));
    assert_eq!(stats["max"].as_f64(), Some(14.0));
    let counted = stats["passed"].as_u64().unwrap_or(0)
        + stats["failed"].as_u64().unwrap_or(0)
        + stats["awaiting"].as_u64().unwrap_or(0);
    assert_eq!(Some(counted), stats["total"].as_u64());

    // Same inputs, same report.
    let again = s.ok("pauta.generate", json!({ "classId": class_id }));
    assert_eq!(again["students"], pauta["students"]);
    assert_eq!(again["statistics"], pauta["statistics"]);

    s.close();
}

#[test]
fn undeclared_grade_counts_as_zero_and_is_reported() {
    let mut s = Session::open("pautad-scenario-e");
    let class_id = s.class("9ª C");
    let fis = s.discipline(&class_id, "Física");
    let p1 = s.component(json!({ "disciplineId": fis, "code": "P1", "trimester": 1 }));
    let p2 = s.component(json!({ "disciplineId": fis, "code": "P2", "trimester": 1 }));
    let p3 = s.component(json!({ "disciplineId": fis, "code": "P3", "trimester": 1 }));
    let mt = s.component(json!({
        "disciplineId": fis,
        "code": "MT",
        "trimester": 1,
        "isCalculated": true,
        "formula": "MT = (P1 + P2 + P3) / 3",
        "dependsOn": [p1, p2, p3],
    }));

    let rui = s.student(&class_id, "Rui Lopes");
    s.grade(&rui, &p1, 12.0);
    s.grade(&rui, &p2, 15.0);

    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    let row = row_for(&pauta, &rui);
    assert_eq!(row["disciplines"][0]["grades"][&mt].as_f64(), Some(9.0));

    let issues = pauta["issues"].as_array().expect("issues[]");
    let missing = issues
        .iter()
        .find(|i| i["issue"]["kind"] == "missingDependencyValue")
        .expect("missing dependency issue");
    assert_eq!(missing["studentId"], json!(rui));
    assert_eq!(missing["disciplineId"], json!(fis));
    assert_eq!(missing["issue"]["missing"], json!(["P3"]));
    assert_eq!(missing["issue"]["skipped"], json!(false));

    // With the skip policy the component stays unresolved instead.
    s.ok(
        "setup.update",
        json!({ "section": "calculation", "patch": { "missingValuePolicy": "skip" } }),
    );
    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    let row = row_for(&pauta, &rui);
    assert!(row["disciplines"][0]["grades"].get(&mt).is_none());
    let skipped = pauta["issues"]
        .as_array()
        .expect("issues[]")
        .iter()
        .find(|i| i["issue"]["kind"] == "missingDependencyValue")
        .expect("missing dependency issue");
    assert_eq!(skipped["issue"]["skipped"], json!(true));

    s.close();
}

#[test]
fn pauta_student_returns_one_row_and_rejects_unknown_students() {
    let mut s = Session::open("pautad-pauta-student");
    let class_id = s.class("12ª A");
    let d = s.discipline(&class_id, "Química");
    let mf = s.component(json!({ "disciplineId": d, "code": "MF" }));
    let ana = s.student(&class_id, "Ana Silva");
    let _other = s.student(&class_id, "Bruno Costa");
    s.grade(&ana, &mf, 11.5);

    let r = s.ok(
        "pauta.student",
        json!({ "classId": class_id, "studentId": ana }),
    );
    assert_eq!(r["student"]["studentId"], json!(ana));
    assert_eq!(r["student"]["disciplines"][0]["finalGrade"].as_f64(), Some(11.5));
    assert_eq!(r["student"]["classification"]["status"], "Transita");

    let missing = s.call(
        "pauta.student",
        json!({ "classId": class_id, "studentId": "nope" }),
    );
    assert_eq!(missing["ok"], json!(false));
    assert_eq!(missing["error"]["code"], "not_found");

    s.close();
}
