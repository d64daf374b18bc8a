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

fn error_code(v: &serde_json::Value) -> &str {
    assert_eq!(v["ok"], json!(false), "expected failure: {}", v);
    v["error"]["code"].as_str().unwrap_or("")
}

fn status_of(s: &mut Session, class_id: &str) -> String {
    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    str_field(&pauta["students"][0]["classification"], "status")
}

#[test]
fn setup_sections_have_defaults_and_strict_validation() {
    let mut s = Session::open("pautad-setup-defaults");

    let setup = s.ok("setup.get", json!({}));
    let policy = &setup["classification"]["default"];
    assert_eq!(policy["passThreshold"].as_f64(), Some(10.0));
    assert_eq!(policy["maxConditionalFailures"], 2);
    assert!(policy["minAttendancePct"].is_null());
    assert_eq!(policy["attendanceOutcome"], "fail");
    assert_eq!(setup["calculation"]["finalCodes"], json!(["MFD", "MF"]));
    assert_eq!(setup["calculation"]["missingValuePolicy"], "treatAsZero");

    let bad = [
        json!({ "section": "printer", "patch": {} }),
        json!({ "section": "calculation" }),
        json!({ "section": "calculation", "patch": { "finalCodes": "MF" } }),
        json!({ "section": "classification", "patch": { "default": { "passThreshold": -1 } } }),
        json!({ "section": "classification", "patch": { "default": { "maxConditionalFailures": 1.5 } } }),
        json!({ "section": "classification", "patch": { "strict": true } }),
    ];
    for params in bad {
        let r = s.call("setup.update", params.clone());
        assert_eq!(error_code(&r), "bad_params", "params: {}", params);
    }

    s.ok(
        "setup.update",
        json!({ "section": "classification", "patch": { "default": { "passThreshold": 9.5 } } }),
    );
    let setup = s.ok("setup.get", json!({}));
    assert_eq!(
        setup["classification"]["default"]["passThreshold"].as_f64(),
        Some(9.5)
    );
    assert_eq!(setup["classification"]["default"]["maxConditionalFailures"], 2);

    s.close();
}

#[test]
fn classification_policy_changes_flow_into_the_pauta() {
    let mut s = Session::open("pautad-setup-policy");
    let r = s.ok(
        "classes.create",
        json!({ "name": "12ª A", "educationLevel": "Secundário", "gradeLevel": "12ª Classe" }),
    );
    let class_id = str_field(&r, "classId");
    let ana = s.student(&class_id, "Ana Silva");
    for (name, value) in [
        ("Matemática", 15.0),
        ("Português", 14.0),
        ("História", 9.0),
        ("Geografia", 8.0),
    ] {
        let d = s.discipline(&class_id, name);
        let mf = s.component(json!({ "disciplineId": d, "code": "MF" }));
        s.grade(&ana, &mf, value);
    }

    assert_eq!(status_of(&mut s, &class_id), "Condicional");

    s.ok(
        "setup.update",
        json!({
            "section": "classification",
            "patch": { "byGradeLevel": { "12ª Classe": { "maxConditionalFailures": 1 } } }
        }),
    );
    assert_eq!(status_of(&mut s, &class_id), "Não Transita");

    // Other grade levels are unaffected; dropping the entry restores the default.
    s.ok(
        "setup.update",
        json!({ "section": "classification", "patch": { "byGradeLevel": { "12ª Classe": null } } }),
    );
    assert_eq!(status_of(&mut s, &class_id), "Condicional");

    s.ok(
        "setup.update",
        json!({
            "section": "classification",
            "patch": { "byEducationLevel": { "secundário": { "passThreshold": 8 } } }
        }),
    );
    assert_eq!(status_of(&mut s, &class_id), "Transita");

    s.ok(
        "students.update",
        json!({ "studentId": ana, "patch": { "attendancePct": 60 } }),
    );
    s.ok(
        "setup.update",
        json!({ "section": "classification", "patch": { "default": { "minAttendancePct": 75 } } }),
    );
    assert_eq!(status_of(&mut s, &class_id), "Não Transita");

    s.ok(
        "setup.update",
        json!({
            "section": "classification",
            "patch": { "default": { "attendanceOutcome": "conditional" } }
        }),
    );
    assert_eq!(status_of(&mut s, &class_id), "Condicional");

    s.close();
}

#[test]
fn final_component_preference_is_configurable() {
    let mut s = Session::open("pautad-setup-final-codes");
    let class_id = s.class("10ª A");
    let d = s.discipline(&class_id, "Biologia");
    let mf = s.component(json!({ "disciplineId": d, "code": "MF" }));
    let mfd = s.component(json!({ "disciplineId": d, "code": "MFD" }));
    let ana = s.student(&class_id, "Ana Silva");
    let bruno = s.student(&class_id, "Bruno Costa");
    s.grade(&ana, &mf, 9.0);
    s.grade(&ana, &mfd, 12.0);
    s.grade(&bruno, &mf, 11.0);

    let finals = |pauta: &serde_json::Value, idx: usize| {
        let d = &pauta["students"][idx]["disciplines"][0];
        (
            d["finalGrade"].as_f64(),
            d["finalComponentId"].as_str().map(|v| v.to_string()),
        )
    };

    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    assert_eq!(finals(&pauta, 0), (Some(12.0), Some(mfd.clone())));
    // Without an MFD value the next preference applies.
    assert_eq!(finals(&pauta, 1), (Some(11.0), Some(mf.clone())));

    s.ok(
        "setup.update",
        json!({ "section": "calculation", "patch": { "finalCodes": ["mf"] } }),
    );
    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    assert_eq!(finals(&pauta, 0), (Some(9.0), Some(mf.clone())));

    s.ok(
        "components.update",
        json!({ "componentId": mfd, "patch": { "isFinal": true } }),
    );
    let pauta = s.ok("pauta.generate", json!({ "classId": class_id }));
    assert_eq!(finals(&pauta, 0), (Some(12.0), Some(mfd.clone())));

    s.close();
}

#[test]
fn workspace_is_required() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let r = request(&mut stdin, &mut reader, "1", "setup.get", json!({}));
    assert_eq!(error_code(&r), "no_workspace");
    let r = request(
        &mut stdin,
        &mut reader,
        "2",
        "pauta.generate",
        json!({ "classId": "x" }),
    );
    assert_eq!(error_code(&r), "no_workspace");
    drop(stdin);
    let _ = child.wait();
}
