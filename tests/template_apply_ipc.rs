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
    let exe = env!("CARGO_BIN_EXE_examd");
    let mut child = Command::new(exe)
        .env_remove("EXAMD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examd");
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

fn id_of(v: &serde_json::Value, field: &str) -> i64 {
    v.get(field)
        .and_then(|o| o.get("id"))
        .and_then(|id| id.as_i64())
        .unwrap_or_else(|| panic!("missing {}.id in {}", field, v))
}

#[test]
fn apply_creates_rows_once_per_student_and_column() {
    let workspace = temp_dir("examd-apply");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (si, rd) = (&mut stdin, &mut reader);

    let _ = request_ok(si, rd, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let class = request_ok(si, rd, "2", "classes.create", json!({ "name": "9A", "teacherId": 1, "gradeLevel": 9 }));
    let class_id = id_of(&class, "class");
    for i in 0..9 {
        let _ = request_ok(
            si,
            rd,
            &format!("s{}", i),
            "students.create",
            json!({ "classId": class_id, "name": format!("Student {}", i + 1) }),
        );
    }
    let math = id_of(&request_ok(si, rd, "3", "subjects.create", json!({ "name": "Math" })), "subject");
    let khmer = id_of(&request_ok(si, rd, "4", "subjects.create", json!({ "name": "Khmer" })), "subject");
    let reading = id_of(
        &request_ok(si, rd, "5", "subSubjects.create", json!({ "subjectId": khmer, "name": "Reading" })),
        "subSubject",
    );
    let writing = id_of(
        &request_ok(si, rd, "6", "subSubjects.create", json!({ "subjectId": khmer, "name": "Writing" })),
        "subSubject",
    );

    let created = request_ok(
        si,
        rd,
        "7",
        "templates.create",
        json!({
            "name": "Monthly exam",
            "teacherId": 1,
            "gradeLevel": 9,
            "items": [
                { "subjectId": math },
                { "subjectId": khmer, "subSubjectId": reading },
                { "subjectId": khmer, "subSubjectId": writing }
            ]
        }),
    );
    let template = created.get("template").cloned().expect("template");
    let template_id = template.get("id").and_then(|v| v.as_i64()).expect("template id");
    let subjects = template.get("subjects").and_then(|v| v.as_array()).expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[1].get("order").and_then(|v| v.as_u64()), Some(1));
    let subs = subjects[1].get("subSubjects").and_then(|v| v.as_array()).expect("subs");
    assert_eq!(subs[1].get("subSubjectId").and_then(|v| v.as_i64()), Some(writing));
    assert_eq!(subs[1].get("order").and_then(|v| v.as_u64()), Some(1));

    let apply = json!({ "templateId": template_id, "classId": class_id, "month": 3, "year": 2025 });
    let first = request_ok(si, rd, "8", "templates.apply", apply.clone());
    assert_eq!(first, json!({ "created": 27, "skipped": 0 }));
    let second = request_ok(si, rd, "9", "templates.apply", apply);
    assert_eq!(second, json!({ "created": 0, "skipped": 27 }));

    let scores = request_ok(
        si,
        rd,
        "10",
        "scores.get",
        json!({ "classId": class_id, "month": 3, "year": 2025 }),
    );
    let rows = scores.get("scores").and_then(|v| v.as_array()).expect("scores");
    assert_eq!(rows.len(), 27);
    assert!(rows.iter().all(|r| r.get("score") == Some(&serde_json::Value::Null)));

    let by_template = request_ok(
        si,
        rd,
        "11",
        "scores.get",
        json!({ "classId": class_id, "month": 3, "year": 2025, "templateId": template_id, "subjectId": math }),
    );
    assert_eq!(
        by_template.get("scores").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(9)
    );
}

#[test]
fn update_replaces_items_and_ignores_grade_level() {
    let workspace = temp_dir("examd-template-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (si, rd) = (&mut stdin, &mut reader);

    let _ = request_ok(si, rd, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let a = id_of(&request_ok(si, rd, "2", "subjects.create", json!({ "name": "A" })), "subject");
    let b = id_of(&request_ok(si, rd, "3", "subjects.create", json!({ "name": "B" })), "subject");

    let created = request_ok(
        si,
        rd,
        "4",
        "templates.create",
        json!({
            "name": "T",
            "teacherId": 2,
            "gradeLevel": 7,
            "items": [{ "subjectId": a }, { "subjectId": b }]
        }),
    );
    let id = id_of(&created, "template");

    let updated = request_ok(
        si,
        rd,
        "5",
        "templates.update",
        json!({
            "id": id,
            "gradeLevel": 12,
            "isActive": false,
            "items": [{ "subjectId": b }, { "subjectId": a }]
        }),
    );
    let t = updated.get("template").cloned().expect("template");
    assert_eq!(t.get("gradeLevel").and_then(|v| v.as_i64()), Some(7));
    assert_eq!(t.get("isActive").and_then(|v| v.as_bool()), Some(false));
    let first = &t.get("subjects").and_then(|v| v.as_array()).expect("subjects")[0];
    assert_eq!(first.get("subjectId").and_then(|v| v.as_i64()), Some(b));
    assert_eq!(first.get("order").and_then(|v| v.as_u64()), Some(0));

    let active = request_ok(si, rd, "6", "templates.list", json!({ "teacherId": 2, "isActive": true }));
    assert_eq!(
        active.get("templates").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let dup = request(
        si,
        rd,
        "7",
        "templates.update",
        json!({ "id": id, "items": [{ "subjectId": a }, { "subjectId": a }] }),
    );
    assert_eq!(dup.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        dup.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let _ = request_ok(si, rd, "8", "templates.delete", json!({ "id": id }));
    let gone = request(si, rd, "9", "templates.delete", json!({ "id": id }));
    assert_eq!(
        gone.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("not_found")
    );
}

#[test]
fn bulk_update_reports_not_found_and_rejects_bad_scores() {
    let workspace = temp_dir("examd-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (si, rd) = (&mut stdin, &mut reader);

    let _ = request_ok(si, rd, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let class_id = id_of(
        &request_ok(si, rd, "2", "classes.create", json!({ "name": "7B", "teacherId": 1 })),
        "class",
    );
    let _ = request_ok(si, rd, "3", "students.create", json!({ "classId": class_id, "name": "Dara" }));
    let math = id_of(&request_ok(si, rd, "4", "subjects.create", json!({ "name": "Math" })), "subject");
    let template_id = id_of(
        &request_ok(
            si,
            rd,
            "5",
            "templates.create",
            json!({ "name": "T", "teacherId": 1, "items": [{ "subjectId": math }] }),
        ),
        "template",
    );
    let _ = request_ok(
        si,
        rd,
        "6",
        "templates.apply",
        json!({ "templateId": template_id, "classId": class_id, "month": 1, "year": 2025 }),
    );
    let scores = request_ok(si, rd, "7", "scores.get", json!({ "classId": class_id, "month": 1, "year": 2025 }));
    let row_id = scores["scores"][0]["id"].as_i64().expect("row id");

    let outcome = request_ok(
        si,
        rd,
        "8",
        "scores.bulkUpdate",
        json!({ "updates": [{ "id": row_id, "score": 9.75 }, { "id": 424242, "score": null }] }),
    );
    assert_eq!(outcome, json!({ "updated": 1, "notFound": [424242] }));

    let rejected = request(
        si,
        rd,
        "9",
        "scores.bulkUpdate",
        json!({ "updates": [{ "id": row_id, "score": 10.5 }] }),
    );
    assert_eq!(
        rejected.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    let after = request_ok(si, rd, "10", "scores.get", json!({ "classId": class_id, "month": 1, "year": 2025 }));
    assert_eq!(after["scores"][0]["score"].as_f64(), Some(9.75));
}
