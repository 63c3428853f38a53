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
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
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

fn drain_event(reader: &mut BufReader<ChildStdout>) {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read event line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse event json");
    assert!(value.get("event").is_some(), "expected event line, got {}", value);
}

fn seed_subject_with_students(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_regs: &[&str],
) -> (String, Vec<String>, String) {
    let instructor = request_ok(
        stdin,
        reader,
        "seed-1",
        "instructors.register",
        json!({
            "name": "Stats Instructor",
            "email": "stats@rollbook.test",
            "password": "pw",
            "employeeId": "EMP-STATS",
            "department": "Statistics"
        }),
    );
    let instructor_id = instructor["accountId"].as_str().expect("accountId").to_string();

    let mut student_ids = Vec::new();
    for (i, reg) in student_regs.iter().enumerate() {
        let student = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.register",
            json!({
                "name": format!("Student {}", reg),
                "email": format!("{}@rollbook.test", reg.to_lowercase()),
                "password": "pw",
                "registrationNo": reg,
                "batchYear": 2024
            }),
        );
        student_ids.push(student["accountId"].as_str().expect("accountId").to_string());
    }

    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "code": "ST310", "name": "Applied Statistics", "batchYears": [2024] }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-grant",
        "subjects.assignFaculty",
        json!({ "subjectId": subject_id, "instructorId": instructor_id, "batchYear": 2024 }),
    );
    (instructor_id, student_ids, subject_id)
}

#[test]
fn marking_history_feeds_cached_aggregates() {
    let workspace = temp_dir("rollbook-stats-history");
    let today = chrono::Local::now().date_naive();
    let yesterday = today.pred_opt().expect("yesterday");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (instructor_id, students, subject_id) =
        seed_subject_with_students(&mut stdin, &mut reader, &["REG-A", "REG-B"]);

    let cold = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2024 }),
    );
    assert_eq!(cold["totalClasses"], json!(0));
    assert_eq!(cold["averageAttendance"].as_f64(), Some(0.0));
    assert!(cold["lastUpdated"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "instructorId": instructor_id,
            "subjectId": subject_id,
            "batchYear": 2024,
            "date": yesterday.to_string(),
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "absent" }
            ]
        }),
    );
    drain_event(&mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({
            "instructorId": instructor_id,
            "subjectId": subject_id,
            "batchYear": 2024,
            "date": today.to_string(),
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "present" }
            ]
        }),
    );
    drain_event(&mut reader);

    let warm = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2024 }),
    );
    assert_eq!(warm["totalClasses"], json!(2));
    let avg = warm["averageAttendance"].as_f64().expect("average");
    assert!((avg - 75.0).abs() < 1e-9, "3 of 4 present: {}", avg);

    // Recomputing from scratch lands on the same numbers.
    let recomputed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "stats.recompute",
        json!({ "subjectId": subject_id, "batchYear": 2024 }),
    );
    assert_eq!(recomputed["totalClasses"], json!(2));
    let avg = recomputed["averageAttendance"].as_f64().expect("average");
    assert!((avg - 75.0).abs() < 1e-9);
    assert_eq!(recomputed["studentsRefreshed"], json!(2));

    let rollup = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "stats.student",
        json!({ "studentId": students[1] }),
    );
    let overall = rollup["overallPercentage"].as_f64().expect("overall");
    assert!((overall - 50.0).abs() < 1e-9);
    let subjects = rollup["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["presentCount"], json!(1));
    assert_eq!(subjects[0]["entryCount"], json!(2));
    let pct = subjects[0]["percentage"].as_f64().expect("percentage");
    assert!((pct - 50.0).abs() < 1e-9);
    assert!(rollup["analyticsUpdatedAt"].as_str().is_some());
}

#[test]
fn uneven_histories_use_max_entry_count_as_denominator() {
    let workspace = temp_dir("rollbook-stats-uneven");
    let today = chrono::Local::now().date_naive();
    let yesterday = today.pred_opt().expect("yesterday");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (instructor_id, students, subject_id) =
        seed_subject_with_students(&mut stdin, &mut reader, &["REG-A", "REG-B"]);

    // Yesterday only the first student got a record at all.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "instructorId": instructor_id,
            "subjectId": subject_id,
            "batchYear": 2024,
            "date": yesterday.to_string(),
            "entries": [{ "studentId": students[0], "status": "present" }]
        }),
    );
    drain_event(&mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "instructorId": instructor_id,
            "subjectId": subject_id,
            "batchYear": 2024,
            "date": today.to_string(),
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "present" }
            ]
        }),
    );
    drain_event(&mut reader);

    // Class count comes from the longest history, so the short-history
    // student dilutes the subject average but not their own rollup.
    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2024 }),
    );
    assert_eq!(stats["totalClasses"], json!(2));
    let avg = stats["averageAttendance"].as_f64().expect("average");
    assert!((avg - 75.0).abs() < 1e-9, "3 present over 2x2 slots: {}", avg);

    let rollup = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "stats.student",
        json!({ "studentId": students[1] }),
    );
    let overall = rollup["overallPercentage"].as_f64().expect("overall");
    assert!((overall - 100.0).abs() < 1e-9, "own-entry denominator: {}", overall);
    let subjects = rollup["subjects"].as_array().expect("subjects");
    assert_eq!(subjects[0]["entryCount"], json!(1));
}

#[test]
fn empty_batch_recompute_and_read_guards() {
    let workspace = temp_dir("rollbook-stats-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "instructors.register",
        json!({
            "name": "Empty Batch",
            "email": "empty@rollbook.test",
            "password": "pw",
            "employeeId": "EMP-EMPTY",
            "department": "Statistics"
        }),
    );
    let instructor_id = instructor["accountId"].as_str().expect("accountId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "code": "ST900", "name": "Future Cohort Seminar", "batchYears": [2030] }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let recomputed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "stats.recompute",
        json!({ "subjectId": subject_id, "batchYear": 2030 }),
    );
    assert_eq!(recomputed["totalClasses"], json!(0));
    assert_eq!(recomputed["averageAttendance"].as_f64(), Some(0.0));
    assert_eq!(recomputed["studentsRefreshed"], json!(0));

    let cached = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2030 }),
    );
    assert_eq!(cached["totalClasses"], json!(0));
    assert!(cached["lastUpdated"].as_str().is_some(), "recompute stamps the row");

    let missing = request(
        &mut stdin,
        &mut reader,
        "6",
        "stats.recompute",
        json!({ "subjectId": "no-such-subject", "batchYear": 2030 }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    // The cached read is open unless an instructor actor is named; then the
    // grant check applies.
    let ungranted = request(
        &mut stdin,
        &mut reader,
        "7",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2030, "instructorId": instructor_id }),
    );
    assert_eq!(
        ungranted.pointer("/error/code").and_then(|v| v.as_str()),
        Some("authorization_denied")
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.assignFaculty",
        json!({ "subjectId": subject_id, "instructorId": instructor_id, "batchYear": 2030 }),
    );
    let granted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "stats.subject",
        json!({ "subjectId": subject_id, "batchYear": 2030, "instructorId": instructor_id }),
    );
    assert_eq!(granted["totalClasses"], json!(0));
}
