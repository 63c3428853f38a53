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

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    account_id: &str,
    fingerprint: &str,
) -> serde_json::Value {
    request(
        stdin,
        reader,
        id,
        "session.login",
        json!({ "accountId": account_id, "deviceFingerprint": fingerprint }),
    )
}

#[test]
fn instructor_third_device_rejected_until_logout() {
    let workspace = temp_dir("rollbook-instructor-devices");
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
            "name": "Cap Check",
            "email": "cap@rollbook.test",
            "password": "pw",
            "employeeId": "EMP-CAP",
            "department": "Physics"
        }),
    );
    let instructor_id = instructor["accountId"].as_str().expect("accountId").to_string();

    let first = login(&mut stdin, &mut reader, "3", &instructor_id, "laptop");
    assert_eq!(first.pointer("/result/trackedDevice"), Some(&json!(true)));
    assert_eq!(first.pointer("/result/activeDevices"), Some(&json!(1)));
    assert_eq!(first.pointer("/result/role"), Some(&json!("instructor")));

    let second = login(&mut stdin, &mut reader, "4", &instructor_id, "phone");
    assert_eq!(second.pointer("/result/activeDevices"), Some(&json!(2)));

    let third = login(&mut stdin, &mut reader, "5", &instructor_id, "tablet");
    assert_eq!(
        third.pointer("/error/code").and_then(|v| v.as_str()),
        Some("device_limit_exceeded")
    );
    assert_eq!(third.pointer("/error/details/limit"), Some(&json!(2)));
    assert_eq!(third.pointer("/error/details/activeDevices"), Some(&json!(2)));

    // A known device re-admits at the cap without growing the list.
    let again = login(&mut stdin, &mut reader, "6", &instructor_id, "laptop");
    assert_eq!(again.pointer("/result/trackedDevice"), Some(&json!(true)));
    assert_eq!(again.pointer("/result/activeDevices"), Some(&json!(2)));

    let logout = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "session.logout",
        json!({ "accountId": instructor_id, "deviceFingerprint": "phone" }),
    );
    assert_eq!(logout["removed"], json!(true));

    let freed = login(&mut stdin, &mut reader, "8", &instructor_id, "tablet");
    assert_eq!(freed.pointer("/result/activeDevices"), Some(&json!(2)));

    let devices = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "session.devices",
        json!({ "accountId": instructor_id }),
    );
    let fingerprints: Vec<&str> = devices["devices"]
        .as_array()
        .expect("devices array")
        .iter()
        .filter_map(|d| d["fingerprint"].as_str())
        .collect();
    assert_eq!(fingerprints, vec!["laptop", "tablet"]);
}

#[test]
fn free_student_limited_to_one_device() {
    let workspace = temp_dir("rollbook-student-devices");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.register",
        json!({
            "name": "Free Tier",
            "email": "free@rollbook.test",
            "password": "pw",
            "registrationNo": "REG-FREE",
            "batchYear": 2024
        }),
    );
    let student_id = student["accountId"].as_str().expect("accountId").to_string();

    let first = login(&mut stdin, &mut reader, "3", &student_id, "home-pc");
    assert_eq!(first.pointer("/result/trackedDevice"), Some(&json!(true)));
    assert_eq!(first.pointer("/result/activeDevices"), Some(&json!(1)));

    let second = login(&mut stdin, &mut reader, "4", &student_id, "library-pc");
    assert_eq!(
        second.pointer("/error/code").and_then(|v| v.as_str()),
        Some("device_limit_exceeded")
    );
    assert_eq!(second.pointer("/error/details/limit"), Some(&json!(1)));

    let devices = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "session.devices",
        json!({ "accountId": student_id }),
    );
    assert_eq!(devices["devices"].as_array().map(|a| a.len()), Some(1));
    assert!(
        devices["lastLogin"].as_str().is_some(),
        "expected lastLogin after an admitted login"
    );
}

#[test]
fn subscription_lifts_student_limit_but_keeps_tracking() {
    let workspace = temp_dir("rollbook-subscribed-devices");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.register",
        json!({
            "name": "Paid Tier",
            "email": "paid@rollbook.test",
            "password": "pw",
            "registrationNo": "REG-PAID",
            "batchYear": 2024
        }),
    );
    let student_id = student["accountId"].as_str().expect("accountId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.setSubscription",
        json!({ "studentId": student_id, "active": true, "plan": "annual", "start": "2026-01-01", "end": "2026-12-31" }),
    );

    for (i, fp) in ["phone", "laptop", "tablet"].iter().enumerate() {
        let admitted = login(
            &mut stdin,
            &mut reader,
            &format!("login-{}", i),
            &student_id,
            fp,
        );
        assert_eq!(
            admitted.pointer("/result/trackedDevice"),
            Some(&json!(true)),
            "subscribed logins still append to the device list"
        );
        assert_eq!(
            admitted.pointer("/result/activeDevices"),
            Some(&json!(i as i64 + 1))
        );
    }

    let devices = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "session.devices",
        json!({ "accountId": student_id }),
    );
    let positions: Vec<i64> = devices["devices"]
        .as_array()
        .expect("devices array")
        .iter()
        .filter_map(|d| d["position"].as_i64())
        .collect();
    assert_eq!(positions, vec![0, 1, 2]);

    // After the subscription lapses, the accumulated list keeps admitting
    // known devices while new ones bounce off the free limit.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.setSubscription",
        json!({ "studentId": student_id, "active": false }),
    );
    let known = login(&mut stdin, &mut reader, "6", &student_id, "laptop");
    assert_eq!(known.pointer("/result/trackedDevice"), Some(&json!(true)));
    assert_eq!(known.pointer("/result/activeDevices"), Some(&json!(3)));
    let unknown = login(&mut stdin, &mut reader, "7", &student_id, "cafe-pc");
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("device_limit_exceeded")
    );
    assert_eq!(unknown.pointer("/error/details/activeDevices"), Some(&json!(3)));
}

#[test]
fn admin_logins_are_never_tracked() {
    let workspace = temp_dir("rollbook-admin-devices");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "admins.register",
        json!({ "name": "Root", "email": "root@rollbook.test", "password": "pw" }),
    );
    let admin_id = admin["accountId"].as_str().expect("accountId").to_string();

    for (i, fp) in ["desk", "ops-laptop", "loaner", "kiosk"].iter().enumerate() {
        let admitted = login(
            &mut stdin,
            &mut reader,
            &format!("login-{}", i),
            &admin_id,
            fp,
        );
        assert_eq!(admitted.pointer("/result/role"), Some(&json!("admin")));
        assert_eq!(admitted.pointer("/result/trackedDevice"), Some(&json!(false)));
        assert_eq!(admitted.pointer("/result/activeDevices"), Some(&json!(0)));
    }

    let devices = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.devices",
        json!({ "accountId": admin_id }),
    );
    assert_eq!(devices["devices"].as_array().map(|a| a.len()), Some(0));
    assert!(devices["lastLogin"].as_str().is_some());

    let logout = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "session.logout",
        json!({ "accountId": admin_id, "deviceFingerprint": "desk" }),
    );
    assert_eq!(logout["removed"], json!(false));
}

#[test]
fn login_validates_account_and_fingerprint() {
    let workspace = temp_dir("rollbook-login-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let missing = login(&mut stdin, &mut reader, "2", "no-such-account", "fp");
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.register",
        json!({
            "name": "Validation",
            "email": "validation@rollbook.test",
            "password": "pw",
            "registrationNo": "REG-VAL",
            "batchYear": 2024
        }),
    );
    let student_id = student["accountId"].as_str().expect("accountId").to_string();

    let blank = login(&mut stdin, &mut reader, "4", &student_id, "   ");
    assert_eq!(
        blank.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
    let oversized = login(&mut stdin, &mut reader, "5", &student_id, &"x".repeat(257));
    assert_eq!(
        oversized.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
}
