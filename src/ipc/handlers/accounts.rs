use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_year(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let year = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })?;
    if !(1900..=9999).contains(&year) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} out of range", key),
            details: None,
        });
    }
    Ok(year)
}

fn hash_credential(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn email_taken(conn: &Connection, email: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM accounts WHERE email = ?", [email], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn insert_account(
    conn: &Connection,
    name: &str,
    email: &str,
    password: &str,
    role: &str,
) -> Result<String, HandlerErr> {
    let account_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().to_string();
    let hash = hash_credential(&salt, password);
    conn.execute(
        "INSERT INTO accounts(id, name, email, credential_hash, credential_salt, role)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&account_id, name, email, &hash, &salt, role),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "accounts" })),
    })?;
    Ok(account_id)
}

fn admins_register(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    if email_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "email already registered".to_string(),
            details: Some(json!({ "email": email })),
        });
    }
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let account_id = insert_account(&tx, &name, &email, &password, "admin")?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "accountId": account_id }))
}

fn instructors_register(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let employee_id = get_required_str(params, "employeeId")?;
    let department = get_required_str(params, "department")?;
    if email_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "email already registered".to_string(),
            details: Some(json!({ "email": email })),
        });
    }
    let employee_taken = conn
        .query_row(
            "SELECT 1 FROM instructors WHERE employee_id = ?",
            [&employee_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if employee_taken {
        return Err(HandlerErr {
            code: "conflict",
            message: "employee id already registered".to_string(),
            details: Some(json!({ "employeeId": employee_id })),
        });
    }
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let account_id = insert_account(&tx, &name, &email, &password, "instructor")?;
    tx.execute(
        "INSERT INTO instructors(account_id, employee_id, department) VALUES(?, ?, ?)",
        (&account_id, &employee_id, &department),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "instructors" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "accountId": account_id }))
}

fn students_register(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let registration_no = get_required_str(params, "registrationNo")?;
    let batch_year = get_required_year(params, "batchYear")?;
    if email_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "email already registered".to_string(),
            details: Some(json!({ "email": email })),
        });
    }
    let registration_taken = conn
        .query_row(
            "SELECT 1 FROM students WHERE registration_no = ?",
            [&registration_no],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if registration_taken {
        return Err(HandlerErr {
            code: "conflict",
            message: "registration number already registered".to_string(),
            details: Some(json!({ "registrationNo": registration_no })),
        });
    }
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let account_id = insert_account(&tx, &name, &email, &password, "student")?;
    tx.execute(
        "INSERT INTO students(account_id, registration_no, batch_year) VALUES(?, ?, ?)",
        (&account_id, &registration_no, batch_year),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;
    // New students join every subject already offered to their batch year.
    let enrolled = tx
        .execute(
            "INSERT INTO subject_enrollments(subject_id, student_id)
             SELECT subject_id, ? FROM subject_batch_years WHERE batch_year = ?",
            (&account_id, batch_year),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subject_enrollments" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "accountId": account_id, "enrolledSubjects": enrolled }))
}

fn parse_optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be string or null", key),
            details: None,
        });
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    if NaiveDate::parse_from_str(t, "%Y-%m-%d").is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be YYYY-MM-DD", key),
            details: None,
        });
    }
    Ok(Some(t.to_string()))
}

fn students_set_subscription(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing active".to_string(),
            details: None,
        })?;
    let plan = params
        .get("plan")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let start = parse_optional_date(params, "start")?;
    let end = parse_optional_date(params, "end")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE account_id = ?",
            [&student_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    conn.execute(
        "UPDATE students SET
            subscription_active = ?,
            subscription_plan = ?,
            subscription_start = ?,
            subscription_end = ?
         WHERE account_id = ?",
        (active as i64, &plan, &start, &end, &student_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;
    Ok(json!({ "studentId": student_id, "active": active }))
}

fn handle_admins_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match admins_register(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_instructors_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match instructors_register(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_register(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_set_subscription(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_set_subscription(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admins.register" => Some(handle_admins_register(state, req)),
        "instructors.register" => Some(handle_instructors_register(state, req)),
        "students.register" => Some(handle_students_register(state, req)),
        "students.setSubscription" => Some(handle_students_set_subscription(state, req)),
        _ => None,
    }
}
