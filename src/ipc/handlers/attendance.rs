use crate::authz;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Notification, Request};
use crate::stats;
use chrono::{Local, NaiveDate};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUS_PRESENT: &str = "present";
const STATUS_ABSENT: &str = "absent";
const STATUS_LEAVE: &str = "leave";

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

struct MarkEntry {
    student_id: String,
    status: String,
}

/// Ledger row as written, carrying the reference each downstream student
/// record is keyed by.
struct LedgerEntry {
    student_id: String,
    status: String,
    entry_ref: String,
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

fn validate_status(status: &str) -> Result<(), HandlerErr> {
    match status {
        STATUS_PRESENT | STATUS_ABSENT | STATUS_LEAVE => Ok(()),
        _ => Err(HandlerErr {
            code: "bad_params",
            message: "status must be present, absent or leave".to_string(),
            details: None,
        }),
    }
}

fn parse_marked_on(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, "date")?;
    let parsed = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: None,
    })?;
    if parsed > Local::now().date_naive() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date is in the future".to_string(),
            details: None,
        });
    }
    Ok(parsed.format("%Y-%m-%d").to_string())
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<MarkEntry>, HandlerErr> {
    let Some(raw) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };
    if raw.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "entries must not be empty".to_string(),
            details: None,
        });
    }
    let mut entries: Vec<MarkEntry> = Vec::with_capacity(raw.len());
    for item in raw {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "entry missing studentId".to_string(),
                details: None,
            })?;
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "entry missing status".to_string(),
                details: None,
            })?;
        validate_status(&status)?;
        if entries.iter().any(|e| e.student_id == student_id) {
            return Err(HandlerErr {
                code: "bad_params",
                message: "duplicate studentId in entries".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        entries.push(MarkEntry { student_id, status });
    }
    Ok(entries)
}

fn instructor_exists(conn: &Connection, instructor_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM instructors WHERE account_id = ?",
        [instructor_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
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

fn check_marking_grant(
    conn: &Connection,
    instructor_id: &str,
    subject_id: &str,
    batch_year: i64,
) -> Result<(), HandlerErr> {
    if !instructor_exists(conn, instructor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "instructor not found".to_string(),
            details: None,
        });
    }
    if !subject_exists(conn, subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }
    let granted =
        authz::can_mark(conn, instructor_id, subject_id, batch_year).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if !granted {
        return Err(HandlerErr {
            code: "authorization_denied",
            message: "instructor is not assigned to this subject and batch year".to_string(),
            details: Some(json!({ "subjectId": subject_id, "batchYear": batch_year })),
        });
    }
    Ok(())
}

fn write_ledger(
    conn: &Connection,
    instructor_id: &str,
    subject_id: &str,
    batch_year: i64,
    marked_on: &str,
    entries: Vec<MarkEntry>,
) -> Result<(String, Vec<LedgerEntry>), HandlerErr> {
    let session_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO marking_sessions(id, instructor_id, subject_id, batch_year, marked_on, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            instructor_id,
            subject_id,
            batch_year,
            marked_on,
            db::now_ts(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "marking_sessions" })),
    })?;
    let mut recorded = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry_ref = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO marking_session_entries(session_id, student_id, status, entry_ref)
             VALUES(?, ?, ?, ?)",
            (&session_id, &entry.student_id, &entry.status, &entry_ref),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "marking_session_entries" })),
        })?;
        recorded.push(LedgerEntry {
            student_id: entry.student_id,
            status: entry.status,
            entry_ref,
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok((session_id, recorded))
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, serde_json::Value), HandlerErr> {
    let instructor_id = get_required_str(params, "instructorId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let batch_year = get_required_year(params, "batchYear")?;
    let entries = parse_entries(params)?;

    check_marking_grant(conn, &instructor_id, &subject_id, batch_year)?;
    let marked_on = parse_marked_on(params)?;

    let existing_session: Option<String> = conn
        .query_row(
            "SELECT id FROM marking_sessions
             WHERE instructor_id = ? AND subject_id = ? AND batch_year = ? AND marked_on = ?",
            (&instructor_id, &subject_id, batch_year, &marked_on),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if let Some(existing) = existing_session {
        return Err(HandlerErr {
            code: "duplicate_marking",
            message: "attendance already marked for this subject, batch year and date".to_string(),
            details: Some(json!({ "existingSessionId": existing })),
        });
    }

    // The ledger commits first and alone. Everything after this point is
    // propagation: each student record is written individually so one bad
    // reference cannot take down the rest.
    let (session_id, recorded) = write_ledger(
        conn,
        &instructor_id,
        &subject_id,
        batch_year,
        &marked_on,
        entries,
    )?;

    let created_at = db::now_ts();
    let mut applied: Vec<&LedgerEntry> = Vec::new();
    let mut failed: Vec<serde_json::Value> = Vec::new();
    for entry in &recorded {
        let res = conn.execute(
            "INSERT INTO attendance_entries(id, student_id, subject_id, marked_on, status, marked_by, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &entry.entry_ref,
                &entry.student_id,
                &subject_id,
                &marked_on,
                &entry.status,
                &instructor_id,
                &created_at,
            ),
        );
        match res {
            Ok(_) => applied.push(entry),
            Err(e) => failed.push(json!({
                "studentId": entry.student_id,
                "error": e.to_string()
            })),
        }
    }

    let mut stats_error: Option<String> = None;
    if let Err(e) = stats::recompute_subject_stats(conn, &subject_id, batch_year) {
        stats_error = Some(e.to_string());
    }
    for entry in &applied {
        if let Err(e) = stats::refresh_student_rollup(conn, &entry.student_id) {
            if stats_error.is_none() {
                stats_error = Some(e.to_string());
            }
        }
    }

    if !failed.is_empty() || stats_error.is_some() {
        warn!(
            "marking session {} propagated incompletely: {} applied, {} failed",
            session_id,
            applied.len(),
            failed.len()
        );
        let applied_json: Vec<serde_json::Value> = applied
            .iter()
            .map(|e| json!({ "studentId": e.student_id, "entryRef": e.entry_ref }))
            .collect();
        let mut details = json!({
            "sessionId": session_id,
            "applied": applied_json,
            "failed": failed
        });
        if let Some(msg) = stats_error {
            details["statsError"] = json!(msg);
        }
        return Err(HandlerErr {
            code: "partial_propagation",
            message: "marking session recorded but not fully propagated".to_string(),
            details: Some(details),
        });
    }

    info!(
        "marked attendance for {} students in subject {} on {}",
        recorded.len(),
        subject_id,
        marked_on
    );
    let entries_json: Vec<serde_json::Value> = recorded
        .iter()
        .map(|e| {
            json!({
                "studentId": e.student_id,
                "status": e.status,
                "entryRef": e.entry_ref
            })
        })
        .collect();
    let result = json!({
        "sessionId": session_id,
        "markedOn": marked_on,
        "entries": entries_json
    });
    let event = json!({
        "sessionId": session_id,
        "subjectId": subject_id,
        "batchYear": batch_year,
        "markedOn": marked_on
    });
    Ok((result, event))
}

fn attendance_edit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, serde_json::Value), HandlerErr> {
    let instructor_id = get_required_str(params, "instructorId")?;
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = get_required_str(params, "status")?;
    validate_status(&status)?;

    // Ownership check by scoping the lookup to the calling instructor.
    let session: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT subject_id, batch_year, marked_on FROM marking_sessions
             WHERE id = ? AND instructor_id = ?",
            (&session_id, &instructor_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((subject_id, batch_year, marked_on)) = session else {
        return Err(HandlerErr {
            code: "not_found",
            message: "marking session not found".to_string(),
            details: None,
        });
    };

    let entry_ref: Option<String> = conn
        .query_row(
            "SELECT entry_ref FROM marking_session_entries
             WHERE session_id = ? AND student_id = ?",
            (&session_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(entry_ref) = entry_ref else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student is not part of this marking session".to_string(),
            details: None,
        });
    };

    // Both sides move inside one transaction. If the student record never
    // landed (a marking that propagated partially), the ledger keeps its
    // original status and the caller gets the mismatch.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "UPDATE marking_session_entries SET status = ?
         WHERE session_id = ? AND student_id = ?",
        (&status, &session_id, &student_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "marking_session_entries" })),
    })?;
    let touched = tx
        .execute(
            "UPDATE attendance_entries SET status = ? WHERE id = ?",
            (&status, &entry_ref),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_entries" })),
        })?;
    if touched == 0 {
        let composite_matches: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM attendance_entries
                 WHERE student_id = ? AND subject_id = ? AND marked_on = ?",
                (&student_id, &subject_id, &marked_on),
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        return Err(HandlerErr {
            code: "ledger_mismatch",
            message: "ledger entry has no matching student record".to_string(),
            details: Some(json!({
                "entryRef": entry_ref,
                "subjectId": subject_id,
                "markedOn": marked_on,
                "compositeMatches": composite_matches
            })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    stats::recompute_subject_stats(conn, &subject_id, batch_year).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subject_stats" })),
    })?;
    stats::refresh_student_rollup(conn, &student_id).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "student_subject_stats" })),
    })?;

    let result = json!({
        "sessionId": session_id,
        "studentId": student_id,
        "status": status,
        "entryRef": entry_ref
    });
    let event = json!({
        "sessionId": session_id,
        "studentId": student_id,
        "status": status,
        "entryRef": entry_ref
    });
    Ok((result, event))
}

fn attendance_by_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instructor_id = get_required_str(params, "instructorId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let batch_year = get_required_year(params, "batchYear")?;
    check_marking_grant(conn, &instructor_id, &subject_id, batch_year)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.account_id, s.registration_no, a.name
             FROM subject_enrollments en
             JOIN students s ON s.account_id = en.student_id
             JOIN accounts a ON a.id = s.account_id
             WHERE en.subject_id = ? AND s.batch_year = ?
             ORDER BY s.registration_no",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let students = stmt
        .query_map((&subject_id, batch_year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut rows = Vec::new();
    for (student_id, registration_no, name) in students {
        let mut entries_stmt = conn
            .prepare(
                "SELECT marked_on, status FROM attendance_entries
                 WHERE student_id = ? AND subject_id = ?
                 ORDER BY marked_on",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let entries: Vec<serde_json::Value> = entries_stmt
            .query_map((&student_id, &subject_id), |r| {
                Ok(json!({
                    "markedOn": r.get::<_, String>(0)?,
                    "status": r.get::<_, String>(1)?
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        rows.push(json!({
            "studentId": student_id,
            "registrationNo": registration_no,
            "name": name,
            "entries": entries
        }));
    }
    Ok(json!({
        "subjectId": subject_id,
        "batchYear": batch_year,
        "students": rows
    }))
}

fn attendance_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student: Option<f64> = conn
        .query_row(
            "SELECT overall_percentage FROM students WHERE account_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(overall) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let mut entries_stmt = conn
        .prepare(
            "SELECT e.subject_id, sub.code, e.marked_on, e.status
             FROM attendance_entries e
             JOIN subjects sub ON sub.id = e.subject_id
             WHERE e.student_id = ?
             ORDER BY e.marked_on, sub.code",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let entries: Vec<serde_json::Value> = entries_stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
                "markedOn": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut subjects_stmt = conn
        .prepare(
            "SELECT subject_id, present_count, entry_count, percentage
             FROM student_subject_stats
             WHERE student_id = ?
             ORDER BY subject_id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let subjects: Vec<serde_json::Value> = subjects_stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "presentCount": r.get::<_, i64>(1)?,
                "entryCount": r.get::<_, i64>(2)?,
                "percentage": r.get::<_, f64>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({
        "studentId": student_id,
        "entries": entries,
        "analytics": {
            "overallPercentage": overall,
            "subjects": subjects
        }
    }))
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_mark(conn, &req.params) {
        Ok((result, event)) => {
            state.events.push(Notification {
                event: "attendance-marked",
                payload: event,
            });
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_edit(conn, &req.params) {
        Ok((result, event)) => {
            state.events.push(Notification {
                event: "attendance-updated",
                payload: event,
            });
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_by_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_by_subject(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_for_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.edit" => Some(handle_attendance_edit(state, req)),
        "attendance.bySubject" => Some(handle_attendance_by_subject(state, req)),
        "attendance.forStudent" => Some(handle_attendance_for_student(state, req)),
        _ => None,
    }
}
