use crate::authz;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    let exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get::<_, i64>(0)
        })
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
            message: "subject not found".to_string(),
            details: None,
        });
    }
    Ok(())
}

fn stats_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let batch_year = get_required_year(params, "batchYear")?;
    require_subject(conn, &subject_id)?;

    // Instructor-scoped reads check the grant; operator reads omit the
    // instructorId and go straight through.
    if let Some(instructor_id) = params.get("instructorId").and_then(|v| v.as_str()) {
        let instructor_exists = conn
            .query_row(
                "SELECT 1 FROM instructors WHERE account_id = ?",
                [instructor_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !instructor_exists {
            return Err(HandlerErr {
                code: "not_found",
                message: "instructor not found".to_string(),
                details: None,
            });
        }
        let granted = authz::can_mark(conn, instructor_id, &subject_id, batch_year).map_err(
            |e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            },
        )?;
        if !granted {
            return Err(HandlerErr {
                code: "authorization_denied",
                message: "instructor is not assigned to this subject and batch year".to_string(),
                details: Some(json!({ "subjectId": subject_id, "batchYear": batch_year })),
            });
        }
    }

    let cached: Option<(i64, f64, String)> = conn
        .query_row(
            "SELECT total_classes, average_attendance, last_updated
             FROM subject_stats
             WHERE subject_id = ? AND batch_year = ?",
            (&subject_id, batch_year),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let (total_classes, average_attendance, last_updated) = match cached {
        Some((t, a, u)) => (t, a, Some(u)),
        None => (0, 0.0, None),
    };
    Ok(json!({
        "subjectId": subject_id,
        "batchYear": batch_year,
        "totalClasses": total_classes,
        "averageAttendance": average_attendance,
        "lastUpdated": last_updated
    }))
}

fn stats_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student: Option<(f64, Option<String>)> = conn
        .query_row(
            "SELECT overall_percentage, analytics_updated_at
             FROM students WHERE account_id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((overall, updated_at)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    let mut stmt = conn
        .prepare(
            "SELECT ss.subject_id, sub.code, ss.present_count, ss.entry_count, ss.percentage
             FROM student_subject_stats ss
             JOIN subjects sub ON sub.id = ss.subject_id
             WHERE ss.student_id = ?
             ORDER BY sub.code",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let subjects: Vec<serde_json::Value> = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
                "presentCount": r.get::<_, i64>(2)?,
                "entryCount": r.get::<_, i64>(3)?,
                "percentage": r.get::<_, f64>(4)?
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
        "overallPercentage": overall,
        "analyticsUpdatedAt": updated_at,
        "subjects": subjects
    }))
}

fn stats_recompute(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let batch_year = get_required_year(params, "batchYear")?;
    require_subject(conn, &subject_id)?;

    let recomputed =
        stats::recompute_subject_stats(conn, &subject_id, batch_year).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subject_stats" })),
        })?;
    let students = stats::batch_student_ids(conn, batch_year).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    for student_id in &students {
        stats::refresh_student_rollup(conn, student_id).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "student_subject_stats" })),
        })?;
    }
    Ok(json!({
        "subjectId": subject_id,
        "batchYear": batch_year,
        "totalClasses": recomputed.total_classes,
        "averageAttendance": recomputed.average_attendance,
        "studentsRefreshed": students.len()
    }))
}

fn handle_stats_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_subject(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_stats_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_stats_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match stats_recompute(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.subject" => Some(handle_stats_subject(state, req)),
        "stats.student" => Some(handle_stats_student(state, req)),
        "stats.recompute" => Some(handle_stats_recompute(state, req)),
        _ => None,
    }
}
