use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

fn parse_batch_years(params: &serde_json::Value) -> Result<Vec<i64>, HandlerErr> {
    let Some(raw) = params.get("batchYears").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing batchYears".to_string(),
            details: None,
        });
    };
    let mut years = Vec::new();
    for v in raw {
        let year = v.as_i64().ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "batchYears must be an array of years".to_string(),
            details: None,
        })?;
        if !(1900..=9999).contains(&year) {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("batch year {} out of range", year),
                details: None,
            });
        }
        if !years.contains(&year) {
            years.push(year);
        }
    }
    if years.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "batchYears must not be empty".to_string(),
            details: None,
        });
    }
    Ok(years)
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let years = parse_batch_years(params)?;

    let code_taken = conn
        .query_row("SELECT 1 FROM subjects WHERE code = ?", [&code], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if code_taken {
        return Err(HandlerErr {
            code: "conflict",
            message: "subject code already exists".to_string(),
            details: Some(json!({ "code": code })),
        });
    }

    let subject_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;
    let mut enrolled = 0usize;
    for year in &years {
        tx.execute(
            "INSERT INTO subject_batch_years(subject_id, batch_year) VALUES(?, ?)",
            (&subject_id, year),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subject_batch_years" })),
        })?;
        // Every student already registered under this batch year joins the
        // new subject immediately.
        enrolled += tx
            .execute(
                "INSERT OR IGNORE INTO subject_enrollments(subject_id, student_id)
                 SELECT ?, account_id FROM students WHERE batch_year = ?",
                (&subject_id, year),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "subject_enrollments" })),
            })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "subjectId": subject_id, "enrolledStudents": enrolled }))
}

fn subjects_assign_faculty(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let instructor_id = get_required_str(params, "instructorId")?;
    let batch_year = get_required_year(params, "batchYear")?;

    let subject_exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !subject_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }
    let instructor_exists = conn
        .query_row(
            "SELECT 1 FROM instructors WHERE account_id = ?",
            [&instructor_id],
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
    let year_offered = conn
        .query_row(
            "SELECT 1 FROM subject_batch_years WHERE subject_id = ? AND batch_year = ?",
            (&subject_id, batch_year),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !year_offered {
        return Err(HandlerErr {
            code: "bad_params",
            message: "subject is not offered to that batch year".to_string(),
            details: Some(json!({ "subjectId": subject_id, "batchYear": batch_year })),
        });
    }

    let granted = conn
        .execute(
            "INSERT OR IGNORE INTO subject_faculty(subject_id, instructor_id, batch_year)
             VALUES(?, ?, ?)",
            (&subject_id, &instructor_id, batch_year),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subject_faculty" })),
        })?;
    Ok(json!({ "granted": granted > 0 }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, name FROM subjects ORDER BY code")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let subjects = stmt
        .query_map([], |r| {
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

    let mut out = Vec::new();
    for (id, code, name) in subjects {
        let mut years_stmt = conn
            .prepare(
                "SELECT batch_year FROM subject_batch_years WHERE subject_id = ? ORDER BY batch_year",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let years = years_stmt
            .query_map([&id], |r| r.get::<_, i64>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let mut faculty_stmt = conn
            .prepare(
                "SELECT instructor_id, batch_year FROM subject_faculty
                 WHERE subject_id = ?
                 ORDER BY batch_year, instructor_id",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let faculty: Vec<serde_json::Value> = faculty_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "instructorId": r.get::<_, String>(0)?,
                    "batchYear": r.get::<_, i64>(1)?
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let enrolled: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM subject_enrollments WHERE subject_id = ?",
                [&id],
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        out.push(json!({
            "id": id,
            "code": code,
            "name": name,
            "batchYears": years,
            "faculty": faculty,
            "enrolledCount": enrolled
        }));
    }
    Ok(json!({ "subjects": out }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_assign_faculty(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_assign_faculty(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.assignFaculty" => Some(handle_subjects_assign_faculty(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
