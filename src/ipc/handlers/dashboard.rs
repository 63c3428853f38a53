use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_announcements_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(admin_id) = req
        .params
        .get("adminId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing adminId", None);
    };
    let Some(title) = req
        .params
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing title", None);
    };
    let Some(body) = req.params.get("body").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing body", None);
    };

    let role: Option<String> = match conn
        .query_row("SELECT role FROM accounts WHERE id = ?", [admin_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role) = role else {
        return err(&req.id, "not_found", "account not found", None);
    };
    if role != "admin" {
        return err(
            &req.id,
            "authorization_denied",
            "only administrators can publish announcements",
            None,
        );
    }

    let announcement_id = Uuid::new_v4().to_string();
    let created_at = db::now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO announcements(id, admin_id, title, body, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&announcement_id, admin_id, title, body, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }
    ok(
        &req.id,
        json!({ "announcementId": announcement_id, "createdAt": created_at }),
    )
}

fn handle_dashboard_content(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // First registered admin fronts the dashboard greeting.
    let admin: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, name FROM accounts WHERE role = 'admin' ORDER BY rowid LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, admin_id, title, body, created_at
         FROM announcements
         ORDER BY created_at DESC, rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let announcements: Vec<serde_json::Value> = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "adminId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let admin_json = admin
        .map(|(id, name)| json!({ "adminId": id, "name": name }))
        .unwrap_or(serde_json::Value::Null);
    ok(
        &req.id,
        json!({ "admin": admin_json, "announcements": announcements }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.publish" => Some(handle_announcements_publish(state, req)),
        "dashboard.content" => Some(handle_dashboard_content(state, req)),
        _ => None,
    }
}
