use crate::admission::{self, Admission, Role};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use log::warn;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const MAX_FINGERPRINT_LEN: usize = 256;

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

fn get_fingerprint(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let fingerprint = get_required_str(params, "deviceFingerprint")?;
    if fingerprint.len() > MAX_FINGERPRINT_LEN {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("deviceFingerprint longer than {} bytes", MAX_FINGERPRINT_LEN),
            details: None,
        });
    }
    Ok(fingerprint)
}

fn account_role(conn: &Connection, account_id: &str) -> Result<Role, HandlerErr> {
    let role_tag: Option<String> = conn
        .query_row("SELECT role FROM accounts WHERE id = ?", [account_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(role_tag) = role_tag else {
        return Err(HandlerErr {
            code: "not_found",
            message: "account not found".to_string(),
            details: None,
        });
    };
    Role::parse(&role_tag).ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: format!("account has unrecognized role {}", role_tag),
        details: None,
    })
}

fn subscription_active(conn: &Connection, account_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT subscription_active FROM students WHERE account_id = ?",
        [account_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.unwrap_or(0) != 0)
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn device_known(conn: &Connection, account_id: &str, fingerprint: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM account_devices WHERE account_id = ? AND fingerprint = ?",
        (account_id, fingerprint),
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

fn active_device_count(conn: &Connection, account_id: &str) -> Result<usize, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM account_devices WHERE account_id = ?",
        [account_id],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n as usize)
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn session_login(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let account_id = get_required_str(params, "accountId")?;
    let fingerprint = get_fingerprint(params)?;

    let role = account_role(conn, &account_id)?;
    let subscribed = match role {
        Role::Student => subscription_active(conn, &account_id)?,
        _ => false,
    };
    let known = device_known(conn, &account_id, &fingerprint)?;
    let count = active_device_count(conn, &account_id)?;

    match admission::evaluate(role, known, count, subscribed) {
        Admission::Admit { track_device } => {
            if track_device {
                conn.execute(
                    "INSERT INTO account_devices(account_id, fingerprint, position)
                     VALUES(?, ?, COALESCE(
                        (SELECT MAX(position) + 1 FROM account_devices WHERE account_id = ?), 0))",
                    (&account_id, &fingerprint, &account_id),
                )
                .map_err(|e| HandlerErr {
                    code: "db_insert_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "account_devices" })),
                })?;
            }
            conn.execute(
                "UPDATE accounts SET last_login = ? WHERE id = ?",
                (db::now_ts(), &account_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "accounts" })),
            })?;
            let active = count + usize::from(track_device);
            Ok(json!({
                "role": role.as_str(),
                "trackedDevice": known || track_device,
                "activeDevices": active
            }))
        }
        Admission::Reject { limit } => {
            warn!(
                "login rejected for {} ({}): {} active devices, limit {}",
                account_id,
                role.as_str(),
                count,
                limit
            );
            Err(HandlerErr {
                code: "device_limit_exceeded",
                message: admission::reject_message(role),
                details: Some(json!({ "limit": limit, "activeDevices": count })),
            })
        }
    }
}

fn session_logout(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let account_id = get_required_str(params, "accountId")?;
    let fingerprint = get_fingerprint(params)?;
    // Validates the account even though admins never hold device rows.
    account_role(conn, &account_id)?;
    let removed = conn
        .execute(
            "DELETE FROM account_devices WHERE account_id = ? AND fingerprint = ?",
            (&account_id, &fingerprint),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "account_devices" })),
        })?;
    Ok(json!({ "removed": removed > 0 }))
}

fn session_devices(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let account_id = get_required_str(params, "accountId")?;
    account_role(conn, &account_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT fingerprint, position FROM account_devices
             WHERE account_id = ?
             ORDER BY position",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let devices: Vec<serde_json::Value> = stmt
        .query_map([&account_id], |r| {
            Ok(json!({
                "fingerprint": r.get::<_, String>(0)?,
                "position": r.get::<_, i64>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let last_login: Option<String> = conn
        .query_row(
            "SELECT last_login FROM accounts WHERE id = ?",
            [&account_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "devices": devices, "lastLogin": last_login }))
}

fn handle_session_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_login(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_session_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_logout(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_session_devices(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_devices(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.login" => Some(handle_session_login(state, req)),
        "session.logout" => Some(handle_session_logout(state, req)),
        "session.devices" => Some(handle_session_devices(state, req)),
        _ => None,
    }
}
