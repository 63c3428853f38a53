use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Fire-and-forget broadcast queued by a handler after a fully applied write.
/// The main loop drains the queue onto stdout after the response line; a
/// notification that fails to write is dropped, never the write it announces.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: &'static str,
    pub payload: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub events: Vec<Notification>,
}
