mod admission;
mod authz;
mod db;
mod ipc;
mod logging;
mod stats;

use serde_json::json;
use std::io::{self, BufRead, Write};

fn main() {
    // Handle kept for the life of the process; dropping it shuts the logger down.
    let _logger = logging::init_from_env();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        events: Vec::new(),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply with an id we never parsed; emit an unkeyed error.
                let _ = writeln!(
                    stdout,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        // Event lines trail the response they were raised by, fire-and-forget.
        for note in state.events.drain(..) {
            let line = json!({ "event": note.event, "payload": note.payload });
            let _ = writeln!(stdout, "{}", line);
        }
        let _ = stdout.flush();
    }
}
