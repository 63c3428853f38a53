use flexi_logger::{Logger, LoggerHandle, WriteMode};

/// Starts the stderr logger. Stdout belongs to the wire protocol, so nothing
/// ever logs there. Level comes from `ROLLBOOKD_LOG` (trace|debug|info|warn|
/// error), defaulting to `info`. A logger that fails to start is dropped
/// silently; the daemon must keep serving requests either way.
///
/// The returned handle has to stay alive for the process lifetime.
pub fn init_from_env() -> Option<LoggerHandle> {
    let spec = std::env::var("ROLLBOOKD_LOG").unwrap_or_else(|_| default_level().to_string());
    let logger = match Logger::try_with_str(&spec) {
        Ok(l) => l,
        Err(_) => match Logger::try_with_str(default_level()) {
            Ok(l) => l,
            Err(_) => return None,
        },
    };
    logger
        .log_to_stderr()
        .write_mode(WriteMode::Direct)
        .start()
        .ok()
}

fn default_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}
