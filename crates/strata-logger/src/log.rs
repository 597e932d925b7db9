use crate::severity::LogSeverity;
use crate::systime::now;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};

pub const LEVEL_ENV: &str = "STRATA_LOG";

static MAX_LEVEL: Lazy<AtomicU8> = Lazy::new(|| {
    let level = std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|value| value.parse::<LogSeverity>().ok())
        .unwrap_or(LogSeverity::Info);
    AtomicU8::new(level as u8)
});

/// Lowest severity that is printed.
pub fn max_level() -> LogSeverity {
    LogSeverity::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

pub fn set_max_level(level: LogSeverity) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(log_severity: LogSeverity) -> bool {
    log_severity >= max_level()
}

pub fn log(msg: String, log_severity: LogSeverity) {
    if !enabled(log_severity) {
        return;
    }
    match log_severity {
        LogSeverity::Error | LogSeverity::Fatal => {
            eprintln!("[{}] {} {}", log_severity, now(), msg)
        }
        _ => println!("[{}] {} {}", log_severity, now(), msg),
    }
}
