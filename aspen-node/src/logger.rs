//! A minimal colored logger, used by the standalone binary and by tests.
use std::io::Write as _;
use std::sync::Once;

use colored::*;
use log::{Level, Log, Metadata, Record};

static INIT: Once = Once::new();

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = chrono::Local::now();
        let target = record.target();
        let level = match record.level() {
            Level::Error => "ERROR".red(),
            Level::Warn => "WARN".yellow(),
            Level::Info => "INFO".green(),
            Level::Debug => "DEBUG".blue(),
            Level::Trace => "TRACE".dimmed(),
        };

        let mut stderr = std::io::stderr();
        writeln!(
            stderr,
            "{} {} {} {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
            level,
            target.dimmed(),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {
        std::io::stderr().flush().ok();
    }
}

/// Initialize the global logger at the given level.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init(level: Level) {
    INIT.call_once(|| {
        let logger = Box::new(Logger { level });

        log::set_boxed_logger(logger).ok();
        log::set_max_level(level.to_level_filter());
    });
}
