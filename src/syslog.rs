use log::{Level, Metadata, Record};

/// Messages up to this level are emitted.
pub const LEVEL: Level = Level::Info;

struct SystemLogger;

impl log::Log for SystemLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LEVEL
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // stderr, so log lines never interleave with the shell surface
            eprintln!(
                "{:5} {} - {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SystemLogger = SystemLogger;

pub fn enable() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LEVEL.to_level_filter());
    }
}
