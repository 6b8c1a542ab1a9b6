use std::path::Path;

use flexi_logger::{
    DeferredNow, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle, WriteMode,
};
use log::{LevelFilter, Record};

/// Many short-lived invocations append to the same file, so every line
/// carries the pid of the process that wrote it.
fn format_line(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {:<5} [{}] {}: {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        std::process::id(),
        record.module_path().unwrap_or("<unnamed>"),
        record.args()
    )
}

pub fn setup_logger(
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<LoggerHandle, FlexiLoggerError> {
    let spec = LogSpecification::builder().default(level).build();
    let logger = Logger::with(spec).format(format_line);
    let logger = match log_file {
        Some(path) => logger.log_to_file(FileSpec::try_from(path)?).append(),
        None => logger.log_to_stderr(),
    };
    logger.write_mode(WriteMode::Direct).start()
}
