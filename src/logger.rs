//! Decoupled service logging.
//!
//! A `crossbeam-channel` unbounded channel feeds a dedicated writer thread
//! that appends to a per-session log file under the state directory, so
//! logging never blocks the orchestrator or a supervision task. WARN and
//! above are mirrored to stderr for the operator.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

enum LogMessage {
    Line(String),
    /// Flush marker carrying a completion signal.
    Flush(std::sync::mpsc::Sender<()>),
}

/// Background writer owning the session log file.
pub struct LogWriter {
    tx: Sender<LogMessage>,
    session_path: PathBuf,
}

impl LogWriter {
    /// Create the session log file and start the writer thread.
    pub fn new(log_dir: &Path) -> Result<LogWriter, String> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| format!("failed to create log dir {}: {e}", log_dir.display()))?;
        let session_path = log_dir.join(format!(
            "diskbench_{}.log",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let (tx, rx) = unbounded::<LogMessage>();
        let file_path = session_path.clone();
        std::thread::spawn(move || {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .ok();
            while let Ok(message) = rx.recv() {
                match message {
                    LogMessage::Line(line) => {
                        if let Some(ref mut file) = file {
                            let _ = writeln!(file, "{line}");
                        }
                    }
                    LogMessage::Flush(ack) => {
                        if let Some(ref mut file) = file {
                            let _ = file.flush();
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        Ok(LogWriter { tx, session_path })
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    fn write_line(&self, line: String) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Block until every queued line is on disk.
    pub fn flush_blocking(&self) {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.tx.send(LogMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(std::time::Duration::from_secs(5));
        }
    }
}

/// `log` facade adapter over the writer.
pub struct ServiceLogger {
    writer: LogWriter,
    max_level: LevelFilter,
}

impl ServiceLogger {
    pub fn new(writer: LogWriter, max_level: LevelFilter) -> Self {
        ServiceLogger { writer, max_level }
    }
}

impl Log for ServiceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] {}: {}",
            Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= log::Level::Warn {
            eprintln!("{line}");
        }
        self.writer.write_line(line);
    }

    fn flush(&self) {
        self.writer.flush_blocking();
    }
}

/// Install the service logger as the global `log` sink.
///
/// Returns the session log path. Safe to call once per process.
pub fn init(log_dir: &Path, max_level: LevelFilter) -> Result<PathBuf, String> {
    let writer = LogWriter::new(log_dir)?;
    let session_path = writer.session_path().to_path_buf();
    let logger = ServiceLogger::new(writer, max_level);
    log::set_boxed_logger(Box::new(logger)).map_err(|e| e.to_string())?;
    log::set_max_level(max_level);
    Ok(session_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_persists_lines() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        writer.write_line("first line".to_string());
        writer.write_line("second line".to_string());
        writer.flush_blocking();

        let contents = std::fs::read_to_string(writer.session_path()).unwrap();
        assert!(contents.contains("first line"));
        assert!(contents.contains("second line"));
    }

    #[test]
    fn test_logger_respects_level() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let logger = ServiceLogger::new(writer, LevelFilter::Info);

        assert!(logger.enabled(&Metadata::builder().level(log::Level::Info).build()));
        assert!(!logger.enabled(&Metadata::builder().level(log::Level::Trace).build()));
    }

    #[test]
    fn test_logger_formats_records() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let path = writer.session_path().to_path_buf();
        let logger = ServiceLogger::new(writer, LevelFilter::Debug);

        logger.log(
            &Record::builder()
                .level(log::Level::Info)
                .target("diskbench::test")
                .args(format_args!("orchestrator ready"))
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("[INFO] diskbench::test: orchestrator ready"));
    }
}
