//! Decoupled logging pipeline for builds and device operations.
//!
//! Every log line goes through an unbounded crossbeam channel to a dedicated
//! OS thread that owns the file handles, so callers on any runtime (or none)
//! never block on disk I/O.
//!
//! # Layout
//!
//! ```text
//! <log_dir>/full/<ts>_full.log          every line
//! <log_dir>/parsed/<ts>_parsed.log      high-level milestones only
//! <log_dir>/operations/<op-id>.log      raw output of one operation
//! ```
//!
//! `wait_for_empty()` is a flush barrier: once it returns, every line sent
//! before the call is on disk.

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where a line is persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogKind {
    /// Written to `full/` only
    Full,
    /// Written to `full/` and `parsed/`
    Parsed,
    /// Written to `operations/<id>.log` and `full/`
    Operation(String),
}

/// A log line with metadata.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub kind: LogKind,
    /// Wall clock time the line was created, `HH:MM:SS.mmm`
    pub timestamp: String,
    /// Optional progress indicator (0-100)
    pub progress: Option<u8>,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            kind: LogKind::Full,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
            progress: None,
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            kind: LogKind::Parsed,
            ..LogLine::new(message)
        }
    }

    pub fn operation(operation_id: &str, message: String) -> Self {
        LogLine {
            kind: LogKind::Operation(operation_id.to_string()),
            ..LogLine::new(message)
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    fn format(&self) -> String {
        match self.progress {
            Some(p) => format!("[{}] [{:>3}%] {}\n", self.timestamp, p, self.message),
            None => format!("[{}] {}\n", self.timestamp, self.message),
        }
    }
}

enum LogMessage {
    Line(LogLine),
    /// Flush barrier; the sender is signalled once everything before it is synced
    Flush(tokio::sync::oneshot::Sender<()>),
    /// Drop the cached handle of a finished operation
    CloseOperation(String),
}

/// Unified logger feeding a background disk persister.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_dir: PathBuf,
}

impl LogCollector {
    /// Create the log directories and start the persister thread.
    pub fn new(log_dir: PathBuf) -> Result<Self, String> {
        for sub in ["full", "parsed", "operations"] {
            std::fs::create_dir_all(log_dir.join(sub))
                .map_err(|e| format!("Failed to create {} log dir: {}", sub, e))?;
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let full_path = log_dir.join("full").join(format!("{}_full.log", stamp));
        let parsed_path = log_dir.join("parsed").join(format!("{}_parsed.log", stamp));

        // Open eagerly so a session always leaves a file behind, even if empty
        let full = open_append(&full_path)?;
        let parsed = open_append(&parsed_path)?;

        let (tx, rx) = unbounded::<LogMessage>();
        let operations_dir = log_dir.join("operations");

        std::thread::Builder::new()
            .name("droidforge-log-persister".to_string())
            .spawn(move || persist_loop(rx, full, parsed, operations_dir))
            .map_err(|e| format!("Failed to spawn log persister: {}", e))?;

        Ok(LogCollector { tx, log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of the raw output log for one operation.
    pub fn operation_log_path(&self, operation_id: &str) -> PathBuf {
        self.log_dir
            .join("operations")
            .join(format!("{}.log", sanitize_file_stem(operation_id)))
    }

    /// Send a log line (non-blocking, never fails)
    pub fn log(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    /// Send a parsed (high-level) log
    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    /// Append one line of raw operation output
    pub fn log_operation(&self, operation_id: &str, message: impl Into<String>) {
        self.log(LogLine::operation(operation_id, message.into()));
    }

    /// Release the file handle of a finished operation.
    pub fn close_operation(&self, operation_id: &str) {
        let _ = self
            .tx
            .send(LogMessage::CloseOperation(operation_id.to_string()));
    }

    /// Wait until all previously sent lines are written and flushed.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.await
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

/// Wires `log::info!()` and friends into the collector.
///
/// Records with target `parsed` also land in the parsed log.
impl Log for LogCollector {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == "parsed" {
            self.log_parsed(message);
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {}
}

/// Install a collector as the global `log` backend.
pub fn init_global_logger(collector: LogCollector, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(collector))?;
    log::set_max_level(level);
    Ok(())
}

fn persist_loop(rx: Receiver<LogMessage>, mut full: File, mut parsed: File, operations_dir: PathBuf) {
    let mut operation_files: HashMap<String, File> = HashMap::new();

    while let Ok(msg) = rx.recv() {
        match msg {
            LogMessage::Line(line) => {
                let formatted = line.format();
                let _ = full.write_all(formatted.as_bytes());

                match &line.kind {
                    LogKind::Full => {}
                    LogKind::Parsed => {
                        let _ = parsed.write_all(formatted.as_bytes());
                    }
                    LogKind::Operation(id) => {
                        if !operation_files.contains_key(id) {
                            let path = operations_dir.join(format!("{}.log", sanitize_file_stem(id)));
                            match open_append(&path) {
                                Ok(file) => {
                                    operation_files.insert(id.clone(), file);
                                }
                                Err(e) => eprintln!("[Log] {}", e),
                            }
                        }
                        if let Some(file) = operation_files.get_mut(id) {
                            let _ = file.write_all(formatted.as_bytes());
                        }
                    }
                }
            }
            LogMessage::CloseOperation(id) => {
                if let Some(mut file) = operation_files.remove(&id) {
                    let _ = file.flush();
                }
            }
            LogMessage::Flush(done) => {
                let _ = full.flush();
                let _ = parsed.flush();
                for file in operation_files.values_mut() {
                    let _ = file.flush();
                }
                let _ = done.send(());
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))
}

/// Operation ids come from callers; keep them from escaping the log directory.
fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
