//! Syslog, file, or stderr logging behind the `log` facade.
//!
//! Syslog messages go straight to the /dev/log socket rather than
//! through the syslog crate's writers, which gives us full control
//! over the line format.  We use the crate for its priority types.
use crate::conf::{LogFile, LogOptions};
use std::fs;
use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::process;
use std::thread;

const SYSLOG_UNIX_PATH: &str = "/dev/log";
const APPLICATION: &str = "turfwar";

pub struct Logger {
    logfile: LogFile,
    loglevel: log::LevelFilter,
    facility: syslog::Facility,
    writer: Option<UnixDatagram>,
    application: String,
}

impl Logger {
    pub fn new(options: &LogOptions) -> Logger {
        Logger {
            logfile: options.log_file.clone(),
            loglevel: options.log_level,
            facility: options.syslog_facility,
            writer: None,
            application: APPLICATION.to_string(),
        }
    }

    /// Setup our global log handler.
    ///
    /// Connects to the syslog unix socket or verifies the log file is
    /// writable before anything is logged.
    pub fn init(mut self) -> Result<(), String> {
        match self.logfile {
            LogFile::Syslog => {
                self.writer = Some(Logger::writer()?);
            }
            LogFile::Filename(ref name) => {
                fs::File::options()
                    .create(true)
                    .append(true)
                    .open(name)
                    .map_err(|e| format!("Cannot open file for writing: {name} {e}"))?;
            }
            LogFile::Stderr => {}
        }

        log::set_max_level(self.loglevel);

        log::set_boxed_logger(Box::new(self)).map_err(|e| format!("Cannot init Logger: {e}"))
    }

    pub fn writer() -> Result<UnixDatagram, String> {
        let socket =
            UnixDatagram::unbound().map_err(|e| format!("Cannot create unix socket: {e}"))?;

        socket
            .connect(SYSLOG_UNIX_PATH)
            .map_err(|e| format!("Cannot connect to unix socket: {e}"))?;

        Ok(socket)
    }

    /// Encode the facility and severity as the syslog priority.
    fn encode_priority(&self, severity: syslog::Severity) -> syslog::Priority {
        self.facility as u8 | severity as u8
    }

    fn severity(level: log::Level) -> syslog::Severity {
        match level {
            log::Level::Debug | log::Level::Trace => syslog::Severity::LOG_DEBUG,
            log::Level::Info => syslog::Severity::LOG_INFO,
            log::Level::Warn => syslog::Severity::LOG_WARNING,
            log::Level::Error => syslog::Severity::LOG_ERR,
        }
    }

    /// One log line, minus any syslog priority or timestamp prefix.
    fn format_line(&self, record: &log::Record) -> String {
        let target = if !record.target().is_empty() {
            record.target()
        } else {
            record.module_path().unwrap_or_default()
        };

        let current = thread::current();

        format!(
            "{} [{}:{}:{}:{}:{}] {}",
            self.application,
            record.level(),
            process::id(),
            current.name().unwrap_or("-"),
            target,
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level().to_level_filter() <= self.loglevel
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.format_line(record);

        if let Some(ref w) = self.writer {
            let priority = self.encode_priority(Logger::severity(record.level()));
            if w.send(format!("<{priority}>{line}").as_bytes()).is_ok() {
                return;
            }
        }

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let message = format!("{stamp} {line}\n");

        if let LogFile::Filename(ref name) = self.logfile {
            if let Ok(mut file) = fs::File::options().create(true).append(true).open(name) {
                if file.write_all(message.as_bytes()).is_ok() {
                    return;
                }
            }
        }

        // If all else fails, print the log message.
        eprint!("{message}");
    }

    fn flush(&self) {}
}
