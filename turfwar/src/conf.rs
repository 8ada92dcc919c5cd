//! Server configuration.
//!
//! Values are applied like so, later sources winning:
//!
//! 1. Defaults defined in this module.
//! 2. The `turfwar:` section of an optional YAML file (--config-file).
//! 3. Command line options.
//!
//! Database settings follow the same order, with the PG* environment
//! variables filling anything still unset just before connecting.
use crate::result::{TurfError, TurfResult};
use crate::store::{PgConnector, PgConnectorBuilder};
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use yaml_rust::{Yaml, YamlLoader};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_KEEPALIVE_MS: u64 = 1000;

/// BSD sysexits EX_USAGE.
pub const EXIT_USAGE: i32 = 64;

const YAML_ROOT: &str = "turfwar";

#[derive(Debug, Clone, PartialEq)]
pub enum LogFile {
    Syslog,
    Stderr,
    Filename(String),
}

impl From<&str> for LogFile {
    fn from(s: &str) -> LogFile {
        match s {
            "syslog" => LogFile::Syslog,
            "stderr" | "-" => LogFile::Stderr,
            _ => LogFile::Filename(s.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub log_file: LogFile,
    pub log_level: log::LevelFilter,
    pub syslog_facility: syslog::Facility,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            log_file: LogFile::Stderr,
            log_level: log::LevelFilter::Warn,
            syslog_facility: syslog::Facility::LOG_LOCAL0,
        }
    }
}

impl LogOptions {
    pub fn set_syslog_facility(&mut self, facility: &str) -> TurfResult<()> {
        match syslog::Facility::from_str(facility) {
            Ok(ff) => {
                self.syslog_facility = ff;
                Ok(())
            }
            Err(_) => Err(format!("Invalid syslog facility string: {facility}").into()),
        }
    }

    /// Maps level names (or numbers) to log levels.
    ///
    /// ```
    /// use turfwar::conf::LogOptions;
    ///
    /// assert_eq!(LogOptions::log_level_from_str("debug"), Some(log::LevelFilter::Debug));
    /// assert_eq!(LogOptions::log_level_from_str("2"), Some(log::LevelFilter::Warn));
    /// assert_eq!(LogOptions::log_level_from_str("loud"), None);
    /// ```
    pub fn log_level_from_str(level: &str) -> Option<log::LevelFilter> {
        match level {
            "0" | "off" => Some(log::LevelFilter::Off),
            "1" | "error" => Some(log::LevelFilter::Error),
            "2" | "warn" => Some(log::LevelFilter::Warn),
            "3" | "info" => Some(log::LevelFilter::Info),
            "4" | "debug" => Some(log::LevelFilter::Debug),
            "5" | "trace" => Some(log::LevelFilter::Trace),
            _ => None,
        }
    }

    /// Raise the level one step per -v.
    fn raise(&mut self, steps: usize) {
        for _ in 0..steps {
            self.log_level = match self.log_level {
                log::LevelFilter::Off => log::LevelFilter::Error,
                log::LevelFilter::Error => log::LevelFilter::Warn,
                log::LevelFilter::Warn => log::LevelFilter::Info,
                log::LevelFilter::Info => log::LevelFilter::Debug,
                _ => log::LevelFilter::Trace,
            };
        }
    }
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Run(Box<Config>),
    /// -h: print this text and exit.
    Help(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub daemonize: bool,
    pub address: String,
    pub port: u16,
    pub workers: usize,
    pub keepalive_ms: u64,
    /// Directory holding the static assets.  We chdir here at startup.
    pub asset_dir: String,
    /// Exported as TMPDIR when set.
    pub tmp_dir: Option<String>,
    pub logging: LogOptions,
    pub db: PgConnectorBuilder,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            daemonize: false,
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            workers: mptc::DEFAULT_WORKERS,
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
            asset_dir: ".".to_string(),
            tmp_dir: None,
            logging: LogOptions::default(),
            db: PgConnectorBuilder::new(),
        }
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> TurfResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| TurfError::Message(format!("Invalid value for {name}: '{value}': {e}")))
}

impl Config {
    pub fn options() -> getopts::Options {
        let mut opts = getopts::Options::new();

        opts.optflag("d", "daemonize", "Run in the background");
        opts.optflagmulti("v", "verbose", "Log more.  Repeat for even more");
        opts.optopt("p", "port", "Listen port (default 8080)", "PORT");
        opts.optopt("w", "workers", "Connection worker threads (default 256)", "WORKERS");
        opts.optopt("k", "keepalive", "Client read/write timeout in ms (default 1000)", "MS");
        opts.optflag("h", "help", "Show this help");
        opts.optopt("", "address", "Listen address (default 0.0.0.0)", "ADDRESS");
        opts.optopt("", "asset-dir", "Directory of static assets", "DIR");
        opts.optopt("", "tmp-dir", "Directory for temporary files", "DIR");
        opts.optopt("", "log-file", "'syslog', 'stderr', or a file path", "FILE");
        opts.optopt("", "config-file", "YAML configuration file", "FILE");

        PgConnectorBuilder::append_options(&mut opts);

        opts
    }

    pub fn usage() -> String {
        Config::options().usage("Usage: turfwar [options]")
    }

    /// Build a configuration from command line arguments, not
    /// including the program name.
    ///
    /// ```
    /// use turfwar::conf::{Config, Invocation};
    ///
    /// let args = ["-p", "9090", "-w", "4", "-vv"];
    /// let Ok(Invocation::Run(conf)) = Config::from_args(&args) else {
    ///     panic!("expected a runnable config");
    /// };
    ///
    /// assert_eq!(conf.port, 9090);
    /// assert_eq!(conf.workers, 4);
    /// assert_eq!(conf.logging.log_level, log::LevelFilter::Debug);
    ///
    /// assert!(Config::from_args(&["-p", "http"]).is_err());
    /// ```
    pub fn from_args<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> TurfResult<Invocation> {
        let params = Config::options()
            .parse(args)
            .map_err(|e| TurfError::Message(e.to_string()))?;

        if params.opt_present("h") {
            return Ok(Invocation::Help(Config::usage()));
        }

        let mut conf = Config::default();

        // Command line database settings take precedence over any
        // from the config file, which only fills gaps.
        conf.db.set_opts(&params)?;

        if let Some(filename) = params.opt_str("config-file") {
            conf.apply_yaml_file(&filename)?;
        }

        if params.opt_present("d") {
            conf.daemonize = true;
        }

        if let Some(v) = params.opt_str("p") {
            conf.port = parse_num("port", &v)?;
        }

        if let Some(v) = params.opt_str("w") {
            conf.workers = parse_num("workers", &v)?;
        }

        if let Some(v) = params.opt_str("k") {
            conf.keepalive_ms = parse_num("keepalive", &v)?;
        }

        if let Some(v) = params.opt_str("address") {
            conf.address = v;
        }

        if let Some(v) = params.opt_str("asset-dir") {
            conf.asset_dir = v;
        }

        if let Some(v) = params.opt_str("tmp-dir") {
            conf.tmp_dir = Some(v);
        }

        if let Some(v) = params.opt_str("log-file") {
            conf.logging.log_file = LogFile::from(v.as_str());
        }

        conf.logging.raise(params.opt_count("v"));

        conf.validate()?;

        Ok(Invocation::Run(Box::new(conf)))
    }

    fn validate(&self) -> TurfResult<()> {
        if self.workers == 0 {
            return Err("workers must be at least 1".into());
        }
        if self.keepalive_ms == 0 {
            return Err("keepalive must be at least 1ms".into());
        }
        Ok(())
    }

    /// Parse a YAML configuration file.
    pub fn apply_yaml_file(&mut self, filename: &str) -> TurfResult<()> {
        let yaml_text = fs::read_to_string(filename)
            .map_err(|e| format!("Error reading config {filename}: {e}"))?;

        self.apply_yaml(&yaml_text)
            .map_err(|e| format!("Error in config {filename}: {e}").into())
    }

    /// Apply the settings found under the `turfwar:` key.
    ///
    /// ```
    /// use turfwar::conf::{Config, LogFile};
    ///
    /// let mut conf = Config::default();
    /// conf.apply_yaml("turfwar:\n  port: 8000\n  log-file: syslog\n").unwrap();
    ///
    /// assert_eq!(conf.port, 8000);
    /// assert_eq!(conf.logging.log_file, LogFile::Syslog);
    /// ```
    pub fn apply_yaml(&mut self, yaml_text: &str) -> TurfResult<()> {
        let yaml_docs =
            YamlLoader::load_from_str(yaml_text).map_err(|e| format!("Invalid YAML: {e}"))?;

        let root = match yaml_docs.first() {
            Some(v) => &v[YAML_ROOT],
            None => return Err("Empty config".into()),
        };

        if root.is_badvalue() {
            return Err(format!("Missing '{YAML_ROOT}' section").into());
        }

        if let Some(v) = root["daemonize"].as_bool() {
            self.daemonize = v;
        }

        if let Some(v) = root["address"].as_str() {
            self.address = v.to_string();
        }

        if let Some(v) = root["port"].as_i64() {
            self.port = u16::try_from(v).map_err(|_| format!("Invalid port: {v}"))?;
        }

        if let Some(v) = root["workers"].as_i64() {
            self.workers = usize::try_from(v).map_err(|_| format!("Invalid workers: {v}"))?;
        }

        if let Some(v) = root["keepalive-ms"].as_i64() {
            self.keepalive_ms =
                u64::try_from(v).map_err(|_| format!("Invalid keepalive-ms: {v}"))?;
        }

        if let Some(v) = root["asset-dir"].as_str() {
            self.asset_dir = v.to_string();
        }

        if let Some(v) = root["tmp-dir"].as_str() {
            self.tmp_dir = Some(v.to_string());
        }

        if let Some(v) = root["log-file"].as_str() {
            self.logging.log_file = LogFile::from(v);
        }

        if let Some(v) = root["log-level"].as_str() {
            self.logging.log_level = LogOptions::log_level_from_str(v)
                .ok_or_else(|| format!("Invalid log-level: {v}"))?;
        } else if let Some(v) = root["log-level"].as_i64() {
            self.logging.log_level = LogOptions::log_level_from_str(&v.to_string())
                .ok_or_else(|| format!("Invalid log-level: {v}"))?;
        }

        if let Some(v) = root["syslog-facility"].as_str() {
            self.logging.set_syslog_facility(v)?;
        }

        if let Yaml::Hash(_) = root["database"] {
            self.db.fill_from_yaml(&root["database"])?;
        }

        Ok(())
    }

    /// Make asset_dir absolute.  Daemonizing changes directory before
    /// we do, so a relative path would be resolved twice.
    pub fn resolve_asset_dir(&mut self) -> TurfResult<()> {
        let absolute = fs::canonicalize(&self.asset_dir)
            .map_err(|e| format!("Invalid asset directory {}: {e}", self.asset_dir))?;

        self.asset_dir = absolute
            .to_str()
            .ok_or_else(|| format!("Asset directory is not UTF-8: {}", absolute.display()))?
            .to_string();

        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn connector(&self) -> TurfResult<PgConnector> {
        self.db.clone().build()
    }
}
