//! Leveled logging shared by every beand crate.
//!
//! A record is rendered once, as text or as a JSON object, and written to each enabled
//! sink: stderr and the appended `debug.log`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// Case-insensitive level name; `warning` is accepted for `warn`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("warning") {
            return Some(Level::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(raw))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            text if text.eq_ignore_ascii_case("text") => Some(Format::Text),
            json if json.eq_ignore_ascii_case("json") => Some(Format::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub print_to_console: bool,
    /// Appended to when set, normally `<datadir>/debug.log`.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            print_to_console: true,
            file: None,
        }
    }
}

#[derive(Debug)]
pub struct LogInitError {
    pub path: PathBuf,
    pub source: io::Error,
}

impl fmt::Display for LogInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot open log file {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for LogInitError {}

struct Sinks {
    format: Format,
    timestamps: bool,
    console: bool,
    file: Option<File>,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static SINKS: OnceLock<Mutex<Sinks>> = OnceLock::new();

fn sinks() -> &'static Mutex<Sinks> {
    SINKS.get_or_init(|| {
        Mutex::new(Sinks {
            format: Format::Text,
            timestamps: true,
            console: true,
            file: None,
        })
    })
}

/// Installs `config`. May be called again; the last call wins.
pub fn init(config: &LogConfig) -> Result<(), LogInitError> {
    let file = config
        .file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogInitError {
                    path: path.clone(),
                    source,
                })
        })
        .transpose()?;
    if let Ok(mut sinks) = sinks().lock() {
        *sinks = Sinks {
            format: config.format,
            timestamps: config.timestamps,
            console: config.print_to_console,
            file,
        };
    }
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    Ok(())
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn log(level: Level, target: &'static str, line: u32, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let Ok(mut sinks) = sinks().lock() else {
        return;
    };
    let rendered = match sinks.format {
        Format::Json => json!({
            "ts_ms": u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
            "level": level.as_str(),
            "target": target,
            "line": line,
            "msg": args.to_string(),
        })
        .to_string(),
        Format::Text if sinks.timestamps => {
            format!("{} {} {target}: {args}", utc_timestamp(now), level.as_str())
        }
        Format::Text => format!("{} {target}: {args}", level.as_str()),
    };
    if sinks.console {
        let _ = writeln!(io::stderr().lock(), "{rendered}");
    }
    if let Some(file) = sinks.file.as_mut() {
        let _ = writeln!(file, "{rendered}");
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), line!(), format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

/// `YYYY-MM-DD HH:MM:SS.mmm` in UTC.
fn utc_timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_date(secs / 86_400);
    let time_of_day = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03}",
        time_of_day / 3600,
        time_of_day / 60 % 60,
        time_of_day % 60,
        since_epoch.subsec_millis()
    )
}

/// Proleptic Gregorian date of a day count since 1970-01-01.
fn civil_date(days: u64) -> (u64, u64, u64) {
    // shift the epoch to 0000-03-01 so leap days fall at the end of each year
    let shifted = days + 719_468;
    let era = shifted / 146_097;
    let day_of_era = shifted % 146_097;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_index + 2) / 5 + 1;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    };
    let year = era * 400 + year_of_era + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_and_format_names() {
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse(" DEBUG "), Some(Level::Debug));
        assert_eq!(Level::parse("loud"), None);
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn timestamps_are_utc() {
        let at = Duration::from_millis(1_423_862_862_007);
        assert_eq!(utc_timestamp(at), "2015-02-13 21:27:42.007");
        assert_eq!(civil_date(0), (1970, 1, 1));
        assert_eq!(civil_date(11_016), (2000, 2, 29));
    }

    #[test]
    fn file_sink_respects_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("debug.log");
        init(&LogConfig {
            level: Level::Debug,
            print_to_console: false,
            file: Some(path.clone()),
            ..LogConfig::default()
        })
        .expect("init");
        log_info!("staking {}", 42);
        log_trace!("filtered");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.contains("INFO"));
        assert!(contents.contains("staking 42"));
        assert!(!contents.contains("filtered"));
    }
}
