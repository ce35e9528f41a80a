//! Kernel-style print macros
//!
//! Leveled, env-controlled debug output on stderr.
//!
//! # Environment Variables
//!
//! - `EVMA_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `EVMA_FLUSH_EPRINT=1` - flush stderr after each print (useful when
//!   chasing crashes)
//!
//! # Usage
//!
//! ```ignore
//! use evma_core::{kdebug, kinfo, kwarn, kerror};
//!
//! kinfo!("pool thread {} started", n);
//! kdebug!("read {} bytes from fd {}", bytes, fd);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Called automatically on first use; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(
        crate::env::env_get_bool("EVMA_FLUSH_EPRINT", false),
        Ordering::Relaxed,
    );

    if let Ok(val) = std::env::var("EVMA_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether per-line flushing is on
#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// One formatted line to stderr; the macros below are the public surface.
pub fn emit(level: LogLevel, args: core::fmt::Arguments<'_>) {
    use std::io::Write;
    eprintln!("{} {}", level.prefix(), args);
    if flush_enabled() {
        let _ = std::io::stderr().flush();
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        if $crate::kprint::log_level() >= $crate::kprint::LogLevel::Error {
            $crate::kprint::emit($crate::kprint::LogLevel::Error, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        if $crate::kprint::log_level() >= $crate::kprint::LogLevel::Warn {
            $crate::kprint::emit($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        if $crate::kprint::log_level() >= $crate::kprint::LogLevel::Info {
            $crate::kprint::emit($crate::kprint::LogLevel::Info, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        if $crate::kprint::log_level() >= $crate::kprint::LogLevel::Debug {
            $crate::kprint::emit(
                $crate::kprint::LogLevel::Debug,
                format_args!("{}: {}", module_path!(), format_args!($($arg)*)),
            );
        }
    };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        if $crate::kprint::log_level() >= $crate::kprint::LogLevel::Trace {
            $crate::kprint::emit(
                $crate::kprint::LogLevel::Trace,
                format_args!("{} ({}:{}): {}", module_path!(), file!(), line!(), format_args!($($arg)*)),
            );
        }
    };
}
