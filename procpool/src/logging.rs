// Logging for procpool
//
// The engine emits events only through `tracing`. Applications pick a
// rendering by calling one `init*` function at startup; later calls are
// ignored. Every engine message starts with `[pool-name]`, and the event loop
// and worker monitors run inside `pool_span!` / `worker_span!` spans.
//
// ```rust
// use procpool::logging::{self, LogConfig};
//
// logging::init_development();
// // or
// logging::init(LogConfig::from_env());
// // or, with a copy of everything in a file
// logging::init_with_file(LogConfig::production(), "/var/log/procpool/pool.log").unwrap();
// ```
//
// Forked worker processes never log: the child of a multi-threaded process
// must not touch locks another thread may have held at fork time.

use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::sync::{Mutex, Once};

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Filter directives read by [`LogConfig::from_env`], e.g. `procpool=debug`.
pub const FILTER_ENV: &str = "PROCPOOL_LOG";

/// `json` selects JSON output in [`LogConfig::from_env`].
pub const FORMAT_ENV: &str = "PROCPOOL_LOG_FORMAT";

/// How pool logs are rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Level applied to every target without its own directive
    pub level: Level,
    pub json_format: bool,
    pub show_file_line: bool,
    /// Thread names identify the event loop, monitors and thread workers
    pub show_thread_info: bool,
    pub show_time: bool,
    /// Log when pool and worker spans close, with their busy time
    pub span_events: bool,
    /// Comma-separated `target=level` directives
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: false,
            show_thread_info: true,
            show_time: true,
            span_events: false,
            target_filters: None,
        }
    }
}

impl LogConfig {
    /// DEBUG everywhere, TRACE for dispatch and worker supervision.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            show_file_line: true,
            span_events: true,
            target_filters: Some("procpool::event_loop=trace,procpool::worker=trace".to_string()),
            ..Self::default()
        }
    }

    /// INFO as flattened JSON, one object per line.
    pub fn production() -> Self {
        Self { json_format: true, ..Self::default() }
    }

    /// Warnings and errors only, without timestamps.
    pub fn test() -> Self {
        Self {
            level: Level::WARN,
            show_file_line: true,
            show_thread_info: false,
            show_time: false,
            ..Self::default()
        }
    }

    /// Defaults overridden by [`FILTER_ENV`] and [`FORMAT_ENV`].
    pub fn from_env() -> Self {
        Self {
            json_format: env::var(FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json")),
            target_filters: env::var(FILTER_ENV).ok().filter(|filters| !filters.trim().is_empty()),
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in self.target_filters.iter().flat_map(|filters| filters.split(',')) {
            match directive.trim().parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(_) if directive.trim().is_empty() => {}
                Err(err) => eprintln!("Ignoring log directive {:?}: {}", directive.trim(), err),
            }
        }
        filter
    }

    fn console_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        let layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(self.show_file_line)
            .with_line_number(self.show_file_line)
            .with_thread_names(self.show_thread_info)
            .with_span_events(self.span_events())
            .with_target(!self.json_format);

        match (self.json_format, self.show_time) {
            (true, _) => layer.json().flatten_event(true).boxed(),
            (false, true) => layer.boxed(),
            (false, false) => layer.without_time().boxed(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events { FmtSpan::CLOSE } else { FmtSpan::NONE }
    }
}

static INIT: Once = Once::new();

/// Installs the global subscriber. Only the first `init*` call in a process
/// takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::registry()
            .with(config.filter())
            .with(config.console_layer());
        install(subscriber);
    });
}

/// Opens `path` for appending, creating it if needed.
pub fn open_log_file(path: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Like [`init`], plus a plain-text copy of every event appended to
/// `log_file`.
///
/// # Errors
/// Returns an error if the log file cannot be opened or created.
pub fn init_with_file(config: LogConfig, log_file: &str) -> io::Result<()> {
    let file = open_log_file(log_file)?;

    INIT.call_once(|| {
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true);

        let subscriber = tracing_subscriber::registry()
            .with(config.filter())
            .with(config.console_layer())
            .with(file_layer);
        install(subscriber);
    });
    Ok(())
}

pub fn init_default() {
    init(LogConfig::default());
}

pub fn init_development() {
    init(LogConfig::development());
}

pub fn init_production() {
    init(LogConfig::production());
}

/// For tests; safe to call from every test.
pub fn init_test() {
    init(LogConfig::test());
}

fn install<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("procpool logging not installed: {}", err);
    }
}

/// Span for pool-level work (event loop, resize, shutdown).
///
/// ```rust
/// let span = procpool::pool_span!("image-pool");
/// let span = procpool::pool_span!("image-pool", workers = 4);
/// ```
#[macro_export]
macro_rules! pool_span {
    ($pool:expr) => {
        $crate::tracing::info_span!("pool", name = %$pool)
    };
    ($pool:expr, $($fields:tt)*) => {
        $crate::tracing::info_span!("pool", name = %$pool, $($fields)*)
    };
}

/// Span for one worker slot (monitor thread, restarts).
#[macro_export]
macro_rules! worker_span {
    ($pool:expr, $worker_id:expr) => {
        $crate::tracing::debug_span!("worker", pool = %$pool, id = $worker_id)
    };
    ($pool:expr, $worker_id:expr, $($fields:tt)*) => {
        $crate::tracing::debug_span!("worker", pool = %$pool, id = $worker_id, $($fields)*)
    };
}

/// Structured event for a worker state change.
///
/// ```rust
/// procpool::log_lifecycle!("image-pool", 2, "stopped");
/// procpool::log_lifecycle!("image-pool", 2, "restarted", restarts = 1);
/// ```
#[macro_export]
macro_rules! log_lifecycle {
    ($pool:expr, $worker_id:expr, $event:expr) => {
        $crate::tracing::info!(pool = %$pool, worker_id = $worker_id, event = $event)
    };
    ($pool:expr, $worker_id:expr, $event:expr, $($fields:tt)*) => {
        $crate::tracing::info!(pool = %$pool, worker_id = $worker_id, event = $event, $($fields)*)
    };
}
