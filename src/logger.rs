//! Rank-prefixed diagnostics
//!
//! `RankLogger` is a sink for the `log` facade. Every line it writes to stdout starts with the
//! rank of the thread that logged it and the time elapsed since `init()`:
//!
//! ```text
//! [ 3-00:01:07] message
//! ```
//!
//! The rank is right-aligned to the width of the group size. The start time is taken by rank 0
//! and broadcast, so the clocks of all ranks agree.
//!
//! The rank context is kept per thread. Threads spawned by a rank pick it up with
//! `context()` and `LogContext::install()`; threads without a context use the one of the first
//! rank that called `init()`.

use std::cell::RefCell;
use std::env;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use log::{warn, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::status::Status;
use crate::topology::Communicator;
use crate::transport::{Code, ERR_UNKNOWN, SUCCESS};
use crate::Rank;

/// Code the group is aborted with by `error_stop()`
pub const STOP_CODE: Code = -1;

/// Severity threshold of the rank logger
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and above
    Warning,
    /// Informational messages and above
    Info,
    /// Debugging messages and above
    Debug,
    /// Everything
    Verbose,
}

impl LogLevel {
    /// The `log` filter letting this level and all more severe ones through
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Verbose => LevelFilter::Trace,
        }
    }
}

/// A string that does not name a `LogLevel`
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level `{0}`")]
pub struct ParseLogLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "verbose" | "trace" => Ok(LogLevel::Verbose),
            _ => Err(ParseLogLevelError(s.to_owned())),
        }
    }
}

/// Who is logging, and since when
#[derive(Clone)]
pub struct LogContext {
    world: Communicator,
    rank: Rank,
    width: usize,
    start: f64,
}

thread_local! {
    static CONTEXT: RefCell<Option<LogContext>> = RefCell::new(None);
}

static FALLBACK: OnceCell<LogContext> = OnceCell::new();

impl LogContext {
    /// The rank lines are prefixed with
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Use this context for everything the calling thread logs.
    pub fn install(self) {
        CONTEXT.with(|cell| *cell.borrow_mut() = Some(self));
    }

    fn prefix(&self) -> String {
        prefix(self.rank, self.width, self.world.transport().wtime() - self.start)
    }
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LogContext")
            .field("rank", &self.rank)
            .field("width", &self.width)
            .field("start", &self.start)
            .finish()
    }
}

/// `[<rank>-HH:MM:SS]`
fn prefix(rank: Rank, width: usize, elapsed: f64) -> String {
    let seconds = elapsed.max(0.0) as u64;
    format!(
        "[{:>width$}-{:02}:{:02}:{:02}]",
        rank,
        seconds / 3600 % 24,
        seconds / 60 % 60,
        seconds % 60,
        width = width
    )
}

/// The rank context of the calling thread, if it has one
pub fn context() -> Option<LogContext> {
    CONTEXT.with(|cell| cell.borrow().clone())
}

/// A `log::Log` sink writing rank-prefixed lines to stdout
#[derive(Copy, Clone, Debug, Default)]
pub struct RankLogger;

static LOGGER: RankLogger = RankLogger;

impl Log for RankLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = CONTEXT
            .try_with(|cell| cell.borrow().as_ref().map(LogContext::prefix))
            .ok()
            .flatten()
            .or_else(|| FALLBACK.get().map(LogContext::prefix))
            .unwrap_or_else(|| format!("[{}]", record.level()));
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{} {}", prefix, record.args());
        let _ = out.flush();
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Install the rank logger for the calling rank of `world` at `level`.
///
/// Collective over `world`: rank 0 broadcasts the start time. The `log` sink is installed by the
/// first rank of the process to get here; if another sink is already installed, only the level
/// and the rank context are set.
pub fn init(world: &Communicator, level: LogLevel) -> Result<()> {
    let rank = world.rank()?;
    let mut start = if rank == 0 {
        world.transport().wtime()
    } else {
        0.0
    };
    world.broadcast_into(&mut start, 0)?;
    let context = LogContext {
        world: world.clone(),
        rank,
        width: world.size()?.to_string().len(),
        start,
    };
    FALLBACK.get_or_init(|| context.clone());
    context.install();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level.to_level_filter());
    Ok(())
}

/// Like `init()`, with the level read from the environment variable `var`.
///
/// Falls back to `default` if the variable is unset or does not name a level. Returns the level
/// in effect.
pub fn init_from_env(world: &Communicator, var: &str, default: LogLevel) -> Result<LogLevel> {
    let parsed = env::var(var).ok().map(|value| value.parse::<LogLevel>());
    let level = match parsed {
        Some(Ok(level)) => level,
        _ => default,
    };
    init(world, level)?;
    if let Some(Err(e)) = parsed {
        warn!("{} in {}, using {:?}", e, var, default);
    }
    Ok(level)
}

/// Log `args` as an error and abort every rank of `comm`.
pub fn error_stop(comm: &Communicator, args: fmt::Arguments) -> ! {
    log::error!("{}", args);
    log::logger().flush();
    comm.abort(STOP_CODE)
}

/// Log an error and abort every rank of a communicator.
///
/// ```no_run
/// # fn stop(world: &mpi_typed::topology::Communicator) {
/// mpi_typed::log_error_stop!(world, "lost {} ranks", 2);
/// # }
/// ```
#[macro_export]
macro_rules! log_error_stop {
    ($comm:expr, $($arg:tt)+) => {
        $crate::logger::error_stop($comm, format_args!($($arg)+))
    };
}

/// Abort the group if `status` carries an error, logging what went wrong.
pub fn check_status(comm: &Communicator, status: &Status) {
    let transport = comm.transport();
    let mut class = SUCCESS;
    if transport.error_class(status.error(), &mut class) != SUCCESS {
        class = ERR_UNKNOWN;
    }
    if class != SUCCESS {
        error_stop(
            comm,
            format_args!(
                "{}: {}",
                transport.error_string(class),
                transport.error_string(status.error())
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local;

    #[test]
    fn levels_parse() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!(" Warning ".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Verbose));
        assert_eq!("verbose".parse::<LogLevel>(), Ok(LogLevel::Verbose));
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error < LogLevel::Verbose);
        assert_eq!(LogLevel::Info.to_level_filter(), LevelFilter::Info);
    }

    #[test]
    fn prefix_layout() {
        assert_eq!(prefix(3, 2, 3725.9), "[ 3-01:02:05]");
        assert_eq!(prefix(12, 2, 0.0), "[12-00:00:00]");
        assert_eq!(prefix(0, 1, 90_061.0), "[0-01:01:01]");
        assert_eq!(prefix(0, 1, -1.0), "[0-00:00:00]");
    }

    #[test]
    fn every_rank_gets_a_context() {
        let ranks = local::run(3, |universe| {
            init(&universe.world(), LogLevel::Info).unwrap();
            log::info!("logger ready");
            context().unwrap().rank()
        })
        .unwrap();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn threads_start_without_context() {
        assert!(std::thread::spawn(context).join().unwrap().is_none());
    }
}
