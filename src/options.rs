//! Compiler options and per-component stderr tracing.
//!
//! Every pipeline component logs through the [`log`] facade with a target
//! naming the component. The built-in logger filters records by verbosity
//! and by an explicit set of enabled categories, so `--log=body_builder`
//! style switches map directly onto [`LogCategory`] values.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::sync::Once;

/// A traceable compiler component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogCategory {
    /// The compiler driver and module loader.
    Driver,
    /// Expression flattening.
    Flatten,
    /// Control-flow lowering to fork trees.
    Unbranch,
    /// Procedure body assembly and optimisation.
    BodyBuilder,
    /// Alias analysis.
    Analysis,
    /// The code generation boundary.
    Codegen,
}

impl LogCategory {
    /// The `log` target string this category filters on.
    pub fn target(self) -> &'static str {
        match self {
            LogCategory::Driver => "driver",
            LogCategory::Flatten => "flatten",
            LogCategory::Unbranch => "unbranch",
            LogCategory::BodyBuilder => "body_builder",
            LogCategory::Analysis => "analysis",
            LogCategory::Codegen => "codegen",
        }
    }

    /// Parses a category selector as written on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "driver" => Some(LogCategory::Driver),
            "flatten" => Some(LogCategory::Flatten),
            "unbranch" => Some(LogCategory::Unbranch),
            "body_builder" => Some(LogCategory::BodyBuilder),
            "analysis" => Some(LogCategory::Analysis),
            "codegen" => Some(LogCategory::Codegen),
            _ => None,
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target())
    }
}

/// Options controlling a compiler run.
#[derive(Debug, Clone, Default)]
pub struct CompilerOptions {
    /// Verbosity 0-3: silent, errors-and-warnings, informational, debug
    /// tracing.
    pub verbosity: u8,
    /// Components whose debug tracing is enabled. Empty means all
    /// components trace at the level `verbosity` allows.
    pub log_categories: BTreeSet<LogCategory>,
}

impl CompilerOptions {
    /// Options with the given verbosity and no category restriction.
    pub fn with_verbosity(verbosity: u8) -> Self {
        Self {
            verbosity,
            log_categories: BTreeSet::new(),
        }
    }

    /// Enables tracing for one component.
    pub fn trace(mut self, category: LogCategory) -> Self {
        self.log_categories.insert(category);
        self
    }

    /// The maximum log level this verbosity admits.
    pub fn level_filter(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

/// A stderr logger filtering by verbosity and component category.
struct StderrLogger {
    max_level: LevelFilter,
    categories: BTreeSet<&'static str>,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.max_level {
            return false;
        }
        // Debug tracing is opt-in per component once any category is named.
        if metadata.level() >= Level::Debug && !self.categories.is_empty() {
            return self.categories.contains(metadata.target());
        }
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "[{}] {}: {}",
            record.target(),
            record.level().as_str().to_lowercase(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static INIT_LOGGER: Once = Once::new();

/// Installs the stderr logger for these options.
///
/// Installation happens at most once per process; later calls (including
/// calls from parallel tests) are no-ops.
pub fn init_logging(options: &CompilerOptions) -> Result<(), SetLoggerError> {
    INIT_LOGGER.call_once(|| {
        let logger = StderrLogger {
            max_level: options.level_filter(),
            categories: options
                .log_categories
                .iter()
                .map(|c| c.target())
                .collect(),
        };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(options.level_filter());
        }
    });
    Ok(())
}
