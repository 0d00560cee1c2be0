//! Command-line interface for taskforced.
use clap::Parser;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for taskforced, the supervisor daemon.
#[derive(Parser)]
#[command(name = "taskforced", version, author)]
#[command(about = "A user-space process supervisor", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long = "config-file", value_name = "PATH", default_value = "taskforce.yaml")]
    pub config_file: String,

    /// Path to the roles file; absent disables role filtering.
    #[arg(long = "roles-file", value_name = "PATH")]
    pub roles_file: Option<String>,

    /// Additional HTTP control/status listener, `[host][:port]` or an
    /// absolute Unix-domain socket path. May be repeated.
    #[arg(long = "http", value_name = "LISTEN")]
    pub http: Vec<String>,

    /// PEM file with both certificate and key, enabling TLS on every
    /// `--http` listener that doesn't set its own `certfile` in config.
    #[arg(long = "certfile", value_name = "PATH")]
    pub certfile: Option<String>,

    /// Permit `/manage/*` control endpoints on every `--http` listener.
    #[arg(long = "allow-control")]
    pub allow_control: bool,

    /// Load and validate the configuration, then exit 0 without running.
    #[arg(long = "sanity")]
    pub sanity: bool,

    /// Exit cleanly after the given number of seconds.
    #[arg(long = "expires", value_name = "SECONDS")]
    pub expires: Option<u64>,

    /// Log to stderr instead of the runtime log directory.
    #[arg(long = "log-stderr")]
    pub log_stderr: bool,

    /// Raise the default log level to debug. Repeat for trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Override the logging verbosity for this invocation only.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// The effective log filter, combining `--verbose`, `--log-level`, and
    /// the default. An explicit `--log-level` always wins.
    pub fn log_filter(&self) -> &'static str {
        if let Some(level) = self.log_level {
            return level.as_str();
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_arg_parses_names_and_numbers() {
        assert_eq!("debug".parse::<LogLevelArg>().unwrap().as_str(), "debug");
        assert_eq!("4".parse::<LogLevelArg>().unwrap().as_str(), "debug");
        assert!("bogus".parse::<LogLevelArg>().is_err());
    }

    #[test]
    fn verbose_count_raises_default_filter() {
        let cli = Cli::parse_from(["taskforced"]);
        assert_eq!(cli.log_filter(), "info");
        let cli = Cli::parse_from(["taskforced", "-vv"]);
        assert_eq!(cli.log_filter(), "trace");
    }

    #[test]
    fn explicit_log_level_overrides_verbose_count() {
        let cli = Cli::parse_from(["taskforced", "-v", "--log-level", "error"]);
        assert_eq!(cli.log_filter(), "error");
    }
}
