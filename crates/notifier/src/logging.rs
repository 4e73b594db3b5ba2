use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text.
    Text,
    /// Newline-delimited JSON.
    Json,
}

/// Logging arguments shared by notifier binaries.
#[derive(Debug, Clone, clap::Args)]
pub struct LogArgs {
    /// Level of logs to emit. RUST_LOG directives, if set, take precedence.
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info", value_enum)]
    pub level: LogLevel,
    /// Format of emitted logs.
    #[arg(long = "log.format", env = "LOG_FORMAT", default_value = "text", value_enum)]
    pub format: LogFormat,
}

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Install a global tracing subscriber which writes to stderr.
pub fn init_logging(args: &LogArgs) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(args.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match args.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    }
    .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Args {
        #[command(flatten)]
        log: LogArgs,
    }

    #[test]
    fn test_log_args() {
        let args =
            Args::try_parse_from(["notifier", "--log.level", "debug", "--log.format", "json"])
                .unwrap();
        assert_eq!((args.log.level, args.log.format), (LogLevel::Debug, LogFormat::Json));

        assert!(Args::try_parse_from(["notifier", "--log.level", "loud"]).is_err());
    }
}
