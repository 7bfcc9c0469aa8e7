//! Process-wide logging for call hosts.

pub mod logging {
    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "BEACH_CALL_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "BEACH_CALL_TRACE_DEPS";

    /// Targets owned by this workspace. They follow the requested level;
    /// everything else stays at `info` or quieter.
    const CALL_TARGETS: &[&str] = &["call", "call_core", "relay", "relay_bus", "beach_call"];

    /// Media stack crates that flood the output at trace.
    const MEDIA_STACK_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "interceptor",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        fn level_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives that replace the derived filter.
        pub filter_override: Option<String>,
        /// Let the media stack log at trace alongside call targets.
        pub trace_media_stack: bool,
    }

    impl LogConfig {
        /// Level and file from the command line, overrides from the environment.
        pub fn new(level: LogLevel, file: Option<PathBuf>) -> Self {
            Self {
                level,
                file,
                filter_override: std::env::var(FILTER_ENV).ok().filter(|value| !value.trim().is_empty()),
                trace_media_stack: std::env::var(TRACE_DEPS_ENV)
                    .map(|value| !value.is_empty() && value != "0")
                    .unwrap_or(false),
            }
        }

        /// `EnvFilter` directives for this config, and whether the media
        /// stack was held back.
        pub fn directives(&self) -> (String, bool) {
            if let Some(raw) = &self.filter_override {
                return (raw.clone(), false);
            }
            let level = self.level.as_str();
            let mut directives = match self.level {
                LogLevel::Debug | LogLevel::Trace => String::from("info"),
                _ => level.to_owned(),
            };
            if self.level >= LogLevel::Debug {
                for target in CALL_TARGETS {
                    let _ = write!(directives, ",{target}={level}");
                }
            }
            let quieted = self.level == LogLevel::Trace && !self.trace_media_stack;
            if quieted {
                for target in MEDIA_STACK_TARGETS {
                    let _ = write!(directives, ",{target}=info");
                }
            }
            (directives, quieted)
        }

        fn writer(&self) -> Result<(NonBlocking, WorkerGuard), InitError> {
            let Some(path) = &self.file else {
                return Ok(tracing_appender::non_blocking(std::io::stderr()));
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            Ok(tracing_appender::non_blocking(file))
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter {directives:?}: {reason}")]
        Filter { directives: String, reason: String },
        #[error("a global subscriber is already installed: {0}")]
        AlreadySet(String),
    }

    /// Keeps the background writer alive for the life of the process.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Only the first successful call has
    /// any effect.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }

        let (directives, quieted) = config.directives();
        let filter = EnvFilter::builder()
            .with_default_directive(config.level.level_filter().into())
            .parse(&directives)
            .map_err(|err| InitError::Filter {
                directives: directives.clone(),
                reason: err.to_string(),
            })?;
        let (writer, guard) = config.writer()?;

        let to_file = config.file.is_some();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(to_file || config.level >= LogLevel::Debug)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(!to_file)
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::AlreadySet(err.to_string()))?;
        let _ = WRITER_GUARD.set(guard);

        tracing::debug!(
            target: "call::telemetry",
            level = config.level.as_str(),
            file = ?config.file,
            %directives,
            "logging ready"
        );
        if quieted {
            tracing::info!(
                target: "call::telemetry",
                "media stack held at info; set {TRACE_DEPS_ENV}=1 to trace it"
            );
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn config(level: LogLevel) -> LogConfig {
            LogConfig {
                level,
                ..LogConfig::default()
            }
        }

        #[test]
        fn quiet_levels_apply_everywhere() {
            assert_eq!(config(LogLevel::Warn).directives(), ("warn".to_owned(), false));
            assert_eq!(config(LogLevel::Error).directives().0, "error");
            assert_eq!(LogLevel::default(), LogLevel::Warn);
        }

        #[test]
        fn debug_raises_only_call_targets() {
            let (directives, quieted) = config(LogLevel::Debug).directives();
            assert!(!quieted);
            assert!(directives.starts_with("info,"));
            assert!(directives.contains("call=debug"));
            assert!(directives.contains("relay_bus=debug"));
            assert!(!directives.contains("webrtc"));
        }

        #[test]
        fn trace_holds_back_the_media_stack() {
            let (directives, quieted) = config(LogLevel::Trace).directives();
            assert!(quieted);
            assert!(directives.contains("beach_call=trace"));
            assert!(directives.contains("webrtc_ice=info"));

            let opted_in = LogConfig {
                trace_media_stack: true,
                ..config(LogLevel::Trace)
            };
            let (directives, quieted) = opted_in.directives();
            assert!(!quieted);
            assert!(!directives.contains("webrtc"));
        }

        #[test]
        fn override_replaces_derived_directives() {
            let overridden = LogConfig {
                filter_override: Some("call::negotiation=trace".into()),
                ..config(LogLevel::Trace)
            };
            assert_eq!(
                overridden.directives(),
                ("call::negotiation=trace".to_owned(), false)
            );
        }

        #[test]
        fn unwritable_log_file_is_reported() {
            let missing = LogConfig {
                file: Some(PathBuf::from("/nonexistent-beach-call-dir/call.log")),
                ..config(LogLevel::Info)
            };
            assert!(matches!(missing.writer(), Err(InitError::Io { .. })));
        }
    }
}
