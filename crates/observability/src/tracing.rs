//! Subscriber installation.
//!
//! `RUST_LOG` selects what is logged (default `info`). `REPORTFORGE_LOG_FORMAT` selects
//! how: `json` (default) or `text`.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output rendering for log events.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable lines for local runs.
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// Install the global subscriber from the environment.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let format = match std::env::var("REPORTFORGE_LOG_FORMAT") {
        Ok(raw) => raw.parse().unwrap_or_else(|err| {
            eprintln!("{err}, falling back to json");
            LogFormat::Json
        }),
        Err(_) => LogFormat::Json,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_with(filter, format);
}

/// JSON output with explicit filter directives, e.g. `"reportforge_infra=debug,info"`.
pub fn init_with_filter(directives: &str) -> bool {
    init_with(EnvFilter::new(directives), LogFormat::Json)
}

/// Install the global subscriber with an explicit filter and format.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_with(filter: EnvFilter, format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    let installed = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Text => builder.with_target(true).try_init(),
    };
    let installed = installed.is_ok();
    if installed {
        ::tracing::debug!(?format, "log subscriber installed");
    }
    installed
}
