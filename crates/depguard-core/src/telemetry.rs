//! Tracing setup for depguard binaries.
//!
//! [`init_tracing`] installs the global subscriber once per process. Later
//! calls are ignored, so tests and embedding services can call it freely.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// Newline-delimited JSON for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Filter directives used when `RUST_LOG` is unset: depguard crates at
/// `level`, everything else one notch quieter.
pub fn default_directives(level: Level) -> String {
    let others = match level {
        Level::TRACE => Level::DEBUG,
        Level::DEBUG => Level::INFO,
        _ => Level::WARN,
    };
    format!("{others},depguard_core={level},depguard_state={level},depguard={level}")
        .to_lowercase()
}

/// Install the global subscriber on stderr. `RUST_LOG` takes precedence
/// over `level`.
pub fn init_tracing(format: LogFormat, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true).json())
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_formats() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn quiets_third_party_crates() {
        assert_eq!(
            default_directives(Level::INFO),
            "warn,depguard_core=info,depguard_state=info,depguard=info"
        );
        assert!(default_directives(Level::DEBUG).starts_with("info,"));
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing(LogFormat::Text, Level::INFO);
        init_tracing(LogFormat::Json, Level::DEBUG);
    }
}
