use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::{env_flag, env_opt};

/// Fallback filter for the crawler binary: crate at debug, noisy HTTP/SQL/HTML
/// internals kept quiet.
pub const DEFAULT_FILTER: &str =
    "info,systems_crawler=debug,sqlx=warn,hyper=warn,reqwest=warn,html5ever=error,selectors=error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub filter: String,
    /// `LOG_ANSI`, on by default; off for log shippers that keep escape codes.
    pub ansi: bool,
    /// `LOG_SOURCE_LOCATION`: file and line on every record.
    pub source_location: bool,
}

impl LogOptions {
    /// `RUST_LOG` wins over `default_filter`.
    pub fn from_env(default_filter: &str) -> Self {
        Self {
            filter: env_opt("RUST_LOG").unwrap_or_else(|| default_filter.to_string()),
            ansi: env_flag("LOG_ANSI", true),
            source_location: env_flag("LOG_SOURCE_LOCATION", true),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, anyhow::Error> {
        EnvFilter::try_new(&self.filter)
            .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {}", self.filter, e))
    }
}

/// Global fmt subscriber shared by every crawl command.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    init_with(&LogOptions::from_env(default_filter))
}

pub fn init_with(options: &LogOptions) -> Result<(), anyhow::Error> {
    SubscriberBuilder::default()
        .with_env_filter(options.env_filter()?)
        .with_ansi(options.ansi)
        .with_target(true)
        .with_line_number(options.source_location)
        .with_file(options.source_location)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        let options = LogOptions {
            filter: DEFAULT_FILTER.to_string(),
            ansi: false,
            source_location: true,
        };
        assert!(options.env_filter().is_ok());
    }

    #[test]
    fn bad_filter_is_reported() {
        let options = LogOptions {
            filter: "systems_crawler=loud".to_string(),
            ansi: false,
            source_location: false,
        };
        let err = options.env_filter().unwrap_err();
        assert!(err.to_string().contains("systems_crawler=loud"));
    }
}
