//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{LogFormat, LoggingConfig};

/// Level from the flags, falling back to the configured level.
/// `-q` wins over `-v`.
fn level(config: &LoggingConfig, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => config.level.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces the level.
pub fn init(config: &LoggingConfig, verbose: u8, quiet: bool) -> std::io::Result<()> {
    let level = level(config, verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let writer = if config.output_path.is_empty() {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.output_path)?;
        BoxMakeWriter::new(Mutex::new(file))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match config.format {
        LogFormat::Json => builder.json().with_current_span(false).init(),
        LogFormat::Console => builder.with_target(false).init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_precedence() {
        let config = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(level(&config, 0, false), Level::WARN);
        assert_eq!(level(&config, 1, false), Level::DEBUG);
        assert_eq!(level(&config, 3, false), Level::TRACE);
        assert_eq!(level(&config, 2, true), Level::ERROR);
    }

    #[test]
    fn test_unparseable_level_defaults_to_info() {
        let config = LoggingConfig {
            level: "chatty".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(level(&config, 0, false), Level::INFO);
    }
}
