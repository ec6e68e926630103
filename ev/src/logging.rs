//! Logging setup for processes embedding the engine
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! left to whoever composes the process. `setup_logging` is the stock way to
//! do that.

use eyre::Result;
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

/// Map a configured level name to a tracing level
///
/// Unknown names fall back to INFO with a warning on stderr.
pub fn parse_level(level_str: Option<&str>) -> Level {
    let Some(s) = level_str else {
        debug!("parse_level: level_str is None, defaulting to INFO");
        return Level::INFO;
    };
    match s.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => {
            debug!(level = %s, "parse_level: unknown level, defaulting to INFO");
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            Level::INFO
        }
    }
}

/// Install a stderr subscriber filtered by `RUST_LOG` plus the given level
///
/// A subscriber that is already installed is kept; calling this twice is
/// not an error.
pub fn setup_logging(log_level: Option<&str>) -> Result<()> {
    let level = parse_level(log_level);

    let installed = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .try_init();
    if let Err(e) = installed {
        debug!(error = %e, "setup_logging: subscriber already installed, keeping it");
        return Ok(());
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_known_names() {
        assert_eq!(parse_level(Some("trace")), Level::TRACE);
        assert_eq!(parse_level(Some("Debug")), Level::DEBUG);
        assert_eq!(parse_level(Some("INFO")), Level::INFO);
        assert_eq!(parse_level(Some("warning")), Level::WARN);
        assert_eq!(parse_level(Some("error")), Level::ERROR);
    }

    #[test]
    fn test_parse_level_defaults_to_info() {
        assert_eq!(parse_level(None), Level::INFO);
        assert_eq!(parse_level(Some("loud")), Level::INFO);
    }

    #[test]
    fn test_second_setup_is_not_an_error() {
        assert!(setup_logging(Some("warn")).is_ok());
        assert!(setup_logging(Some("debug")).is_ok());
    }
}
