//! Thin facade over `slog` so library crates don't each wrangle drain setup.
//!
//! Components take a `&Logger` and derive child loggers with `log.new(o!())`;
//! anything constructed without one falls back to a `Discard` root.

pub use slog::{debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a logger from a TOML sink description (the `sloggers` config
/// format). Used by binaries that read their log setup from a config file.
pub fn from_toml(config: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(|err| err.to_string())?;
    config.build_logger().map_err(|err| err.to_string())
}

/// Default terminal logger writing human-readable records to stderr.
pub fn terminal() -> Logger {
    from_toml(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("builtin terminal logging config must parse")
}

/// A logger that swallows everything. Stand-in wherever a component is
/// constructed without a parent logger.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_bad_config() {
        assert!(from_toml("type = \"no-such-sink\"").is_err());
    }

    #[test]
    fn test_null_logger_is_silent() {
        let log = null();
        debug!(log, "goes nowhere"; "key" => 1);
    }
}
