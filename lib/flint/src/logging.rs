use sloggers::{Config, LoggerConfig};
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the default terminal logger used by services and tools.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing built-in logging config");

    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a TOML configuration file. The file must deserialize
/// into a `sloggers::LoggerConfig`.
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging configuration file");

    config.build_logger().expect("Error building logger")
}

/// Logger that swallows all records. Components take this when the caller
/// supplies no logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_builds_logger() {
        let log = init();
        info!(log, "logger constructed"; "context" => "test");
    }

    #[test]
    fn test_discard_swallows_records() {
        let log = discard();
        debug!(log, "never rendered"; "context" => "test");
    }
}
