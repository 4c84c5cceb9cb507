//! Process-wide structured logging, built once at startup and handed down
//! by clone to every component. Adapted from the teacher's `flux::logging`
//! module: a `sloggers` TOML-configured terminal sink by default, with the
//! same config plumbing available for a caller-supplied config file.

pub use slog::Logger;
use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default root logger: terminal sink, debug level, stderr.
/// Matches the teacher's `flux::logging::init`, which hardcodes the same
/// TOML blob rather than building the terminal sink by hand.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(DEFAULT_CONFIG).expect("default logging config is well-formed");
    config.build_logger().expect("failed to build terminal logger")
}

/// Builds a root logger from a caller-supplied `sloggers` TOML config blob,
/// falling back to [`init`] if it can't be parsed or built. This is the
/// config-file hook the teacher's `init` left as a TODO.
pub fn init_from_toml(toml: &str) -> Logger {
    match serdeconv::from_toml_str::<LoggerConfig>(toml) {
        Ok(config) => config.build_logger().unwrap_or_else(|_| init()),
        Err(_) => init(),
    }
}
