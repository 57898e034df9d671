//! Logging plumbing shared by both halves of the bus.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the default terminal logger writing to stderr.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("builtin logger config must parse");

    config.build_logger().expect("failed to build the terminal logger")
}

/// Child logger for a component, or a discarding root when the caller did
/// not supply one.
pub(crate) fn component<'a, L: Into<Option<&'a Logger>>>(log: L, name: &'static str) -> Logger {
    match log.into() {
        Some(log) => log.new(o!("component" => name)),
        None => Logger::root(Discard, o!()),
    }
}
