//! Tracing subscriber setup shared by `camsend` and `camrecv`.

use crate::config::OutputConfig;

/// Install a global `tracing` subscriber.
///
/// Honors `RUST_LOG` if set, otherwise falls back to the level implied by
/// `output.verbose`. `output.quiet` drops everything below `WARN`.
pub fn init(output: &OutputConfig) {
    let default_level = if output.quiet {
        tracing::Level::ERROR
    } else {
        output.level()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if let Err(err) = subscriber.try_init() {
        eprintln!("tracing subscriber already set: {err}");
    }
}
