//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Log to stderr, honoring `RUST_LOG` unless `debug` forces verbose output.
pub fn init(debug: bool) {
    let filter = if debug {
        EnvFilter::new("leaderd=debug,leaderd_election=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
