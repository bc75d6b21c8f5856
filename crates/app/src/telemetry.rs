use tracing_subscriber::EnvFilter;

use crate::settings::DEFAULT_LOG_FILTER;

/// Installs the global fmt subscriber on stderr so stdout stays free for the
/// console. `RUST_LOG` wins over `configured_filter`. Returns `false` if a
/// subscriber was already installed.
pub fn init_tracing(configured_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}
