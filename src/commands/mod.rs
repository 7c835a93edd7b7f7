pub mod config;
pub mod daemon;
pub mod gateway;
pub mod update;
pub mod version;

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level. The daemon logs JSON lines;
/// interactive commands use the compact formatter.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().with_target(false).try_init()
    };
    // A subscriber may already be installed (tests); keep it.
    let _ = result;
}
