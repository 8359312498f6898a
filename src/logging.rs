use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, fmt::time::Uptime, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Fails instead of panicking when a subscriber is already installed, so test binaries and
/// embedded nodes can call it freely.
pub fn init_tracing(json: bool, default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_timer(Uptime::default());

    let installed = if json {
        builder.json().flatten_event(true).with_ansi(false).try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
