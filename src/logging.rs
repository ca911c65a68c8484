//! Tracing setup for the binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! whoever embeds it. `RUST_LOG` always wins over the default directive.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr `fmt` subscriber, JSON lines when `json` is set.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}
