//! Logging initialization
//!
//! Process-scoped with a one-shot initializer; re-initialization is a
//! programmer error and panics. Log lines go to stderr so that subcommands
//! emitting data on stdout (such as the agent's `timestamp` helper) stay
//! machine-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `directive` overrides the default filter; `RUST_LOG` takes precedence
/// over both.
pub fn init(directive: Option<&str>) {
    let default = directive.unwrap_or("info,supernetes=debug");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();
}
