//! Subscriber setup for binaries and examples embedding a node.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the process that hosts it.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive() -> &'static str {
    "info,poolnode=debug"
}

/// Installs a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `fallback`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(fallback: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        assert!(EnvFilter::try_new(default_directive()).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing("warn");
        assert!(init_tracing("warn").is_err());
    }
}
