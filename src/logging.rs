//! Logging setup for the binary
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! whoever embeds it. The CLI calls [`init`] once at startup.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_ONCE: Once = Once::new();

/// Filter used when `RUST_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "shadow_set=debug"
    } else {
        "shadow_set=info"
    }
}

/// Install the global subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over `verbose`. Later calls do nothing.
pub fn init(verbose: bool) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
        // Another subscriber may already be installed by an embedding program
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
        tracing::info!("still one subscriber");
    }

    #[test]
    fn verbose_lowers_the_default_level() {
        assert_eq!(default_directive(false), "shadow_set=info");
        assert_eq!(default_directive(true), "shadow_set=debug");
    }
}
