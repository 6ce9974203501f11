//! Subscriber setup for binaries and tests that want to see what the cache
//! decides.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Installs a global subscriber. `verbose` raises the default filter from
/// `warn` to `info`, which includes one line per hit/miss decision.
/// `RUST_LOG` takes precedence over both.
pub fn init(verbose: bool) -> Result<(), TryInitError> {
    let default = if verbose {
        "graphchain=info"
    } else {
        "graphchain=warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
