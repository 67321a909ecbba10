//! Logging setup
//!
//! `RUST_LOG` takes precedence over the level passed in, so a deployment can
//! turn on `pagedtopic_partition=debug` without a rebuild.

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global fmt subscriber
///
/// Returns false when a subscriber was already installed, which makes the call
/// safe to repeat from tests.
pub fn init_logging(level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
