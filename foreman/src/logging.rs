//! Development-time tracing for debugging the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics on stderr, filtered by
//!   `FOREMAN_LOG` (or `RUST_LOG`). Not persisted, not part of foreman's
//!   product output.
//!
//! - **Event journal (`io/journal`) and worker logs (`io/worker`)**: Product
//!   artifacts under `.foreman/`. Always written, unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither variable is set: warnings everywhere, plus the
/// orchestrator's own phase and handoff milestones.
const DEFAULT_FILTER: &str = "warn,foreman::session=info";

/// Initialize the stderr subscriber.
///
/// ```bash
/// FOREMAN_LOG=foreman=debug foreman run
/// ```
pub fn init() {
    let directives = filter_directives(|key| std::env::var(key).ok());
    let filter =
        EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

/// `FOREMAN_LOG`, then `RUST_LOG`, then [`DEFAULT_FILTER`]. Blank values are
/// ignored.
fn filter_directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["FOREMAN_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(&lookup)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}
