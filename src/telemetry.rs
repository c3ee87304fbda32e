//! Optional tracing bootstrap, compiled only with the `tracing` feature.
//!
//! Spans are emitted by the lifecycle entry points via `#[instrument]`; this
//! module only wires up a subscriber. Embedding applications that install
//! their own subscriber can skip [`init`] entirely.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

fn tracing_enabled_env() -> bool {
    std::env::var("TELEPRESENCE_TRACE").ok().as_deref() == Some("1")
        || std::env::var("RUST_LOG")
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
}

/// Installs a stderr fmt subscriber filtered by `RUST_LOG`. Safe to call more
/// than once; only the first call installs anything, and nothing is installed
/// unless `TELEPRESENCE_TRACE=1` or `RUST_LOG` is set.
pub fn init() {
    INIT.get_or_init(|| {
        if !tracing_enabled_env() {
            return;
        }
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("telepresence_client=info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_reentrant() {
        init();
        init();
    }
}
