//! Process-wide tracing setup.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the fmt subscriber once per process. Safe to call from every
/// server constructor; later calls are no-ops, as are calls made after a
/// test harness already installed its own subscriber.
pub fn init() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}
