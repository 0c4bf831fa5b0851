//! Diagnostics bootstrap: error reports and the tracing subscriber.

use color_eyre::Report;
use std::sync::Once;

static INSTALL: Once = Once::new();

/// Install the report handler and the tracing subscriber. Safe to call
/// more than once; only the first call does anything.
pub fn diagnostics_setup() -> Result<(), Report> {
    let mut result = Ok(());
    INSTALL.call_once(|| {
        result = color_eyre::install();
        let _ = tracing_subscriber::fmt().with_target(false).try_init();
    });
    result
}

/// Turn off colored painting, for plain-text capture of IR dumps.
pub fn diagnostics_color_disable() {
    yansi::Paint::disable();
}
