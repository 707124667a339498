//! Ambient logging. The engine does not invent its own logger trait: it
//! logs through the `log` facade, exactly as the rest of this crate's
//! idiom family does (see `log::log_enabled!` guards throughout the
//! streaming adapters). This module only provides a convenience
//! initializer for binaries and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs `env_logger` as the global logger, if one hasn't been
/// installed yet. Safe to call multiple times (e.g. once per test).
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(cfg!(test))
            .try_init();
    });
}
