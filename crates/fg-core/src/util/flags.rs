//! Process-wide measurement switches.
//!
//! These can flip at runtime through the control surface, so they are read
//! at every use instead of being threaded through constructors.

use super::env::env_bool;
use std::sync::atomic::{AtomicBool, Ordering};

static UNIFIED_DELAY: AtomicBool = AtomicBool::new(false);
static STORE_SELECTED: AtomicBool = AtomicBool::new(true);

/// When set, delay probes issue a second request over the established
/// connection and report its round trip, excluding connection setup.
pub fn unified_delay() -> bool {
    UNIFIED_DELAY.load(Ordering::Relaxed)
}

pub fn set_unified_delay(value: bool) {
    UNIFIED_DELAY.store(value, Ordering::Relaxed);
}

/// Whether the outer persistence layer should remember manual group
/// selections across restarts. The core only carries the switch.
pub fn store_selected() -> bool {
    STORE_SELECTED.load(Ordering::Relaxed)
}

pub fn set_store_selected(value: bool) {
    STORE_SELECTED.store(value, Ordering::Relaxed);
}

/// Applies `FG_UNIFIED_DELAY` and `FG_STORE_SELECTED` when present in the
/// environment; absent variables keep the built-in defaults.
pub fn init_from_env() {
    if std::env::var_os("FG_UNIFIED_DELAY").is_some() {
        set_unified_delay(env_bool("FG_UNIFIED_DELAY"));
    }
    if std::env::var_os("FG_STORE_SELECTED").is_some() {
        set_store_selected(env_bool("FG_STORE_SELECTED"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        assert!(store_selected());
        set_store_selected(false);
        assert!(!store_selected());
        set_store_selected(true);

        assert!(!unified_delay());
        set_unified_delay(true);
        assert!(unified_delay());
        set_unified_delay(false);
    }
}
