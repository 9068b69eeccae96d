//! Error kinds for the collector.
//!
//! Almost everything in a collection pass is best-effort: a missing selector,
//! a dead strategy, or an unparseable payload falls through to the next
//! attempt and at worst annotates a record. The variants here are the few
//! conditions that are allowed to stop more than one step.

use thiserror::Error;

/// Errors that abort more than a single extraction attempt.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The entry listing rendered no extractable cards under any selector
    /// within the initial timeout. The only condition that aborts a pass.
    #[error("no listing cards rendered at {url} within {timeout_ms}ms")]
    NoListingRendered { url: String, timeout_ms: u64 },

    /// No usable Chromium binary was found.
    #[error("chromium not found; set BAZAAR_CHROMIUM_PATH or run `bazaar doctor`")]
    ChromiumNotFound,

    /// The browser process failed to launch or wire up.
    #[error("browser launch failed: {0}")]
    Launch(String),
}
