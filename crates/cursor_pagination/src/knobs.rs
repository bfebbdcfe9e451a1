//! Tunable limits and parameters for cursor pagination.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so they can be adjusted safely.
//!
//! All knobs can be overridden with an environment variable of the same name.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::{
    env_config,
    env_config_millis,
};

/// Largest page size a query shape may request. Every chain walk step reads a
/// full page, so this also bounds the documents read per step.
pub static PAGINATION_MAX_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("PAGINATION_MAX_PAGE_SIZE", 1000));

/// Largest page number a caller may jump to. Reaching page N for the first
/// time costs N reads, so this bounds the read amplification of one jump.
pub static PAGINATION_MAX_PAGE_NUMBER: LazyLock<usize> =
    LazyLock::new(|| env_config("PAGINATION_MAX_PAGE_NUMBER", 100_000));

/// Initial delay before resubscribing after a live page subscription fails.
pub static LIVE_VIEW_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    env_config_millis("LIVE_VIEW_INITIAL_BACKOFF_MS", Duration::from_millis(100))
});

/// Upper bound on the delay between live page resubscription attempts.
pub static LIVE_VIEW_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| env_config_millis("LIVE_VIEW_MAX_BACKOFF_MS", Duration::from_secs(15)));
