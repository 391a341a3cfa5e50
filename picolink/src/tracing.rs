//! Logging setup for the daemon.
//!
//! `picolinkd` calls [`init_journald_or_stdout`] once, before anything else
//! logs. Library modules pull the event macros in with
//! `use crate::tracing::prelude::*`.

use std::env;
use time::{macros::format_description, OffsetDateTime};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install the global subscriber.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald. Everywhere
/// else, or if the journal socket is unavailable, they go to stdout with a
/// local wall-clock timestamp.
pub fn init_journald_or_stdout() {
    let journald = env::var_os("JOURNAL_STREAM").map(|_| tracing_journald::layer());

    match journald {
        Some(Ok(layer)) => tracing_subscriber::registry()
            .with(level_filter())
            .with(layer)
            .init(),
        Some(Err(e)) => {
            init_stdout();
            warn!(error = %e, "journald unavailable, logging to stdout");
        }
        None => init_stdout(),
    }
}

// RUST_LOG selects levels per target; anything it leaves out logs at INFO.
fn level_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn init_stdout() {
    tracing_subscriber::registry()
        .with(level_filter())
        .with(tracing_subscriber::fmt::layer().with_timer(WallClock))
        .init();
}

// HH:MM:SS in local time, falling back to UTC when the offset is unknown.
struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
