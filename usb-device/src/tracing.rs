//! Tracing setup, tailored to this program.
//!
//! Call [`init_journald_or_stderr`] once at startup. The rest of the crate
//! uses `crate::tracing::prelude::*` for the level macros.

use std::env;
use time::OffsetDateTime;
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

/// Install a tracing subscriber.
///
/// Under systemd (JOURNAL_STREAM set) log to journald; otherwise to stderr.
/// Command output itself goes to stdout and must stay parseable, so the
/// subscriber never writes there.
pub fn init_journald_or_stderr() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
            return;
        }
        use_stderr();
        error!("Failed to initialize journald logging, using stderr.");
    } else {
        use_stderr();
    }
}

// Filter via RUST_LOG, defaulting to WARN so one-shot CLI invocations stay
// quiet. The agent raises its own default to INFO in `hub watch`.
fn use_stderr() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ClockTimer)
                .with_target(true)
                .compact(),
        )
        .init();
}

/// Same as [`init_journald_or_stderr`] but with an INFO default, for the
/// long-running agent where progress lines are the point.
pub fn init_agent() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "usb_device=info");
    }
    init_journald_or_stderr();
}

// Seconds-resolution local timestamps; the default formatter's UTC
// nanosecond strings drown the actual content.
struct ClockTimer;

impl FormatTime for ClockTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?,
        )
    }
}
