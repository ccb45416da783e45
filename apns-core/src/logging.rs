//! Optional subscriber installer for binaries embedding this crate.
//! Never called by the library itself — consumers own their own `tracing`
//! setup; this just saves them rewriting the boilerplate.

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`/`EnvFilter`
/// defaults, and bridges the `log` crate into `tracing` so any transitive
/// dependency still using `log` shows up too.
///
/// Panics if a global subscriber is already set. Call at most once, from a
/// binary's `main`, never from library code.
pub fn install_default_subscriber() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .event_format(fmt::format())
        .try_init()
        .expect("could not set global tracing subscriber");
    LogTracer::init().expect("could not bridge `log` into `tracing`");
}
