//! Tracing subscriber setup.

use crate::config::LogOpts;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the level implied by the flags.
pub fn init(opts: &LogOpts) {
    let default_level = if opts.debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(opts.debug || opts.json)
        .with_line_number(opts.debug || opts.json);

    if opts.json {
        builder.json().flatten_event(true).init();
    } else if opts.devel {
        builder.pretty().init();
    } else {
        builder.init();
    }
}
