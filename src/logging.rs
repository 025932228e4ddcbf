//! tracing-subscriber setup for the `scanrun` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter: `--verbose` forces debug, otherwise `RUST_LOG` wins
/// over the configured level. An invalid level falls back to `info`.
pub fn build_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    match config.level.parse::<EnvFilter>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!(
                "WARN: log level '{}' is not a valid tracing filter ({}); falling back to 'info'",
                config.level, e
            );
            EnvFilter::new("info")
        }
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_filter(config, verbose))
        .with_target(false)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
}
