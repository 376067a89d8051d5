use std::env;

use gamestats_cache::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Dependencies log at `INFO` at most, our own crates at the configured level.
fn default_directives(level: LevelFilter) -> String {
    let dependencies = level.min(LevelFilter::INFO);
    format!("{dependencies},gamestats_cache={level},gamestats_stress={level}")
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let format = match format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    match format {
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => layer.pretty().boxed(),
    }
}

/// Installs the global subscriber: a console layer filtered by `RUST_LOG` (or the configured
/// level) and a layer forwarding errors and warnings to sentry.
///
/// # Safety
/// Sets `RUST_BACKTRACE` through [`std::env::set_var`], so this must be called before any other
/// thread is started.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees we are still single-threaded.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => EnvFilter::new(default_directives(config.logging.level)),
    };

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            Level::ERROR => EventFilter::Event | EventFilter::Log,
            Level::WARN => EventFilter::Breadcrumb | EventFilter::Log,
            Level::INFO => EventFilter::Breadcrumb,
            Level::DEBUG | Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer(config.logging.format).with_filter(filter))
        .with(sentry_layer)
        .init();
}

/// Reports a fatal error through the logger, or on stderr if logging is not set up.
pub fn ensure_log_error(error: &anyhow::Error) {
    if LevelFilter::current() >= LevelFilter::ERROR {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
