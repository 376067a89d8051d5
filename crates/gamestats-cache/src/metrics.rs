//! Statsd reporting for the cache.
//!
//! Nothing is sent until [`configure_statsd`] was called once for the process. Until then every
//! [`metric!`](crate::metric) invocation is a cheap no-op, which is also what tests run with.

use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{BufferedUdpMetricSink, QueuingMetricSink, StatsdClient};

static STATSD: OnceLock<StatsdClient> = OnceLock::new();

/// Traits needed by the [`metric!`](crate::metric) expansions.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Every metric name gets `prefix` prepended and carries the given `tags`. Metrics are buffered
/// and flushed from a background thread. Only the first call per process has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let addr = addrs.first().context("statsd host resolved to no address")?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = BufferedUdpMetricSink::from(&addrs[..], socket)
        .context("failed to create statsd sink")?;

    let mut builder = StatsdClient::builder(prefix, QueuingMetricSink::from(sink))
        .with_error_handler(|error| tracing::debug!(%error, "Failed to send metric"));
    for (key, value) in tags {
        builder = builder.with_tag(key, value);
    }

    if STATSD.set(builder.build()).is_err() {
        tracing::warn!("Metrics were already configured, ignoring statsd at {}", addr);
    } else {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    Ok(())
}

/// Calls `f` with the statsd client, or returns the default if metrics are not configured.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&StatsdClient) -> R,
    R: Default,
{
    STATSD.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge or timer with optional `key => value` tags.
///
/// ```ignore
/// metric!(counter("gamestats.fetch") += 1, "mode" => "single");
/// metric!(gauge("gamestats.entries") = 42);
/// metric!(timer("gamestats.stress.op") = elapsed);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        #[allow(unused_imports)]
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.$method($id, $value)$(.with_tag($k, $v))*.send();
        })
    }};
}
