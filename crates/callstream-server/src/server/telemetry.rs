//! Log output for the server.
//!
//! Spans and events from `callstream` (with its `tracing` feature) and from
//! the handlers go through one `tracing-subscriber` registry. The filter is
//! read from `RUST_LOG` and defaults to `info`.
//!
//! ```bash
//! RUST_LOG=callstream=debug,info cargo run -p callstream-server
//! cargo run -p callstream-server -- --log-json
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Pretty output by default, one JSON object
/// per line when `json` is set.
pub fn init_telemetry(json: bool) -> anyhow::Result<()> {
    let pretty = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .with_file(true)
            .pretty()
    });
    let json = json.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .json()
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(pretty)
        .with(json)
        .try_init()?;

    Ok(())
}
