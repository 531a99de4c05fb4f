//! Subscriber initialization

use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize console logging.
///
/// Honors `RUST_LOG`; falls back to `info`. Calling this more than once is a no-op,
/// so tests and examples can call it freely.
///
/// # Example
/// ```
/// use callkit_telemetry::init_telemetry;
/// init_telemetry("voice-call").expect("telemetry");
/// ```
pub fn init_telemetry(service_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_telemetry_with_filter(service_name, DEFAULT_FILTER)
}

/// Initialize console logging with an explicit fallback filter directive
/// (e.g. `"callkit_realtime=debug,info"`), still overridden by `RUST_LOG`.
pub fn init_telemetry_with_filter(
    service_name: &str,
    default_directive: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Validate up front so a bad directive is reported instead of silently ignored.
    let fallback = EnvFilter::try_new(default_directive)?;

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or(fallback);

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init();

        match installed {
            Ok(()) => tracing::info!(service.name = service_name, "Telemetry initialized"),
            // Another subscriber (e.g. a test harness) got there first.
            Err(e) => eprintln!("callkit-telemetry: subscriber already installed: {e}"),
        }
    });

    Ok(())
}
