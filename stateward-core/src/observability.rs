/*!
Observability for the Stateward engine.

- Structured logging through `tracing-subscriber` with an `EnvFilter`
- Prometheus counters and histograms behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, StatewardError};

/// Directive applied when `RUST_LOG` does not mention the engine
pub const DEFAULT_DIRECTIVE: &str = "stateward=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<StatewardMetrics>> = OnceLock::new();

/// Engine metrics, registered in a private Prometheus registry
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct StatewardMetrics {
    pub saves_total: IntCounter,
    pub saves_skipped_total: IntCounter,
    pub compression_fallbacks_total: IntCounter,
    pub restores_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub state_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl StatewardMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(|e| {
                StatewardError::storage(format!("Failed to create {name} metric: {e}"))
            })?;
            registry.register(Box::new(counter.clone())).map_err(|e| {
                StatewardError::storage(format!("Failed to register {name}: {e}"))
            })?;
            Ok(counter)
        };

        let saves_total = counter("stateward_saves_total", "Application state saves written")?;
        let saves_skipped_total = counter(
            "stateward_saves_skipped_total",
            "Saves skipped (no changes, in progress or too large)",
        )?;
        let compression_fallbacks_total = counter(
            "stateward_compression_fallbacks_total",
            "Payloads stored uncompressed after a delegate failure or timeout",
        )?;
        let restores_total = counter("stateward_restores_total", "Successful state restores")?;
        let cache_hits_total = counter(
            "stateward_cache_hits_total",
            "Collections served from a fresh local cache",
        )?;
        let cache_misses_total = counter(
            "stateward_cache_misses_total",
            "Collections fetched because the cache was stale or unusable",
        )?;

        let state_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "stateward_state_size_bytes",
                "Serialized application state size in bytes",
            )
            .buckets(vec![256.0, 1024.0, 16_384.0, 262_144.0, 1_048_576.0, 5_242_880.0]),
        )
        .map_err(|e| {
            StatewardError::storage(format!("Failed to create state_size_bytes metric: {e}"))
        })?;
        registry
            .register(Box::new(state_size_bytes.clone()))
            .map_err(|e| {
                StatewardError::storage(format!("Failed to register state_size_bytes: {e}"))
            })?;

        Ok(Self {
            saves_total,
            saves_skipped_total,
            compression_fallbacks_total,
            restores_total,
            cache_hits_total,
            cache_misses_total,
            state_size_bytes,
            registry,
        })
    }

    /// Global metrics instance; `None` if registration failed
    pub fn global() -> Option<&'static StatewardMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to initialize metrics");
                    None
                }
            })
            .as_ref()
    }

    /// Encode all metrics in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| StatewardError::storage(format!("Failed to encode metrics: {e}")))
    }
}

/// Run `f` against the global metrics, if they initialized
#[cfg(feature = "metrics")]
pub fn with_metrics(f: impl FnOnce(&StatewardMetrics)) {
    if let Some(metrics) = StatewardMetrics::global() {
        f(metrics);
    }
}

/// Encode the global metrics, or an empty string when unavailable
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    match StatewardMetrics::global() {
        Some(metrics) => metrics.gather_metrics(),
        None => Ok(String::new()),
    }
}

/// Install the global tracing subscriber
///
/// `json` selects JSON lines instead of the compact human format. The
/// filter comes from `RUST_LOG` with [`DEFAULT_DIRECTIVE`] added.
pub fn init_tracing(json: bool) -> Result<()> {
    let directive = DEFAULT_DIRECTIVE
        .parse()
        .map_err(|e| StatewardError::validation(format!("bad log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let result = if json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer().compact().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(layer))
    };

    result.map_err(|e| {
        StatewardError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    #[cfg(feature = "metrics")]
    StatewardMetrics::global();

    tracing::debug!("Stateward tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        let directive: std::result::Result<tracing_subscriber::filter::Directive, _> =
            DEFAULT_DIRECTIVE.parse();
        assert!(directive.is_ok());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        with_metrics(|m| {
            m.saves_total.inc();
            m.state_size_bytes.observe(2048.0);
        });

        let text = gather_metrics().unwrap();
        assert!(text.contains("stateward_saves_total"));
        assert!(text.contains("stateward_state_size_bytes"));
    }
}
