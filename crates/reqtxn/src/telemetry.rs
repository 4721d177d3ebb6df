// Log subscriber setup

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global `tracing` subscriber described by `config`.
///
/// Returns `false` if a global subscriber was already set; the existing one
/// is left in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
	let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	let result = match config.format {
		LogFormat::Text => registry
			.with(tracing_subscriber::fmt::layer().with_target(true))
			.try_init(),
		LogFormat::Json => registry
			.with(
				tracing_subscriber::fmt::layer()
					.json()
					.with_current_span(true)
					.with_target(true),
			)
			.try_init(),
	};
	result.is_ok()
}
