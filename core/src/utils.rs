//! Small shared helpers: task spawning and log subscriber setup.

use futures::Future;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, Subscriber};
use tracing_subscriber::{
	fmt::format::{self, FmtSpan},
	EnvFilter, FmtSubscriber,
};

/// Spawns a task that stays attached to the caller's tracing span, so
/// worker logs keep their connection context.
pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

/// Human-readable subscriber for interactive runs. `RUST_LOG` overrides the
/// given default level.
pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(format!("{log_level}"))),
		)
		.with_span_events(FmtSpan::CLOSE)
		.finish()
}

/// Machine-readable JSON subscriber for deployments.
pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(format!("{log_level}"))),
		)
		.event_format(format::json())
		.fmt_fields(format::JsonFields::new())
		.finish()
}
