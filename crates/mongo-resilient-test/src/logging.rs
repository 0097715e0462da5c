//! Test logging utilities
//!
//! Provides utilities for initializing logging in test environments and for
//! asserting on emitted events.

use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: Once = Once::new();

/// Initialize logging for tests (call once)
///
/// Honours `RUST_LOG`; output goes through the test harness capture.
///
/// # Examples
///
/// ```
/// use mongo_resilient_test::logging::init_test_logging;
///
/// init_test_logging();
/// ```
pub fn init_test_logging() {
	INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

/// A tracing layer that captures `[LEVEL] message` lines
#[derive(Clone, Default)]
pub struct LogCapture {
	logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
	/// Captured lines so far
	pub fn lines(&self) -> Vec<String> {
		self.logs.lock().map(|logs| logs.clone()).unwrap_or_default()
	}

	/// Whether a captured line at `level` contains `needle`
	pub fn contains(&self, level: tracing::Level, needle: &str) -> bool {
		let prefix = format!("[{}]", level);
		self.lines()
			.iter()
			.any(|line| line.starts_with(&prefix) && line.contains(needle))
	}
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LogCapture {
	fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
		struct MessageVisitor {
			message: String,
		}

		impl tracing::field::Visit for MessageVisitor {
			fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
				if field.name() == "message" {
					self.message = format!("{:?}", value);
				}
			}
		}

		let mut visitor = MessageVisitor {
			message: String::new(),
		};
		event.record(&mut visitor);

		if let Ok(mut logs) = self.logs.lock() {
			logs.push(format!("[{}] {}", event.metadata().level(), visitor.message));
		}
	}
}

/// Capture events on the current thread until the guard is dropped
///
/// Use with a current-thread runtime (the `#[tokio::test]` default) so the
/// events of spawned-free async code land on the same thread.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
	let capture = LogCapture::default();
	let guard = tracing_subscriber::registry()
		.with(capture.clone())
		.set_default();
	(capture, guard)
}
