//! MongoDB server fixture
//!
//! [`MongoServer`] owns a throwaway MongoDB container and hands out connect
//! targets for it, one database per test.

use rstest::fixture;
use std::time::Duration;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

const MONGO_IMAGE: &str = "mongo";
const MONGO_TAG: &str = "7.0";
const MONGO_PORT: u16 = 27017;

const START_ATTEMPTS: u32 = 3;
const START_BACKOFF: Duration = Duration::from_secs(2);

/// A running MongoDB server
///
/// The container stops when this value is dropped, so keep it alive for the
/// whole test.
pub struct MongoServer {
	_container: ContainerAsync<GenericImage>,
	host: String,
}

impl MongoServer {
	/// `host:port` the server listens on
	pub fn host(&self) -> &str {
		&self.host
	}

	/// Connect target for `database` with an explicit retry budget
	pub fn target(&self, database: &str, max_retries: usize) -> String {
		format!("mongodb://{}/{}?maxRetries={}", self.host, database, max_retries)
	}
}

impl std::fmt::Debug for MongoServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MongoServer").field("host", &self.host).finish()
	}
}

async fn start_server() -> Result<MongoServer, Box<dyn std::error::Error>> {
	let container = GenericImage::new(MONGO_IMAGE, MONGO_TAG)
		.with_exposed_port(MONGO_PORT.tcp())
		.with_wait_for(WaitFor::message_on_stdout("Waiting for connections"))
		.with_startup_timeout(Duration::from_secs(60))
		.start()
		.await?;
	let port = container.get_host_port_ipv4(MONGO_PORT).await?;

	Ok(MongoServer {
		_container: container,
		host: format!("127.0.0.1:{}", port),
	})
}

/// Fixture starting a MongoDB 7.0 server
///
/// Docker occasionally fails to start a container under load, so the start
/// is attempted a few times before the test panics.
#[fixture]
pub async fn mongodb_server() -> MongoServer {
	let mut last_error = None;

	for attempt in 1..=START_ATTEMPTS {
		match start_server().await {
			Ok(server) => {
				tracing::debug!(host = %server.host, attempt, "mongodb container ready");
				return server;
			}
			Err(e) => {
				tracing::warn!(
					attempt,
					max_attempts = START_ATTEMPTS,
					error = %e,
					"mongodb container failed to start"
				);
				last_error = Some(e);
				if attempt < START_ATTEMPTS {
					tokio::time::sleep(START_BACKOFF).await;
				}
			}
		}
	}

	panic!(
		"Failed to start MongoDB container after {} attempts: {:?}",
		START_ATTEMPTS, last_error
	);
}
