use std::future::Future;

use redis::aio::MultiplexedConnection;
use tokio::time::{timeout, Duration};

use crate::error::{Error, ErrorDetails};

/// Shared Redis handle for the distributed store backends. Multiplexed
/// connections are cheap to clone; every operation works on its own clone.
pub struct RedisClient {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl RedisClient {
    pub async fn new(url: &str, timeout_ms: u64) -> Result<Self, Error> {
        let conn = Self::init_conn(url).await.map_err(|e| {
            tracing::error!("Failed to connect to Redis: {e}");
            e
        })?;
        Ok(Self {
            conn,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    async fn init_conn(url: &str) -> Result<MultiplexedConnection, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok(conn)
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Runs a Redis operation under the configured timeout. Driver errors and
    /// timeouts both come back as `StoreUnavailable`; no accounting operation
    /// may block past the deadline.
    pub async fn run<T, F>(&self, op_name: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, redis::RedisError>> + Send,
    {
        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::StoreUnavailable {
                message: format!("Redis {op_name} failed: {e}"),
            })),
            Err(_) => Err(Error::new(ErrorDetails::StoreUnavailable {
                message: format!(
                    "Redis {op_name} timed out after {}ms",
                    self.timeout.as_millis()
                ),
            })),
        }
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection();
        self.run("PING", async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }
}
