pub mod auth;
pub mod config; // gateway config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod ledger;
pub mod notify; // trial lifecycle notifications
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod plan; // plan catalog and limit policy
pub mod provider; // content generation backends
pub mod quota; // quota evaluation, enforcement, and recording
pub mod rate_limit; // anonymous rate limiting
pub mod redis_client; // redis client
pub mod storage;
pub mod subscription; // subscription lifecycle
pub mod sweeper; // background expiry sweep
