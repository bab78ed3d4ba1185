use std::sync::Arc;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::auth::Auth;
use crate::config::Config;
use crate::error::{Error, ErrorDetails};
use crate::notify::{notifier_from_config, Notifier};
use crate::plan::PlanPolicy;
use crate::provider::{provider_from_config, ContentProvider};
use crate::quota::{QuotaEvaluator, QuotaMetrics, UsageRecorder};
use crate::rate_limit::{AnonymousRateStore, InMemoryAnonymousRateStore, RedisAnonymousRateStore};
use crate::redis_client::RedisClient;
use crate::storage::memory::{InMemoryAccountStore, InMemoryLedgerStore};
use crate::storage::redis::{RedisAccountStore, RedisLedgerStore};
use crate::storage::{AccountStore, LedgerStore};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub auth: Auth,
    pub policy: Arc<PlanPolicy>,
    pub accounts: Arc<dyn AccountStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub evaluator: Arc<QuotaEvaluator>,
    pub recorder: Arc<UsageRecorder>,
    pub provider: Arc<dyn ContentProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<QuotaMetrics>,
}
pub type AppState = axum::extract::State<AppStateData>;

struct Stores {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerStore>,
    anonymous: Arc<dyn AnonymousRateStore>,
}

impl AppStateData {
    /// Wires stores, evaluator, recorder, provider and notifier from the
    /// config. Redis backends when a URL is configured (or `PULSE_REDIS_URL`
    /// is set), in-memory otherwise.
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let policy = Arc::new(config.policy()?);
        let metrics = Arc::new(QuotaMetrics::default());
        let stores = setup_stores(&config).await?;
        let auth = setup_authentication(&config);
        let provider = provider_from_config(&config.provider)?;
        let notifier = notifier_from_config(&config.notifier)?;

        let evaluator = Arc::new(QuotaEvaluator::new(
            Arc::clone(&stores.accounts),
            Arc::clone(&stores.ledger),
            Arc::clone(&stores.anonymous),
            Arc::clone(&policy),
            Arc::clone(&metrics),
            config.quota_settings(),
        ));
        let recorder = Arc::new(UsageRecorder::new(
            Arc::clone(&stores.accounts),
            Arc::clone(&stores.ledger),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            auth,
            policy,
            accounts: stores.accounts,
            ledger: stores.ledger,
            evaluator,
            recorder,
            provider,
            notifier,
            metrics,
        })
    }
}

pub fn setup_authentication(config: &Config) -> Auth {
    if config.gateway.authentication.enabled {
        tracing::info!(
            "API key authentication enabled with {} configured keys",
            config.gateway.authentication.keys.len()
        );
    } else {
        tracing::warn!("Authentication disabled: bearer tokens pass through as user ids");
    }
    Auth::new(
        config.gateway.authentication.enabled,
        config.gateway.authentication.keys.clone(),
    )
}

async fn setup_stores(config: &Config) -> Result<Stores, Error> {
    match config.redis_url() {
        Some(url) if !url.is_empty() => {
            let client = Arc::new(RedisClient::new(&url, config.redis.timeout_ms).await?);
            tracing::info!("Redis stores initialized");
            Ok(Stores {
                accounts: Arc::new(RedisAccountStore::new(Arc::clone(&client))),
                ledger: Arc::new(RedisLedgerStore::new(Arc::clone(&client))),
                anonymous: Arc::new(RedisAnonymousRateStore::new(client)),
            })
        }
        _ => {
            tracing::warn!(
                "No Redis URL configured, using in-memory stores (single replica only)"
            );
            Ok(Stores {
                accounts: Arc::new(InMemoryAccountStore::new()),
                ledger: Arc::new(InMemoryLedgerStore::new()),
                anonymous: Arc::new(InMemoryAnonymousRateStore::new()),
            })
        }
    }
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // Convert the entire body into `serde_json::Value`
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
