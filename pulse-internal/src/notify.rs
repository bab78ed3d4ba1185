use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

use crate::config::{NotifierConfig, NotifierKind, RetryConfig};
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};

/// Template identifiers understood by the email delivery pipeline. The
/// pipeline owns subject lines and rendering; the gateway only names the
/// template and supplies its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmailTemplate {
    TrialEndingSoon,
    TrialExpired,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: &str, template: EmailTemplate, data: Value)
        -> Result<(), Error>;
}

/// Spawns the send so callers never wait on delivery. Failures are logged
/// with enough context to replay by hand.
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    user_id: String,
    template: EmailTemplate,
    data: Value,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&user_id, template, data).await {
            error!("Failed to send {template} notification to user {user_id}: {e}");
        }
    })
}

pub fn notifier_from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, Error> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "notifier.endpoint is required when notifier.kind is `http`"
                        .to_string(),
                })
            })?;
            Ok(Arc::new(HttpNotifier::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
                config.retry,
            )?))
        }
    }
}

/// Logs the notification instead of delivering it. The development default.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        user_id: &str,
        template: EmailTemplate,
        data: Value,
    ) -> Result<(), Error> {
        info!("Notification {template} for user {user_id}: {data}");
        Ok(())
    }
}

/// POSTs `(userId, templateName, templateData)` to a webhook endpoint with
/// bounded retry.
pub struct HttpNotifier {
    client: Client,
    endpoint: Url,
    retry: RetryConfig,
}

impl HttpNotifier {
    pub fn new(endpoint: Url, timeout: Duration, retry: RetryConfig) -> Result<Self, Error> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            Error::new(ErrorDetails::Notification {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })?;
        Ok(Self {
            client,
            endpoint,
            retry,
        })
    }

    fn payload(user_id: &str, template: EmailTemplate, data: &Value) -> Value {
        serde_json::json!({
            "userId": user_id,
            "templateName": template,
            "templateData": data,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(
        &self,
        user_id: &str,
        template: EmailTemplate,
        data: Value,
    ) -> Result<(), Error> {
        let payload = Self::payload(user_id, template, &data);
        let send_once = || async {
            let response = self
                .client
                .post(self.endpoint.clone())
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    Error::new(ErrorDetails::Notification {
                        message: format!("endpoint unreachable: {}", DisplayOrDebugGateway::new(e)),
                    })
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::new(ErrorDetails::Notification {
                    message: format!("endpoint returned {status}"),
                }));
            }
            Ok(())
        };
        send_once.retry(self.retry.get_backoff()).await
    }
}
