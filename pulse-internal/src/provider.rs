use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::{ProviderConfig, ProviderKind, RetryConfig};
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::ledger::ActionType;

/// Structured result of a profile analysis.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAnalysis {
    /// 0 to 100.
    pub score: u8,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

/// Seam between the gateway and whatever produces the actual content. The
/// gateway's job ends at metering; content quality is the provider's
/// problem.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn generate(&self, action: ActionType, prompt: &str) -> Result<String, Error>;

    async fn analyze_profile(&self, profile: &str) -> Result<ProfileAnalysis, Error>;
}

pub fn provider_from_config(config: &ProviderConfig) -> Result<Arc<dyn ContentProvider>, Error> {
    match config.kind {
        ProviderKind::Template => Ok(Arc::new(TemplateProvider)),
        ProviderKind::Http => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "provider.base_url is required when provider.kind is `http`"
                        .to_string(),
                })
            })?;
            Ok(Arc::new(HttpProvider::new(
                base_url,
                config.api_key.clone(),
                Duration::from_millis(config.timeout_ms),
                config.retry,
            )?))
        }
    }
}

/// Parses a model response into a `ProfileAnalysis`. Models wrap JSON in
/// markdown fences or prose often enough that strict parsing would turn a
/// paid action into an error, so after a direct parse this retries on the
/// outermost brace pair before giving up. Scores beyond the scale clamp to
/// 100.
pub(crate) fn parse_analysis(raw: &str) -> Result<ProfileAnalysis, Error> {
    let trimmed = raw.trim();
    let mut parsed: Option<ProfileAnalysis> = serde_json::from_str(trimmed).ok();
    if parsed.is_none() {
        if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
            if start < end {
                parsed = serde_json::from_str(&trimmed[start..=end]).ok();
            }
        }
    }
    let mut analysis = parsed.ok_or_else(|| {
        Error::new(ErrorDetails::Provider {
            message: "analysis response was not valid JSON".to_string(),
            status_code: None,
        })
    })?;
    analysis.score = analysis.score.min(100);
    Ok(analysis)
}

/// Deterministic canned content. The development and test default; no
/// network, no keys.
pub struct TemplateProvider;

#[async_trait]
impl ContentProvider for TemplateProvider {
    async fn generate(&self, action: ActionType, prompt: &str) -> Result<String, Error> {
        let topic = prompt.trim();
        let content = match action {
            ActionType::Post => format!(
                "Most teams get {topic} wrong.\n\nThree things that actually move the \
                 needle:\n\n1. Start smaller than feels comfortable.\n2. Measure before \
                 and after.\n3. Share what you learn, including the misses.\n\nWhat has \
                 worked for you?"
            ),
            ActionType::Comment => format!(
                "Strong point about {topic}. The second-order effects are what most \
                 people miss; curious whether you saw the same pattern at scale."
            ),
            ActionType::Idea => format!(
                "Post idea: a before/after breakdown of {topic}, with the one metric \
                 that changed and the decision that moved it."
            ),
            ActionType::ProfileAnalysis => {
                return Err(Error::new(ErrorDetails::InternalError {
                    message: "profile analysis is not a generation action".to_string(),
                }));
            }
        };
        Ok(content)
    }

    async fn analyze_profile(&self, profile: &str) -> Result<ProfileAnalysis, Error> {
        let words = profile.split_whitespace().count();
        let score = u8::try_from(40 + words.min(120) / 2).unwrap_or(100);

        let mut strengths = Vec::new();
        let mut improvements = Vec::new();
        let lower = profile.to_lowercase();
        for (needle, strength, improvement) in [
            (
                "experience",
                "Work history is present",
                "Add a work history section",
            ),
            ("skill", "Skills are called out", "List concrete skills"),
        ] {
            if lower.contains(needle) {
                strengths.push(strength.to_string());
            } else {
                improvements.push(improvement.to_string());
            }
        }
        if words < 50 {
            improvements.push("Expand the profile beyond a short blurb".to_string());
        }

        Ok(ProfileAnalysis {
            score,
            summary: format!("Profile scores {score}/100 based on {words} words of content."),
            strengths,
            improvements,
        })
    }
}

/// Remote LLM-backed content service speaking plain JSON over HTTP.
pub struct HttpProvider {
    client: Client,
    base_url: Url,
    api_key: Option<SecretString>,
    retry: RetryConfig,
}

impl HttpProvider {
    pub fn new(
        base_url: Url,
        api_key: Option<SecretString>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self, Error> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            Error::new(ErrorDetails::Provider {
                message: format!("Failed to build HTTP client: {e}"),
                status_code: None,
            })
        })?;
        Ok(Self {
            client,
            base_url,
            api_key,
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(|e| {
            Error::new(ErrorDetails::Provider {
                message: format!("Invalid provider URL for `{path}`: {e}"),
                status_code: None,
            })
        })
    }

    /// POSTs the payload and returns the response body, mapping transport
    /// failures and non-2xx statuses to provider errors.
    async fn post(&self, url: Url, payload: &serde_json::Value) -> Result<String, Error> {
        let mut request = self.client.post(url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await.map_err(|e| {
            Error::new(ErrorDetails::Provider {
                message: format!("request failed: {}", DisplayOrDebugGateway::new(e)),
                status_code: None,
            })
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(ErrorDetails::Provider {
                message: format!("provider returned {status}"),
                status_code: Some(status),
            }));
        }
        response.text().await.map_err(|e| {
            Error::new(ErrorDetails::Provider {
                message: format!(
                    "failed to read provider response: {}",
                    DisplayOrDebugGateway::new(e)
                ),
                status_code: None,
            })
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    content: String,
}

#[async_trait]
impl ContentProvider for HttpProvider {
    async fn generate(&self, action: ActionType, prompt: &str) -> Result<String, Error> {
        let url = self.endpoint("generate")?;
        let payload = serde_json::json!({ "action": action, "prompt": prompt });
        let body = (|| async { self.post(url.clone(), &payload).await })
            .retry(self.retry.get_backoff())
            .await?;
        let parsed: GenerateResponse = serde_json::from_str(&body).map_err(|e| {
            Error::new(ErrorDetails::Provider {
                message: format!("generation response was not valid JSON: {e}"),
                status_code: None,
            })
        })?;
        Ok(parsed.content)
    }

    async fn analyze_profile(&self, profile: &str) -> Result<ProfileAnalysis, Error> {
        let url = self.endpoint("analysis")?;
        let payload = serde_json::json!({ "profile": profile });
        let body = (|| async { self.post(url.clone(), &payload).await })
            .retry(self.retry.get_backoff())
            .await?;
        parse_analysis(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_json_analysis_parses() {
        let analysis = parse_analysis(
            r#"{"score": 72, "summary": "Solid", "strengths": ["clear headline"]}"#,
        )
        .unwrap();
        assert_eq!(analysis.score, 72);
        assert_eq!(analysis.summary, "Solid");
        assert_eq!(analysis.strengths, vec!["clear headline"]);
        assert!(analysis.improvements.is_empty());
    }

    #[test]
    fn test_fenced_model_output_parses() {
        let analysis = parse_analysis("```json\n{\"score\": 55}\n```").unwrap();
        assert_eq!(analysis.score, 55);
    }

    #[test]
    fn test_prose_wrapped_json_parses() {
        let analysis = parse_analysis(
            "Sure! Here is the analysis you asked for: {\"score\": 88, \"summary\": \"Good\"} \
             Let me know if you need anything else.",
        )
        .unwrap();
        assert_eq!(analysis.score, 88);
    }

    #[test]
    fn test_unparseable_analysis_is_a_provider_error() {
        let err = parse_analysis("I could not analyze this profile.").unwrap_err();
        assert_eq!(
            err.status_code(),
            axum::http::StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_scores_above_the_scale_clamp() {
        let analysis = parse_analysis(r#"{"score": 150}"#).unwrap();
        assert_eq!(analysis.score, 100);
    }

    #[tokio::test]
    async fn test_template_provider_is_deterministic() {
        let first = TemplateProvider
            .generate(ActionType::Post, "hiring engineers")
            .await
            .unwrap();
        let second = TemplateProvider
            .generate(ActionType::Post, "hiring engineers")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first.contains("hiring engineers"));
    }

    #[tokio::test]
    async fn test_template_analysis_flags_missing_sections() {
        let analysis = TemplateProvider
            .analyze_profile("Short blurb, no sections at all.")
            .await
            .unwrap();
        assert!(analysis
            .improvements
            .contains(&"Add a work history section".to_string()));
        assert!(analysis
            .improvements
            .contains(&"Expand the profile beyond a short blurb".to_string()));
        assert!(analysis.score >= 40);
    }

    #[tokio::test]
    async fn test_template_analysis_credits_present_sections() {
        let profile = "Experience: ten years of platform work. Skills: Rust, Kubernetes, \
                       incident response."
            .repeat(5);
        let analysis = TemplateProvider.analyze_profile(&profile).await.unwrap();
        assert!(analysis
            .strengths
            .contains(&"Work history is present".to_string()));
        assert!(analysis
            .strengths
            .contains(&"Skills are called out".to_string()));
    }
}
