use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::{Debug, Display};
use tokio::sync::OnceCell;

use crate::quota::Decision;

/// Controls whether to include verbose upstream details in error output
///
/// When true:
/// - Raw provider request/response details are logged for provider errors
/// - Store errors include the underlying driver message in response bodies
///
/// WARNING: Setting this to true will expose potentially sensitive request/response
/// data in logs and error responses. Use with caution.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report at https://github.com/linkedinpulse/pulse/issues/new";

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *DEBUG.get().unwrap_or(&false) {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Builds the JSON body returned to HTTP callers.
    ///
    /// Quota denials carry the full decision so clients can render
    /// remaining/limit and follow the upgrade redirect without a second call.
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        match self.get_details() {
            ErrorDetails::QuotaExceeded { decision } => {
                let mut body = serde_json::to_value(decision).unwrap_or_else(|_| json!({}));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("error".to_string(), Value::String(self.to_string()));
                }
                (self.status_code(), body)
            }
            _ => (self.status_code(), json!({"error": self.to_string()})),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    IdentityMissing {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidPlan {
        plan: String,
    },
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Notification {
        message: String,
    },
    Observability {
        message: String,
    },
    Provider {
        message: String,
        status_code: Option<StatusCode>,
    },
    QuotaExceeded {
        decision: Decision,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
    Unauthenticated {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::IdentityMissing { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidPlan { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Notification { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::Provider { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::Unauthenticated { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::IdentityMissing { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidPlan { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Notification { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Provider { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::IdentityMissing { message } => {
                write!(f, "Identity missing: {message}")
            }
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidPlan { plan } => {
                write!(f, "Unknown plan: `{plan}`")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::Notification { message } => {
                write!(f, "Error dispatching notification: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::Provider {
                message,
                status_code,
            } => match status_code {
                Some(code) => write!(f, "Error from content provider ({code}): {message}"),
                None => write!(f, "Error from content provider: {message}"),
            },
            ErrorDetails::QuotaExceeded { decision } => match &decision.message {
                Some(message) => write!(f, "{message}"),
                None => write!(f, "Usage limit reached"),
            },
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Error serializing data: {message}")
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Store unavailable: {message}")
            }
            ErrorDetails::Unauthenticated { message } => write!(f, "{message}"),
        }
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
