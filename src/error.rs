use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type alias for Result with LabellerError
pub type Result<T> = std::result::Result<T, LabellerError>;

/// Errors raised by the labelling pipeline and its collaborators
#[derive(Error, Debug)]
pub enum LabellerError {
    /// Nothing usable was left after content extraction
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The model provider failed the call
    #[error("Model call failed ({}): {message}", retry_label(.retryable))]
    ModelCall { message: String, retryable: bool },

    /// Model output did not match the expected structure
    #[error("Parse error: {0}")]
    Parse(String),

    /// Every attempt allowed by the retry policy failed
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// Label registry could not satisfy a request
    #[error("Label resolution error: {0}")]
    LabelResolution(String),

    /// Applying labels to a message failed
    #[error("Mailbox apply error: {0}")]
    MailboxApply(String),

    /// Run deadline reached or cancellation requested
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed (mailbox or model provider)
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// State management errors
    #[error("State error: {0}")]
    StateError(String),

    /// Classification cache could not be read or written
    #[error("Cache error: {0}")]
    CacheError(String),
}

fn retry_label(retryable: &bool) -> &'static str {
    if *retryable {
        "retryable"
    } else {
        "non-retryable"
    }
}

/// Serializable classification of an error attached to a message record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Extraction,
    ModelCall,
    Parse,
    RetryExhausted,
    LabelResolution,
    MailboxApply,
    Cancelled,
    Auth,
    Config,
    Internal,
}

impl LabellerError {
    /// Check if the error is transient and should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            LabellerError::ModelCall { retryable, .. } => *retryable,
            LabellerError::Parse(_)
            | LabellerError::RateLimitExceeded { .. }
            | LabellerError::ServerError { .. }
            | LabellerError::NetworkError(_) => true,
            _ => false,
        }
    }

    /// Errors that leave the whole run unable to proceed
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            LabellerError::AuthError(_) | LabellerError::ConfigError(_)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            LabellerError::Extraction(_) => FailureKind::Extraction,
            LabellerError::ModelCall { .. } => FailureKind::ModelCall,
            LabellerError::Parse(_) => FailureKind::Parse,
            LabellerError::RetryExhausted { .. } => FailureKind::RetryExhausted,
            LabellerError::LabelResolution(_) => FailureKind::LabelResolution,
            LabellerError::MailboxApply(_) => FailureKind::MailboxApply,
            LabellerError::Cancelled(_) => FailureKind::Cancelled,
            LabellerError::AuthError(_) => FailureKind::Auth,
            LabellerError::ConfigError(_) => FailureKind::Config,
            _ => FailureKind::Internal,
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// Accepts both the delay-seconds and the HTTP-date form. Falls back to
/// 5 seconds when the header is missing, invalid or in the past.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|when| when.duration_since(std::time::SystemTime::now()).ok())
        .map(|wait| wait.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for LabellerError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => LabellerError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    401 => LabellerError::AuthError(message),
                    404 => LabellerError::NotFound("Resource not found".to_string()),
                    400 => LabellerError::BadRequest(message),
                    403 => LabellerError::Forbidden(message),
                    500..=599 => LabellerError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => LabellerError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => {
                LabellerError::BadRequest(format!("{}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                LabellerError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => LabellerError::NetworkError(err.to_string()),
            _ => LabellerError::ApiError(error.to_string()),
        }
    }
}
