// Error handling module
// Defines library error types and AM error-body decoding

use thiserror::Error;

/// Errors that can occur while obtaining or refreshing tokens
#[derive(Error, Debug)]
pub enum FrodoError {
    /// Missing or inconsistent connection settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Deployment type resolved to something the caller excluded
    #[error("Unsupported deployment type '{deployment_type}', allowed: {allowed}")]
    UnsupportedDeploymentType {
        deployment_type: String,
        allowed: String,
    },

    /// Journey requested a second factor this library cannot automate
    #[error("Unsupported 2FA factor: {factor}")]
    UnsupportedFactor { factor: String },

    /// Journey requested a one-time code but no handler is registered
    #[error("2FA code required but no callback handler is registered")]
    MissingCallbackHandler,

    /// Login completed without producing a usable token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Token cache failure
    #[error("Token cache error: {0}")]
    Cache(#[from] CacheError),

    /// Error response from the AM instance
    #[error("AM error: {status} {error} - {description}")]
    Am {
        status: u16,
        error: String,
        description: String,
    },

    /// Transport failure after retries were exhausted
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FrodoError {
    /// Builds an AM error from a response body in either the OAuth2 shape
    /// (`error`/`error_description`) or the JSON API shape (`code`/`reason`/`message`).
    pub fn from_am_body(status: u16, body: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
                let description = value
                    .get("error_description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                return FrodoError::Am {
                    status,
                    error: error.to_string(),
                    description: description.to_string(),
                };
            }
            if let Some(message) = value.get("message").and_then(|v| v.as_str()) {
                let reason = value
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("error");
                return FrodoError::Am {
                    status,
                    error: reason.to_string(),
                    description: message.to_string(),
                };
            }
        }
        // Not a recognized error document, keep a truncated raw body
        let snippet: String = body.chars().take(200).collect();
        FrodoError::Am {
            status,
            error: "unknown".to_string(),
            description: snippet,
        }
    }
}

/// Errors local to the token cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// No valid entry for the requested host/realm/type/subject
    #[error("no matching token in cache")]
    NotFound,

    /// Token type has no derivable subject on this context
    #[error("cannot derive a cache subject: {0}")]
    Subject(String),

    /// Payload encryption or decryption failed
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Cache file could not be read or written
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Cache file content is not valid JSON
    #[error("cache serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, FrodoError>;
