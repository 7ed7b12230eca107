// HTTP transport
// Pooled reqwest clients with retry and backoff, shared by all AM flows

use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Request, Response};

use crate::error::{FrodoError, Result};

/// HTTP transport shared by every AM flow
#[derive(Debug, Clone)]
pub struct Transport {
    /// Pooled client following redirects
    client: Client,

    /// Pooled client that never follows redirects, for authorize probes
    no_redirect_client: Client,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl Transport {
    /// Create a transport with the given timeouts (seconds) and retry limit
    pub fn new(connect_timeout: u64, request_timeout: u64, max_retries: u32) -> Result<Self> {
        let user_agent = concat!("frodo-auth/", env!("CARGO_PKG_VERSION"));

        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let no_redirect_client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create no-redirect HTTP client")?;

        Ok(Self {
            client,
            no_redirect_client,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Get the redirect-following client for building requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the no-redirect client for building authorize probes
    pub fn no_redirect_client(&self) -> &Client {
        &self.no_redirect_client
    }

    /// Execute a request with retry logic.
    /// Retries 429 and 5xx with exponential backoff; other non-success
    /// statuses become `FrodoError::Am` carrying the decoded error body.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let response = self
            .execute_internal(&self.client, request, self.max_retries)
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            response_body = %body,
            "AM request failed with error response"
        );
        Err(FrodoError::from_am_body(status.as_u16(), &body))
    }

    /// Execute a request without following redirects and without treating
    /// non-success statuses as errors. Callers interpret the status and
    /// `Location` header themselves.
    pub async fn execute_raw_no_redirect(&self, request: Request) -> Result<Response> {
        self.execute_internal(&self.no_redirect_client, request, self.max_retries)
            .await
    }

    /// Internal retry loop shared by both entry points
    async fn execute_internal(
        &self,
        client: &Client,
        request: Request,
        max_retries: u32,
    ) -> Result<Response> {
        let mut attempt = 0;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        loop {
            // Clone the request for this attempt
            let req = request.try_clone().ok_or_else(|| {
                FrodoError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            let result = client.execute(req).await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(
                        status = %status,
                        "Received HTTP response"
                    );

                    // 429 or 5xx: exponential backoff, everything else is terminal
                    if matches!(status.as_u16(), 429 | 500..=599) && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    return Ok(response);
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    // Network error - retry with backoff
                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(FrodoError::Http(e));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // Exponential backoff: base_delay * 2^attempt, with jitter
        // to avoid thundering herd
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }
}
