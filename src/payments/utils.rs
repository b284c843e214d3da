use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// JSON-over-HTTPS client shared by the gateways.
///
/// Retries are opt-in per call: payment creation must never be resent
/// blindly, status queries may be.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            PaymentError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            PaymentError::NetworkError {
                message: format!("{} request failed: {}", self.provider, err),
            }
        }
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &JsonValue,
        max_retries: u32,
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            let response = self
                .client
                .post(url)
                .timeout(self.timeout)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await
                .map_err(|e| self.classify(e));

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.map_err(|e| self.classify(e))?;
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::InvalidResponse {
                                message: format!("{}: {}", self.provider, e),
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", self.provider),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < max_retries {
                        warn!(
                            provider = self.provider,
                            status = %status,
                            attempt = attempt + 1,
                            "provider server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(PaymentError::ProviderError {
                        provider: self.provider.to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                        retryable: status.is_server_error(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: format!("{} request failed", self.provider),
        }))
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// First and last four characters only, for logs.
pub fn mask_signature(signature: &str) -> String {
    if signature.len() <= 8 || !signature.is_ascii() {
        return "****".to_string();
    }
    format!(
        "{}…{}",
        &signature[..4],
        &signature[signature.len() - 4..]
    )
}
