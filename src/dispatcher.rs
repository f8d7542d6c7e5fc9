//! Delivery of extraction results to the callback endpoint.
//!
//! The wire format is a JSON body
//! `{"params":[{"name":"code","value":["482913"]}]}` POSTed with
//! `Content-Type: application/json`. Delivery is at-most-once: failures are
//! classified and reported, never retried here.

use crate::error::{Error, Result};
use crate::extractor::ExtractionResult;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// The request body sent to the callback endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Extracted params in rule order.
    pub params: ExtractionResult,
}

/// Classified outcome of one delivery.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The endpoint answered HTTP 200.
    Success {
        /// Response body.
        body: String,
    },
    /// The endpoint answered with any other status.
    HttpStatusError {
        /// HTTP status code.
        status: u16,
        /// Response body, captured for diagnostics.
        body: String,
    },
    /// The request never got a response (refused, timed out, TLS failure).
    TransportError(Error),
}

impl DeliveryOutcome {
    /// Returns `true` for [`DeliveryOutcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Success { body } => write!(f, "delivered, response: {body}"),
            DeliveryOutcome::HttpStatusError { status, body } => {
                write!(f, "rejected with HTTP {status}, response: {body}")
            }
            DeliveryOutcome::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Sends extraction results somewhere.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Delivers one result. Must not retry.
    async fn deliver(&self, result: &ExtractionResult) -> DeliveryOutcome;
}

/// [`Delivery`] via HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpDispatcher {
    /// Creates a dispatcher for `endpoint` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClient`] if the TLS backend cannot be initialised.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| Error::HttpClient { source })?;

        Ok(Self { client, endpoint })
    }

    /// The callback endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn transport_error(&self, source: reqwest::Error) -> DeliveryOutcome {
        DeliveryOutcome::TransportError(Error::DeliveryTransport {
            endpoint: self.endpoint.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Delivery for HttpDispatcher {
    #[instrument(
        name = "dispatcher::deliver",
        skip_all,
        fields(endpoint = %self.endpoint, params = result.params().len())
    )]
    async fn deliver(&self, result: &ExtractionResult) -> DeliveryOutcome {
        let payload = DeliveryPayload {
            params: result.clone(),
        };

        let response = match self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(source) => {
                warn!(error = %source, "Delivery failed");
                return self.transport_error(source);
            }
        };

        // The status line decides the outcome; an unreadable body does not.
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(source) => {
                warn!(error = %source, status = status.as_u16(), "Failed to read response");
                format!("<unreadable response body: {source}>")
            }
        };

        if status == StatusCode::OK {
            debug!("Delivered");
            DeliveryOutcome::Success { body }
        } else {
            warn!(status = status.as_u16(), "Callback rejected delivery");
            DeliveryOutcome::HttpStatusError {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractedParam;

    fn sample() -> ExtractionResult {
        ExtractionResult::from(vec![
            ExtractedParam {
                name: "code".into(),
                values: vec!["482913".into()],
            },
            ExtractedParam {
                name: "link".into(),
                values: vec![],
            },
        ])
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = DeliveryPayload { params: sample() };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "params": [
                    {"name": "code", "value": ["482913"]},
                    {"name": "link", "value": []}
                ]
            })
        );
    }

    #[test]
    fn test_payload_round_trip_keeps_order() {
        let payload = DeliveryPayload {
            params: ExtractionResult::from(vec![
                ExtractedParam {
                    name: "b".into(),
                    values: vec!["2".into(), "1".into(), "2".into()],
                },
                ExtractedParam {
                    name: "a".into(),
                    values: vec![],
                },
            ]),
        };

        let wire = serde_json::to_string(&payload).unwrap();
        let decoded: DeliveryPayload = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_outcome_display() {
        let outcome = DeliveryOutcome::HttpStatusError {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(outcome.to_string(), "rejected with HTTP 500, response: boom");
        assert!(!outcome.is_success());
    }
}
