//! HTTP webhook adapter.

use crate::dispatcher::{AdapterError, CallContext, WebhookCaller, WebhookRequest};
use crate::node::HttpMethod;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use tracing::{debug, warn};

/// Header carrying the `(execution, node)` idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// [`WebhookCaller`] backed by a shared reqwest client.
///
/// Network failures, `429` and `5xx` responses are transient; other
/// non-success statuses are permanent.
#[derive(Debug, Clone)]
pub struct HttpWebhookCaller {
    client: Client,
}

impl HttpWebhookCaller {
    /// Creates a caller with a client that does not follow redirects.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Classifies a non-success status.
fn status_error(status: StatusCode) -> AdapterError {
    let message = format!("endpoint answered HTTP {}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::transient(message)
    } else {
        AdapterError::permanent(message)
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn call(
        &self,
        request: &WebhookRequest,
        call: &CallContext,
    ) -> Result<JsonValue, AdapterError> {
        let mut builder = self
            .client
            .request(method(request.method), &request.url)
            .timeout(call.timeout)
            .header(IDEMPOTENCY_HEADER, &call.idempotency_key);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, node_id = %call.node_id, "webhook request failed");
            if e.is_builder() {
                AdapterError::permanent("webhook request could not be built")
            } else {
                AdapterError::transient("webhook endpoint unreachable")
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, node_id = %call.node_id, "webhook returned error");
            return Err(status_error(status));
        }

        let output = delivered(status, response.text().await)?;
        debug!(status = %status, node_id = %call.node_id, "webhook delivered");
        Ok(output)
    }
}

/// Builds the node output from a successful response body.
///
/// A body that stops mid-read is transient; the endpoint may not have
/// finished processing.
fn delivered(
    status: StatusCode,
    text: Result<String, impl fmt::Display>,
) -> Result<JsonValue, AdapterError> {
    let text = text.map_err(|e| {
        warn!(status = %status, error = %e, "webhook response body unreadable");
        AdapterError::transient("webhook response could not be read")
    })?;
    let body = serde_json::from_str(&text).unwrap_or(JsonValue::String(text));
    Ok(json!({ "status": status.as_u16(), "body": body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_map_to_http_verbs() {
        assert_eq!(method(HttpMethod::Get), Method::GET);
        assert_eq!(method(HttpMethod::Post), Method::POST);
        assert_eq!(method(HttpMethod::Delete), Method::DELETE);
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(status_error(StatusCode::BAD_GATEWAY).retryable);
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).retryable);
        assert!(!status_error(StatusCode::NOT_FOUND).retryable);
        assert!(!status_error(StatusCode::UNAUTHORIZED).retryable);
    }

    #[test]
    fn json_bodies_are_parsed_and_others_kept_as_text() {
        let output = delivered(StatusCode::OK, Ok::<_, String>(r#"{"id":7}"#.to_string()))
            .expect("output");
        assert_eq!(output, json!({ "status": 200, "body": { "id": 7 } }));

        let output =
            delivered(StatusCode::ACCEPTED, Ok::<_, String>("queued".to_string())).expect("output");
        assert_eq!(output["body"], "queued");
    }

    #[test]
    fn unreadable_body_is_transient() {
        let error = delivered(StatusCode::OK, Err::<String, _>("connection reset"))
            .expect_err("body failed");
        assert!(error.retryable);
        assert_eq!(error.message, "webhook response could not be read");
    }

    #[test]
    fn status_messages_carry_no_response_body() {
        let error = status_error(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, "endpoint answered HTTP 500");
    }
}
