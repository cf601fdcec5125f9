//! Endpoint executor: one HTTP call with timeout, size caps, truncation,
//! and cooperative cancellation.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cadence_api::{Endpoint, HttpMethod, PlannedCall};

use crate::retry::ErrorCategory;

/// Executor-level settings, fixed at engine construction.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub response_content_length_limit: usize,
}

/// Outcome of a single attempt against an endpoint.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub success: bool,
    /// 0 when the transport failed before a response arrived.
    pub status_code: u16,
    pub duration_ms: u64,
    pub response_content: Option<serde_json::Value>,
    pub request_size: usize,
    pub response_size: usize,
    pub truncated: bool,
    pub aborted: bool,
    pub error: Option<String>,
    /// Present on failure; drives the retry policy.
    pub category: Option<ErrorCategory>,
}

impl AttemptOutcome {
    fn failure(category: ErrorCategory, error: String, request_size: usize) -> Self {
        Self {
            success: false,
            status_code: 0,
            duration_ms: 0,
            response_content: None,
            request_size,
            response_size: 0,
            truncated: false,
            aborted: category == ErrorCategory::Aborted,
            error: Some(error),
            category: Some(category),
        }
    }
}

/// Issues individual endpoint calls. Cheap to share: holds one reqwest
/// client with pooled connections.
#[derive(Clone)]
pub struct EndpointExecutor {
    client: Client,
    config: ExecutorConfig,
}

impl EndpointExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Execute one call. Never panics and never returns early without a
    /// classified outcome; cancellation and timeout both surface as
    /// outcomes, not errors.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        call: &PlannedCall,
        job_headers: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let url = match Url::parse(&endpoint.url) {
            Ok(url) => url,
            Err(e) => {
                return AttemptOutcome::failure(
                    ErrorCategory::Unknown,
                    format!("invalid endpoint url {:?}: {e}", endpoint.url),
                    0,
                );
            }
        };

        let headers = merge_headers(
            job_headers,
            endpoint.default_headers.as_ref(),
            call.headers.as_ref(),
        );

        let (request, request_size) =
            match self.build_request(endpoint, call, url, &headers) {
                Ok(built) => built,
                Err(message) => {
                    return AttemptOutcome::failure(ErrorCategory::Unknown, message, 0);
                }
            };

        if endpoint.fire_and_forget {
            return self.dispatch_and_forget(endpoint, request, request_size);
        }

        let timeout = endpoint
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let started = Instant::now();
        let fetch = async {
            let response = request.send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, content_type, bytes))
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut outcome = AttemptOutcome::failure(
                    ErrorCategory::Aborted,
                    "request aborted".to_string(),
                    request_size,
                );
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                outcome
            }
            _ = tokio::time::sleep(timeout) => {
                let mut outcome = AttemptOutcome::failure(
                    ErrorCategory::Timeout,
                    format!("request exceeded timeout of {} ms", timeout.as_millis()),
                    request_size,
                );
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                outcome
            }
            result = fetch => {
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok((status, content_type, bytes)) => self.finish(
                        status.as_u16(),
                        content_type.as_deref(),
                        &bytes,
                        request_size,
                        duration_ms,
                    ),
                    Err(e) => {
                        let mut outcome = AttemptOutcome::failure(
                            classify_transport_error(&e),
                            e.to_string(),
                            request_size,
                        );
                        outcome.duration_ms = duration_ms;
                        outcome
                    }
                }
            }
        }
    }

    /// Build the request and report the serialized body size.
    fn build_request(
        &self,
        endpoint: &Endpoint,
        call: &PlannedCall,
        mut url: Url,
        headers: &HashMap<String, String>,
    ) -> Result<(reqwest::RequestBuilder, usize), String> {
        let method = to_reqwest_method(endpoint.method);
        let mut request_size = 0usize;

        let mut builder = if endpoint.method.is_get_like() {
            if let Some(params) = &call.parameters {
                append_query_parameters(&mut url, params);
            }
            self.client.request(method, url)
        } else {
            let body = match &call.parameters {
                Some(params) => serde_json::to_vec(params)
                    .map_err(|e| format!("failed to serialize parameters: {e}"))?,
                None => Vec::new(),
            };
            request_size = body.len();
            let mut builder = self.client.request(method, url);
            if !body.is_empty() {
                builder = builder.body(body);
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
            }
            builder
        };

        builder = builder.headers(to_header_map(headers));

        if let Some(token) = &endpoint.bearer_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        Ok((builder, request_size))
    }

    /// Fire-and-forget endpoints: dispatch on a detached task and report a
    /// synthetic success immediately.
    fn dispatch_and_forget(
        &self,
        endpoint: &Endpoint,
        request: reqwest::RequestBuilder,
        request_size: usize,
    ) -> AttemptOutcome {
        let endpoint_id = endpoint.id.clone();
        let url = endpoint.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    debug!(
                        endpoint_id = %endpoint_id,
                        status = response.status().as_u16(),
                        "fire-and-forget dispatch completed"
                    );
                }
                Err(e) => {
                    warn!(
                        endpoint_id = %endpoint_id,
                        url = %url,
                        error = %e,
                        "fire-and-forget dispatch failed"
                    );
                }
            }
        });

        AttemptOutcome {
            success: true,
            status_code: 0,
            duration_ms: 0,
            response_content: None,
            request_size,
            response_size: 0,
            truncated: false,
            aborted: false,
            error: None,
            category: None,
        }
    }

    /// Turn a completed HTTP exchange into an outcome, applying the body
    /// cap and JSON discrimination.
    fn finish(
        &self,
        status_code: u16,
        content_type: Option<&str>,
        bytes: &[u8],
        request_size: usize,
        duration_ms: u64,
    ) -> AttemptOutcome {
        let limit = self.config.response_content_length_limit;
        let response_size = bytes.len();
        let truncated = response_size > limit;
        let visible = &bytes[..response_size.min(limit)];
        let text = String::from_utf8_lossy(visible).into_owned();

        let looks_like_json = content_type.is_some_and(|ct| ct.contains("json"));
        let response_content = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => Some(value),
            // A truncated JSON body no longer parses; fall back to text.
            Err(_) if looks_like_json || !text.is_empty() => {
                Some(serde_json::Value::String(text))
            }
            Err(_) => None,
        };

        let success = (200..300).contains(&status_code);
        let (error, category) = if success {
            (None, None)
        } else if (400..500).contains(&status_code) {
            (
                Some(format!("HTTP {status_code}")),
                Some(ErrorCategory::Http4xx),
            )
        } else if (500..600).contains(&status_code) {
            (
                Some(format!("HTTP {status_code}")),
                Some(ErrorCategory::Http5xx),
            )
        } else {
            (
                Some(format!("unexpected status {status_code}")),
                Some(ErrorCategory::Unknown),
            )
        };

        AttemptOutcome {
            success,
            status_code,
            duration_ms,
            response_content,
            request_size,
            response_size,
            truncated,
            aborted: false,
            error,
            category,
        }
    }
}

/// Merge headers in precedence order: job defaults, endpoint defaults,
/// planned headers (later wins).
pub fn merge_headers(
    job: Option<&HashMap<String, String>>,
    endpoint: Option<&HashMap<String, String>>,
    planned: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for source in [job, endpoint, planned].into_iter().flatten() {
        for (k, v) in source {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Append top-level parameters as query pairs, preserving any existing
/// query string. Non-string scalars and nested values are JSON-encoded.
fn append_query_parameters(url: &mut Url, parameters: &serde_json::Value) {
    let serde_json::Value::Object(map) = parameters else {
        return;
    };
    let mut pairs = url.query_pairs_mut();
    for (key, value) in map {
        match value {
            serde_json::Value::String(s) => {
                pairs.append_pair(key, s);
            }
            serde_json::Value::Null => {
                pairs.append_pair(key, "");
            }
            other => {
                pairs.append_pair(key, &other.to_string());
            }
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!(header = %key, "skipping invalid header name");
                continue;
            }
        };
        let value = match HeaderValue::from_str(value) {
            Ok(value) => value,
            Err(_) => {
                warn!(header = %key, "skipping invalid header value");
                continue;
            }
        };
        map.insert(name, value);
    }
    map
}

fn classify_transport_error(err: &reqwest::Error) -> ErrorCategory {
    if err.is_timeout() {
        ErrorCategory::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn header_precedence_is_job_then_endpoint_then_planned() {
        let job = map(&[("x-a", "job"), ("x-b", "job"), ("x-c", "job")]);
        let endpoint = map(&[("x-b", "endpoint"), ("x-c", "endpoint")]);
        let planned = map(&[("x-c", "planned")]);

        let merged = merge_headers(Some(&job), Some(&endpoint), Some(&planned));
        assert_eq!(merged["x-a"], "job");
        assert_eq!(merged["x-b"], "endpoint");
        assert_eq!(merged["x-c"], "planned");
    }

    #[test]
    fn query_parameters_preserve_existing_query() {
        let mut url = Url::parse("http://svc/search?q=rust").unwrap();
        append_query_parameters(&mut url, &json!({"page": 2, "sort": "desc"}));

        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("q".into(), "rust".into())));
        assert!(query.contains(&("page".into(), "2".into())));
        assert!(query.contains(&("sort".into(), "desc".into())));
    }

    #[test]
    fn nested_query_values_are_json_encoded() {
        let mut url = Url::parse("http://svc/").unwrap();
        append_query_parameters(&mut url, &json!({"filter": {"active": true}}));
        assert!(url.query().unwrap().contains("filter="));
        let (_, value) = url.query_pairs().next().unwrap();
        assert_eq!(value, r#"{"active":true}"#);
    }

    #[test]
    fn invalid_headers_are_skipped() {
        let headers = map(&[("ok", "fine"), ("bad\nname", "x")]);
        let header_map = to_header_map(&headers);
        assert_eq!(header_map.len(), 1);
        assert!(header_map.contains_key("ok"));
    }

    #[test]
    fn transport_failure_outcome_has_status_zero() {
        let outcome = AttemptOutcome::failure(ErrorCategory::Network, "refused".into(), 12);
        assert_eq!(outcome.status_code, 0);
        assert!(!outcome.success);
        assert!(!outcome.aborted);
        assert_eq!(outcome.category, Some(ErrorCategory::Network));
    }

    #[test]
    fn aborted_failure_sets_aborted_flag() {
        let outcome = AttemptOutcome::failure(ErrorCategory::Aborted, "stop".into(), 0);
        assert!(outcome.aborted);
    }
}
