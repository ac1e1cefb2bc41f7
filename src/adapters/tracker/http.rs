//! HTTP implementation of [`TrackerClient`] against the external issue tracker.
//!
//! Generalizes the token-bucket-rate-limited REST client pattern to a
//! tracker-agnostic JSON API: one `GET /projects/:id/issues` for a full
//! sync fetch and a handful of write-back endpoints for [`EgressAction`].
//! Requests are rate-limited locally and retried with exponential backoff
//! on transient (timeout / 5xx) failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EgressAction, EgressResult, ExternalIssue, WorkflowStateCatalog};
use crate::domain::ports::TrackerClient;

/// Token-bucket rate limiter, shared across every request this client makes.
#[derive(Debug)]
struct RateLimiter {
    capacity: u32,
    tokens: u32,
    window: Duration,
    window_start: tokio::time::Instant,
}

impl RateLimiter {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window,
            window_start: tokio::time::Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.window {
            self.tokens = self.capacity;
            self.window_start = tokio::time::Instant::now();
        }

        if self.tokens > 0 {
            self.tokens -= 1;
        } else {
            let remaining = self.window.saturating_sub(elapsed);
            tracing::warn!(sleep_ms = remaining.as_millis() as u64, "tracker rate limit reached, sleeping");
            tokio::time::sleep(remaining).await;
            self.tokens = self.capacity - 1;
            self.window_start = tokio::time::Instant::now();
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssuesResponse {
    issues: Vec<ExternalIssue>,
    #[serde(default)]
    workflow_states: std::collections::HashMap<String, String>,
}

/// Concrete [`TrackerClient`] backed by a generic JSON REST API.
#[derive(Clone)]
pub struct HttpTrackerClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl HttpTrackerClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(100, Duration::from_secs(60)))),
        }
    }

    async fn authorized_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.rate_limiter.lock().await.acquire().await;
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.header("Accept", "application/json")
    }

    /// Run `op` with bounded exponential-backoff retry. Only transport
    /// failures and 5xx responses are transient; 4xx is permanent.
    async fn with_retry<T, F, Fut>(op: F) -> DomainResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, backoff::Error<DomainError>>>,
    {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };
        retry(policy, op).await.map_err(|e| match e {
            backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => err,
        })
    }
}

fn classify(status: StatusCode, body: String, what: &str) -> backoff::Error<DomainError> {
    let err = DomainError::ExecutionFailed(format!("tracker {what} returned {status}: {body}"));
    if status.is_server_error() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn fetch_issues(
        &self,
        project_id: &str,
    ) -> DomainResult<(Vec<ExternalIssue>, WorkflowStateCatalog)> {
        let path = format!("/projects/{project_id}/issues");
        let body: IssuesResponse = Self::with_retry(|| async {
            let resp = self
                .authorized_request(Method::GET, &path)
                .await
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(DomainError::ExecutionFailed(format!(
                        "tracker fetch_issues request failed: {e}"
                    )))
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(classify(status, text, "fetch_issues"));
            }

            resp.json::<IssuesResponse>().await.map_err(|e| {
                backoff::Error::permanent(DomainError::ExecutionFailed(format!(
                    "tracker fetch_issues parse failed: {e}"
                )))
            })
        })
        .await?;

        let catalog = WorkflowStateCatalog {
            state_types: body.workflow_states,
        };
        Ok((body.issues, catalog))
    }

    async fn execute(&self, action: &EgressAction) -> DomainResult<EgressResult> {
        let (method, path, payload) = match action {
            EgressAction::UpdateState {
                external_id,
                new_state_name,
            } => (
                Method::PATCH,
                format!("/issues/{external_id}/state"),
                serde_json::json!({ "state_name": new_state_name }),
            ),
            EgressAction::PostComment { external_id, body } => (
                Method::POST,
                format!("/issues/{external_id}/comments"),
                serde_json::json!({ "body": body }),
            ),
            EgressAction::ClosePullRequests { branch_prefix } => (
                Method::POST,
                "/pull-requests/close-by-prefix".to_string(),
                serde_json::json!({ "branch_prefix": branch_prefix }),
            ),
        };

        let result = Self::with_retry(|| async {
            let resp = self
                .authorized_request(method.clone(), &path)
                .await
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(DomainError::ExecutionFailed(format!(
                        "tracker egress request failed: {e}"
                    )))
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(classify(status, text, "egress"));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(()) => Ok(EgressResult::ok()),
            Err(e) => Ok(EgressResult::fail(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_refills_after_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(10));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        // Should not hang: the window has elapsed and refilled.
        tokio::time::timeout(Duration::from_secs(1), limiter.acquire())
            .await
            .expect("acquire should not block past the refilled window");
    }

    #[test]
    fn client_stores_base_url_verbatim_trimming_happens_per_request() {
        let client = HttpTrackerClient::new("https://tracker.example.com/", None);
        assert_eq!(client.base_url, "https://tracker.example.com/");
    }
}
