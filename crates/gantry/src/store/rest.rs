//! Store client that speaks JSON over HTTP with the upstream service.
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::autoalloc::{AllocationId, BatchJob};
use crate::job::{BacklogSummary, Job, JobId, SessionId, StatusEvent};
use crate::store::{ClaimRequest, JobStore, StoreError, StoreFuture, StoreResult};

pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    allocation: Option<&'a str>,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    id: SessionId,
}

#[derive(Serialize)]
struct TickRequest {
    idle_cores: u32,
}

#[derive(Serialize)]
struct JobIdsRequest<'a> {
    job_ids: &'a [JobId],
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    events: &'a [StatusEvent],
}

#[derive(Serialize)]
struct BacklogRequest<'a> {
    filter_tags: &'a Map<String, String>,
}

impl RestStore {
    pub fn new(base_url: &str, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                crate::Error::GenericError(format!("Cannot build HTTP client: {error}"))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send<B: Serialize + Sync + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> StoreResult<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        log::trace!("{method} {url}");
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &format!("{url}: {body}")))
    }

    async fn call<B: Serialize + Sync + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> StoreResult<()> {
        self.send(method, path, body).await?;
        Ok(())
    }

    async fn fetch<T: DeserializeOwned, B: Serialize + Sync + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> StoreResult<T> {
        let response = self.send(method, path, body).await?;
        response.json().await.map_err(classify_request_error)
    }
}

/// Maps a non-success HTTP status to a store error.
fn classify_status(status: StatusCode, message: &str) -> StoreError {
    let message = format!("{status} {message}");
    if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(message)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        StoreError::Transient(message)
    } else {
        StoreError::Rejected(message)
    }
}

fn classify_request_error(error: reqwest::Error) -> StoreError {
    if error.is_decode() || error.is_builder() {
        StoreError::Rejected(error.to_string())
    } else {
        StoreError::Transient(error.to_string())
    }
}

const NO_BODY: Option<&()> = None;

impl JobStore for RestStore {
    fn open_session(&self, allocation: Option<String>) -> StoreFuture<'_, SessionId> {
        Box::pin(async move {
            let request = OpenSessionRequest {
                allocation: allocation.as_deref(),
            };
            let response: OpenSessionResponse =
                self.fetch(Method::POST, "/sessions", Some(&request)).await?;
            Ok(response.id)
        })
    }

    fn tick_session(&self, session: SessionId, idle_cores: u32) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(
                Method::PUT,
                &format!("/sessions/{session}"),
                Some(&TickRequest { idle_cores }),
            )
            .await
        })
    }

    fn close_session(&self, session: SessionId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(Method::DELETE, &format!("/sessions/{session}"), NO_BODY)
                .await
        })
    }

    fn claim(&self, session: SessionId, request: ClaimRequest) -> StoreFuture<'_, Vec<Job>> {
        Box::pin(async move {
            self.fetch(
                Method::POST,
                &format!("/sessions/{session}/claim"),
                Some(&request),
            )
            .await
        })
    }

    fn acknowledge(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(
                Method::POST,
                &format!("/sessions/{session}/acknowledge"),
                Some(&JobIdsRequest { job_ids: &jobs }),
            )
            .await
        })
    }

    fn release(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(
                Method::POST,
                &format!("/sessions/{session}/release"),
                Some(&JobIdsRequest { job_ids: &jobs }),
            )
            .await
        })
    }

    fn update_status(&self, events: Vec<StatusEvent>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(
                Method::PUT,
                "/jobs/status",
                Some(&StatusRequest { events: &events }),
            )
            .await
        })
    }

    fn backlog(&self, filter_tags: Map<String, String>) -> StoreFuture<'_, BacklogSummary> {
        Box::pin(async move {
            self.fetch(
                Method::POST,
                "/backlog",
                Some(&BacklogRequest {
                    filter_tags: &filter_tags,
                }),
            )
            .await
        })
    }

    fn create_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, BatchJob> {
        Box::pin(async move {
            self.fetch(Method::POST, "/batch-jobs", Some(&allocation))
                .await
        })
    }

    fn update_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.call(
                Method::PUT,
                &format!("/batch-jobs/{}", allocation.id),
                Some(&allocation),
            )
            .await
        })
    }

    fn list_allocations(&self, active_only: bool) -> StoreFuture<'_, Vec<BatchJob>> {
        Box::pin(async move {
            self.fetch(
                Method::GET,
                &format!("/batch-jobs?active_only={active_only}"),
                NO_BODY,
            )
            .await
        })
    }

    fn get_allocation(&self, id: AllocationId) -> StoreFuture<'_, BatchJob> {
        Box::pin(async move {
            self.fetch(Method::GET, &format!("/batch-jobs/{id}"), NO_BODY)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "locked"),
            StoreError::Rejected(_)
        ));
    }

    #[test]
    fn base_url_is_normalized() {
        let store = RestStore::new("http://localhost:8080/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.base_url, "http://localhost:8080/api");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transient() {
        let store = RestStore::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let error = store.open_session(None).await.unwrap_err();
        assert!(error.is_transient());
    }
}
