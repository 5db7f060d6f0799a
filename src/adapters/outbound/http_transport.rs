//! JSON-over-HTTP PrimeNet transport.
//!
//! Routes, relative to the configured endpoint:
//!
//! ```text
//! GET  /v1/ping                  liveness and credential check
//! POST /v1/assignments           { user_id, computer_id, count } -> [AssignmentDto]
//! POST /v1/results               { user_id, computer_id, submission } -> SubmitReply
//! POST /v1/reservations/renew    { user_id, computer_id, assignment_id, fraction_done } -> RenewReply
//! ```
//!
//! A renew answered with `410 Gone` means the server dropped the reservation.

use crate::domains::primenet::{
    Credentials, PrimeNetTransport, RenewOutcome, ResultSubmission, SubmitResponse, TransportError,
};
use crate::domains::work_queue::{Assignment, AssignmentId, AssignmentSource, Priority, WorkKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDto {
    pub id: String,
    pub work: WorkKind,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl From<AssignmentDto> for Assignment {
    fn from(dto: AssignmentDto) -> Self {
        let assignment = Assignment::new(
            AssignmentId::new(dto.id),
            dto.work,
            dto.priority.unwrap_or_default(),
            AssignmentSource::PrimeNet,
        );
        match dto.deadline {
            Some(deadline) => assignment.with_deadline(deadline),
            None => assignment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Accepted,
    Retry,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReply {
    pub status: SubmitStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewReply {
    pub expires_at: DateTime<Utc>,
}

pub struct HttpTransport {
    base_url: String,
    credentials: Credentials,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        credentials: Credentials,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Protocol(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            credentials,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let resp = self.authorize(request).send().await.map_err(map_send_error)?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Unauthorized),
            _ => Ok(resp),
        }
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unreachable(e.to_string())
    }
}

fn unexpected(what: &str, status: StatusCode) -> TransportError {
    TransportError::Protocol(format!("{what} returned {status}"))
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response, what: &str) -> Result<T, TransportError> {
    resp.json()
        .await
        .map_err(|e| TransportError::Protocol(format!("failed to parse {what} response: {e}")))
}

#[async_trait]
impl PrimeNetTransport for HttpTransport {
    async fn ping(&self) -> Result<(), TransportError> {
        let resp = self
            .send(self.client.get(self.url("/v1/ping")).query(&[
                ("user_id", self.credentials.user_id.as_str()),
                ("computer_id", self.credentials.computer_id.as_str()),
            ]))
            .await?;
        if !resp.status().is_success() {
            return Err(unexpected("ping", resp.status()));
        }
        Ok(())
    }

    async fn get_assignments(&self, count: usize) -> Result<Vec<Assignment>, TransportError> {
        let resp = self
            .send(self.client.post(self.url("/v1/assignments")).json(&serde_json::json!({
                "user_id": self.credentials.user_id,
                "computer_id": self.credentials.computer_id,
                "count": count,
            })))
            .await?;
        if !resp.status().is_success() {
            return Err(unexpected("get_assignments", resp.status()));
        }
        let dtos: Vec<AssignmentDto> = decode(resp, "get_assignments").await?;
        debug!("Server handed out {} assignments", dtos.len());
        Ok(dtos.into_iter().map(Assignment::from).collect())
    }

    async fn submit_result(&self, submission: &ResultSubmission) -> Result<SubmitResponse, TransportError> {
        let resp = self
            .send(self.client.post(self.url("/v1/results")).json(&serde_json::json!({
                "user_id": self.credentials.user_id,
                "computer_id": self.credentials.computer_id,
                "submission": submission,
            })))
            .await?;
        if !resp.status().is_success() {
            return Err(unexpected("submit_result", resp.status()));
        }
        let reply: SubmitReply = decode(resp, "submit_result").await?;
        Ok(match reply.status {
            SubmitStatus::Accepted => SubmitResponse::Accepted,
            SubmitStatus::Retry => SubmitResponse::Retry(reply.reason.unwrap_or_default()),
            SubmitStatus::Rejected => SubmitResponse::Rejected {
                reason: reply.reason.unwrap_or_else(|| "no reason given".to_string()),
            },
        })
    }

    async fn renew(&self, id: &AssignmentId, fraction_done: f64) -> Result<RenewOutcome, TransportError> {
        let resp = self
            .send(
                self.client
                    .post(self.url("/v1/reservations/renew"))
                    .json(&serde_json::json!({
                        "user_id": self.credentials.user_id,
                        "computer_id": self.credentials.computer_id,
                        "assignment_id": id,
                        "fraction_done": fraction_done,
                    })),
            )
            .await?;
        if resp.status() == StatusCode::GONE {
            return Ok(RenewOutcome::Expired);
        }
        if !resp.status().is_success() {
            return Err(unexpected("renew", resp.status()));
        }
        let reply: RenewReply = decode(resp, "renew").await?;
        Ok(RenewOutcome::Renewed {
            expires_at: reply.expires_at,
        })
    }
}
