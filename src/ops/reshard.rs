//! HTTP client for the coordinator's resharding API

use crate::common::{Error, Result};
use crate::coordinator::http::{AbortRequest, OperationStatus, StartReshardRequest};
use crate::coordinator::machine::CompletionOutcome;
use crate::coordinator::record::{
    OperationId, OperationRecord, ParticipantDescriptor, PartitionAssignment,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub struct ReshardClient {
    base: String,
    http: reqwest::Client,
}

impl ReshardClient {
    pub fn new(coordinator_url: &str) -> Result<Self> {
        Ok(Self {
            base: coordinator_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().build()?,
        })
    }

    pub async fn start(&self, request: &StartReshardRequest) -> Result<OperationRecord> {
        let resp = self
            .http
            .post(format!("{}/reshard", self.base))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn set_assignment(
        &self,
        id: &OperationId,
        assignment: &PartitionAssignment,
    ) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/reshard/{}/assignment", self.base, id))
            .json(assignment)
            .send()
            .await?;
        expect_success(resp).await
    }

    pub async fn report(&self, id: &OperationId, descriptor: &ParticipantDescriptor) -> Result<()> {
        self.post_empty(&format!("{}/reshard/{}/participants", self.base, id), descriptor)
            .await
    }

    pub async fn abort(&self, id: &OperationId, reason: Option<String>) -> Result<()> {
        self.post_empty(
            &format!("{}/reshard/{}/abort", self.base, id),
            &AbortRequest { reason },
        )
        .await
    }

    pub async fn status(&self, id: &OperationId) -> Result<OperationStatus> {
        let resp = self
            .http
            .get(format!("{}/reshard/{}", self.base, id))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list(&self) -> Result<Vec<OperationRecord>> {
        let resp = self
            .http
            .get(format!("{}/reshard", self.base))
            .send()
            .await?;
        decode(resp).await
    }

    /// Blocks until the operation finishes
    pub async fn wait(&self, id: &OperationId) -> Result<CompletionOutcome> {
        let resp = self
            .http
            .get(format!("{}/reshard/{}/wait", self.base, id))
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_empty<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let resp = self.http.post(url).json(body).send().await?;
        expect_success(resp).await
    }
}

async fn expect_success(resp: reqwest::Response) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(remote_error(resp).await)
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(remote_error(resp).await);
    }
    Ok(resp.json::<T>().await?)
}

async fn remote_error(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("no error message")
        .to_string();
    match status.as_u16() {
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        400 | 422 => Error::InvalidRequest(message),
        _ => Error::Http(format!("{}: {}", status, message)),
    }
}
