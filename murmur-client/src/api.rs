//! Thin typed wrapper around the server's HTTP API.

use std::time::Duration;

use anyhow::{Context, Result};
use murmur_core::{PoolStatus, TaskFailure, TaskState};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// Snapshot returned by `GET /tasks/{id}/status`. Fields the waiter does
/// not act on are left to serde's unknown-field handling.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

/// What happened to a submission attempt.
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    /// 429: back off and retry.
    PoolFull,
    /// 4xx/5xx that retrying will not fix.
    Rejected { status: u16, detail: String },
}

/// What a download attempt yielded.
#[derive(Debug)]
pub enum DownloadOutcome {
    Ready(Vec<u8>),
    /// 409: the server has not finished publishing yet.
    NotReady,
    /// 404: the result expired or was deleted.
    Gone,
}

pub struct ApiClient {
    http: Client,
    base: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("murmur-client/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .http
            .get(format!("{}/health", self.base))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    pub async fn pool_status(&self) -> Result<PoolStatus> {
        let resp = self
            .http
            .get(format!("{}/pool/status", self.base))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Submit a packed bundle. A 202 is `Accepted`; 429 maps to `PoolFull`
    /// so the caller can re-enter its back-off loop.
    pub async fn submit(
        &self,
        task_id: &str,
        model: &str,
        password: &str,
        bundle: Vec<u8>,
    ) -> Result<SubmitOutcome> {
        let form = Form::new()
            .text("task_id", task_id.to_owned())
            .text("model", model.to_owned())
            .text("password", password.to_owned())
            .part(
                "task_file",
                Part::bytes(bundle)
                    .file_name(format!("{task_id}.bundle"))
                    .mime_str("application/octet-stream")?,
            );

        let resp = self
            .http
            .post(format!("{}/tasks/submit", self.base))
            .multipart(form)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        match resp.status() {
            StatusCode::ACCEPTED => Ok(SubmitOutcome::Accepted),
            StatusCode::TOO_MANY_REQUESTS => Ok(SubmitOutcome::PoolFull),
            status => Ok(SubmitOutcome::Rejected {
                status: status.as_u16(),
                detail: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `None` means the server no longer knows the task.
    pub async fn status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let resp = self
            .http
            .get(format!("{}/tasks/{task_id}/status", self.base))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    pub async fn download(&self, task_id: &str) -> Result<DownloadOutcome> {
        let resp = self
            .http
            .get(format!("{}/tasks/{task_id}/result/download", self.base))
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(DownloadOutcome::Ready(resp.bytes().await?.to_vec())),
            StatusCode::CONFLICT => Ok(DownloadOutcome::NotReady),
            StatusCode::NOT_FOUND => Ok(DownloadOutcome::Gone),
            status => anyhow::bail!("unexpected download status {status}"),
        }
    }
}
