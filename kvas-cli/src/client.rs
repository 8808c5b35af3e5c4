//! HTTP client for the launcher API.

use anyhow::{bail, Context, Result};
use kvas_types::{LogArtifact, TaskId, TaskSnapshot};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct CancelBody {
    cancelled: bool,
}

/// Talks to one launcher.
pub struct LauncherClient {
    base: String,
    http: reqwest::Client,
}

impl LauncherClient {
    /// Client for the launcher at `base` (e.g. `http://127.0.0.1:8080`).
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            bail!("launcher answered {}: {}", status.as_u16(), reason);
        }
        response
            .json()
            .await
            .context("unexpected response from launcher")
    }

    /// Launch a task.
    pub async fn launch(&self, image: &str, node_count: u32, topology: &str) -> Result<TaskSnapshot> {
        let node_count = node_count.to_string();
        let response = self
            .http
            .post(self.url("/api/test"))
            .query(&[
                ("image", image),
                ("node_count", node_count.as_str()),
                ("task", topology),
            ])
            .send()
            .await
            .context("failed to reach launcher")?;
        Self::decode(response).await
    }

    /// Current view of a task.
    pub async fn task(&self, id: &TaskId) -> Result<TaskSnapshot> {
        let response = self
            .http
            .get(self.url(&format!("/api/test/{}", id)))
            .send()
            .await
            .context("failed to reach launcher")?;
        Self::decode(response).await
    }

    /// Cancel a task. Returns false if its run had already ended.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool> {
        let response = self
            .http
            .post(self.url(&format!("/api/test/{}/cancel", id)))
            .send()
            .await
            .context("failed to reach launcher")?;
        let body: CancelBody = Self::decode(response).await?;
        Ok(body.cancelled)
    }

    /// Archived logs of a task.
    pub async fn logs(&self, id: &TaskId) -> Result<Vec<LogArtifact>> {
        let response = self
            .http
            .get(self.url(&format!("/api/logs/{}", id)))
            .send()
            .await
            .context("failed to reach launcher")?;
        Self::decode(response).await
    }

    /// Poll a task every `interval` until it reaches a terminal state.
    pub async fn wait(&self, id: &TaskId, interval: Duration) -> Result<TaskSnapshot> {
        let mut last_state = None;
        loop {
            let task = self.task(id).await?;
            if last_state != Some(task.state) {
                eprintln!("{}: {}", id, task.state);
                last_state = Some(task.state);
            }
            if task.state.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
