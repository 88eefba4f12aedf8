//! REST client for the remote work queue.
//!
//! The queue is a ServiceNow-style `ecc_queue` table reached with HTTP
//! basic auth. Items are fetched by topic and state, claimed by
//! PATCHing `state=processing`, and acknowledged with `processed` or
//! `error`. Results additionally go back as fresh items on the queue's
//! output channel.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::config::QueueConfig;

const TABLE_PATH: &str = "api/now/table/ecc_queue";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("queue returned HTTP {0}")]
    Status(u16),
    #[error("bad queue URL: {0}")]
    Url(#[from] url::ParseError),
}

/// A work item as fetched from the queue. Fields the broker does not
/// use are left behind by serde.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueItem {
    pub sys_id: String,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Deserialize)]
struct TableListResponse {
    result: Vec<QueueItem>,
}

pub struct QueueClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    password: String,
    topic: String,
    response_topic: String,
}

impl QueueClient {
    pub fn new(config: &QueueConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: config.instance.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            topic: config.topic.clone(),
            response_topic: config.response_topic.clone(),
        }
    }

    fn table_url(&self, sys_id: Option<&str>) -> Result<Url, QueueError> {
        let path = match sys_id {
            Some(id) => format!("{TABLE_PATH}/{id}"),
            None => TABLE_PATH.to_string(),
        };
        Ok(self.base.join(&path)?)
    }

    /// Fetches up to `limit` items in state `ready` for our topic.
    pub async fn fetch_ready(&self, limit: u32) -> Result<Vec<QueueItem>, QueueError> {
        let url = self.table_url(None)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .query(&[
                (
                    "sysparm_query",
                    format!("topic={}^state=ready", self.topic),
                ),
                ("sysparm_limit", limit.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueueError::Status(response.status().as_u16()));
        }
        let body: TableListResponse = response.json().await?;
        Ok(body.result)
    }

    /// Transitions an item to `state` with its result (or diagnostic)
    /// in `output`.
    pub async fn update_item(
        &self,
        sys_id: &str,
        state: &str,
        output: &str,
    ) -> Result<(), QueueError> {
        let url = self.table_url(Some(sys_id))?;
        let response = self
            .http
            .patch(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "state": state,
                "output": output,
                "processed": Utc::now().to_rfc3339(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueueError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// Posts a response item on the queue's output channel so the far
    /// side can pick up the result without polling our item.
    pub async fn post_response(
        &self,
        name: &str,
        source: &str,
        output: &str,
    ) -> Result<(), QueueError> {
        let url = self.table_url(None)?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "topic": self.response_topic,
                "queue": "output",
                "state": "ready",
                "name": name,
                "source": source,
                "output": output,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueueError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
