//! Queue item payloads and their translation into local HTTP calls.
//!
//! The payload's `action` field selects one variant of a closed set;
//! anything else fails to parse and the item is marked `error` at the
//! edge. Dispatch goes through the broker's own HTTP API rather than
//! straight into the session manager, so queue-driven and direct
//! callers share one contract (auth, ownership, validation).

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::WorkspaceType;
use crate::core::Credentials;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("local API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("local API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
}

/// The closed set of actions a queue item may request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QueueAction {
    CreateSession {
        user_id: String,
        credentials: Credentials,
        #[serde(default)]
        workspace_type: Option<WorkspaceType>,
    },
    SendCommand {
        session_id: String,
        user_id: String,
        command: String,
    },
    GetOutput {
        session_id: String,
        user_id: String,
        #[serde(default)]
        clear: bool,
    },
    GetStatus {
        session_id: String,
        user_id: String,
    },
    TerminateSession {
        session_id: String,
        user_id: String,
    },
    ResizeTerminal {
        session_id: String,
        user_id: String,
        cols: u16,
        rows: u16,
    },
}

impl QueueAction {
    /// Action name as it appears on the wire; used to label response items.
    pub fn name(&self) -> &'static str {
        match self {
            QueueAction::CreateSession { .. } => "create_session",
            QueueAction::SendCommand { .. } => "send_command",
            QueueAction::GetOutput { .. } => "get_output",
            QueueAction::GetStatus { .. } => "get_status",
            QueueAction::TerminateSession { .. } => "terminate_session",
            QueueAction::ResizeTerminal { .. } => "resize_terminal",
        }
    }
}

/// Client for the broker's own HTTP API on the loopback interface.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(base: String, auth_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base,
            auth_token,
        }
    }

    /// Executes one action against the local API and returns the JSON
    /// result body.
    pub async fn dispatch(&self, action: QueueAction) -> Result<serde_json::Value, DispatchError> {
        let base = &self.base;
        let request = match &action {
            QueueAction::CreateSession {
                user_id,
                credentials,
                workspace_type,
            } => {
                let mut body = json!({
                    "userId": user_id,
                    "credentials": { "primary": credentials.primary },
                });
                if let Some(secondary) = &credentials.secondary {
                    body["credentials"]["secondary"] = json!(secondary);
                }
                if let Some(ws) = workspace_type {
                    body["workspaceType"] = json!(match ws {
                        WorkspaceType::Isolated => "isolated",
                        WorkspaceType::Persistent => "persistent",
                    });
                }
                self.http.post(format!("{base}/api/session/create")).json(&body)
            }
            QueueAction::SendCommand {
                session_id,
                user_id,
                command,
            } => self
                .http
                .post(format!("{base}/api/session/{session_id}/command"))
                .header("X-User-ID", user_id)
                .json(&json!({ "command": command })),
            QueueAction::GetOutput {
                session_id,
                user_id,
                clear,
            } => self
                .http
                .get(format!(
                    "{base}/api/session/{session_id}/output?clear={clear}"
                ))
                .header("X-User-ID", user_id),
            QueueAction::GetStatus {
                session_id,
                user_id,
            } => self
                .http
                .get(format!("{base}/api/session/{session_id}/status"))
                .header("X-User-ID", user_id),
            QueueAction::TerminateSession {
                session_id,
                user_id,
            } => self
                .http
                .delete(format!("{base}/api/session/{session_id}"))
                .header("X-User-ID", user_id),
            QueueAction::ResizeTerminal {
                session_id,
                user_id,
                cols,
                rows,
            } => self
                .http
                .post(format!("{base}/api/session/{session_id}/resize"))
                .header("X-User-ID", user_id)
                .json(&json!({ "cols": cols, "rows": rows })),
        };

        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_session() {
        let payload = r#"{
            "action": "create_session",
            "user_id": "alice",
            "credentials": { "primary": "K1", "secondary": "T2" }
        }"#;
        let action: QueueAction = serde_json::from_str(payload).unwrap();
        match &action {
            QueueAction::CreateSession {
                user_id,
                credentials,
                workspace_type,
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(credentials.primary, "K1");
                assert_eq!(credentials.secondary.as_deref(), Some("T2"));
                assert!(workspace_type.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(action.name(), "create_session");
    }

    #[test]
    fn test_parse_get_output_clear_defaults_false() {
        let payload = r#"{
            "action": "get_output",
            "session_id": "s1",
            "user_id": "alice"
        }"#;
        let action: QueueAction = serde_json::from_str(payload).unwrap();
        assert!(matches!(action, QueueAction::GetOutput { clear: false, .. }));
    }

    #[test]
    fn test_parse_resize() {
        let payload = r#"{
            "action": "resize_terminal",
            "session_id": "s1",
            "user_id": "alice",
            "cols": 120,
            "rows": 40
        }"#;
        let action: QueueAction = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            action,
            QueueAction::ResizeTerminal { cols: 120, rows: 40, .. }
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let payload = r#"{ "action": "reboot_host", "user_id": "alice" }"#;
        assert!(serde_json::from_str::<QueueAction>(payload).is_err());
    }

    #[test]
    fn test_missing_action_rejected() {
        let payload = r#"{ "user_id": "alice" }"#;
        assert!(serde_json::from_str::<QueueAction>(payload).is_err());
    }
}
