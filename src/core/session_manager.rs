//! Session registry and lifecycle authority.
//!
//! [`SessionManager`] owns the map of live sessions behind an `RwLock`.
//! Lookups and listings take the read lock; create, terminate, and the
//! reaper's removal take the write lock. `create_session` holds the
//! write lock across the per-user limit check and the insert so the cap
//! cannot be raced. Lock order is always manager map → session, never
//! the reverse.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::WorkspaceType;

use super::error::SessionError;
use super::session::{Session, SessionStatus, SessionSummary, SpawnOptions};
use super::store::{self, SessionRecord, SessionStore};
use super::vault::CredentialCipher;

/// How often the timeout reaper wakes.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Credentials presented at session creation. The primary key is
/// required; plaintext lives only on the stack between decryption and
/// the child environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub primary: String,
    #[serde(default)]
    pub secondary: Option<String>,
}

/// Session policy knobs, owned by the manager.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub base_path: PathBuf,
    pub max_sessions_per_user: usize,
    pub output_buffer_capacity: usize,
    pub idle_timeout: Duration,
    pub command: String,
    pub workspace_type: WorkspaceType,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    policy: SessionPolicy,
    cipher: Option<CredentialCipher>,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionManager {
    pub fn new(
        policy: SessionPolicy,
        cipher: Option<CredentialCipher>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
            cipher,
            store,
        }
    }

    /// Creates a session for `user_id`: validates the id, enforces the
    /// per-user cap, builds and guards the workspace path, encrypts the
    /// credentials, spawns the wrapped tool in a PTY, and registers the
    /// session. The write lock is held across the whole sequence so the
    /// cap check and the insert are one atomic step.
    pub async fn create_session(
        &self,
        user_id: &str,
        credentials: Credentials,
        workspace_type: Option<WorkspaceType>,
    ) -> Result<Arc<Session>, SessionError> {
        if !is_valid_user_id(user_id) {
            return Err(SessionError::InvalidUserId);
        }
        if credentials.primary.is_empty() {
            return Err(SessionError::MissingPrimaryKey);
        }

        let mut sessions = self.sessions.write().await;

        let mut active = 0usize;
        for session in sessions.values() {
            if session.user_id == user_id && session.status().await != SessionStatus::Terminated {
                active += 1;
            }
        }
        if active >= self.policy.max_sessions_per_user {
            return Err(SessionError::SessionLimitExceeded(
                self.policy.max_sessions_per_user,
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        let workspace = self.policy.base_path.join(user_id).join(&session_id);
        if !is_strictly_under(&self.policy.base_path, &workspace) {
            return Err(SessionError::PathTraversal);
        }

        let mut encrypted = HashMap::new();
        let mut env = Vec::new();
        match &self.cipher {
            Some(cipher) => {
                encrypted.insert(
                    "primary_key".to_string(),
                    cipher.encrypt(credentials.primary.as_bytes())?,
                );
                if let Some(secondary) = &credentials.secondary {
                    encrypted.insert(
                        "secondary_token".to_string(),
                        cipher.encrypt(secondary.as_bytes())?,
                    );
                }
            }
            None => {
                encrypted.insert("primary_key".to_string(), credentials.primary.clone());
                if let Some(secondary) = &credentials.secondary {
                    encrypted.insert("secondary_token".to_string(), secondary.clone());
                }
            }
        }
        env.push(("ANTHROPIC_API_KEY".to_string(), credentials.primary));
        if let Some(secondary) = credentials.secondary {
            env.push(("CLAUDE_CODE_OAUTH_TOKEN".to_string(), secondary));
        }

        create_workspace(&workspace)
            .map_err(|e| SessionError::WorkspaceCreateFailed(e.to_string()))?;

        let workspace_type = workspace_type.unwrap_or(self.policy.workspace_type);
        let spawn = Session::spawn(SpawnOptions {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            workspace: workspace.clone(),
            command: self.policy.command.clone(),
            env,
            encrypted_credentials: encrypted,
            buffer_capacity: self.policy.output_buffer_capacity,
            delete_workspace_on_cleanup: workspace_type == WorkspaceType::Isolated,
            store: self.store.clone(),
        })
        .await;

        let session = match spawn {
            Ok(session) => session,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&workspace);
                return Err(e);
            }
        };

        sessions.insert(session_id.clone(), Arc::clone(&session));
        drop(sessions);

        if let Some(db) = &self.store {
            let db = Arc::clone(db);
            let record = SessionRecord {
                session_id,
                user_id: session.user_id.clone(),
                workspace_path: session.workspace.display().to_string(),
                status: SessionStatus::Active.as_str().to_string(),
                encrypted_credentials: serde_json::json!(session.encrypted_credentials),
                last_activity: session.created_at,
                created_at: session.created_at,
            };
            store::spawn_write("upsert_session", async move {
                db.upsert_session(&record).await
            });
        }

        Ok(session)
    }

    /// Returns the session iff it exists, is not terminated, and is
    /// owned by `user_id`. Any mismatch is `NotFound` — ownership
    /// failures must not reveal that the id exists.
    pub async fn get_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match session {
            Some(s) if s.user_id == user_id && s.status().await != SessionStatus::Terminated => {
                Ok(s)
            }
            _ => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    /// Snapshot of summaries for the caller's sessions. Order is not
    /// guaranteed.
    pub async fn list_sessions_for_user(&self, user_id: &str) -> Vec<SessionSummary> {
        let owned: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect()
        };
        let mut summaries = Vec::with_capacity(owned.len());
        for session in owned {
            let summary = session.summary().await;
            if summary.status != SessionStatus::Terminated {
                summaries.push(summary);
            }
        }
        summaries
    }

    /// Terminates a session owned by `user_id` and deletes its store
    /// record. A repeat call finds nothing and returns `NotFound`.
    pub async fn terminate_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<(), SessionError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session_id) {
                Some(s) if s.user_id == user_id => sessions.remove(session_id),
                _ => None,
            }
        };
        let session = session.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        session.cleanup().await;

        if let Some(db) = &self.store {
            let db = Arc::clone(db);
            let id = session_id.to_string();
            store::spawn_write("delete_session", async move { db.delete_session(&id).await });
        }
        log::info!("session {session_id} terminated by {user_id}");
        Ok(())
    }

    /// Number of sessions currently registered, for health probes.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Tears down every session concurrently. Called on shutdown.
    pub async fn cleanup_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        if drained.is_empty() {
            return;
        }
        log::info!("cleaning up {} session(s)", drained.len());
        let mut tasks = JoinSet::new();
        for session in drained {
            tasks.spawn(async move { session.cleanup().await });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Startup recovery: every session row left `initializing` or
    /// `active` by a previous run is marked terminated. The in-memory
    /// map always starts empty; PTYs do not survive restarts.
    pub async fn recover_sessions(&self) {
        if let Some(db) = &self.store {
            match db.mark_stale_terminated().await {
                Ok(count) if count > 0 => {
                    log::info!("marked {count} stale session(s) terminated")
                }
                Ok(_) => {}
                Err(e) => log::warn!("stale session recovery failed: {e}"),
            }
        }
    }

    /// One reaper pass: snapshot candidates under the read lock, then
    /// remove and clean up each one under the write lock. Candidates are
    /// sessions past the idle timeout and sessions whose reader already
    /// marked them terminated.
    pub async fn reap_once(&self) {
        let now = Utc::now();
        let idle_cutoff = chrono::Duration::from_std(self.policy.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));

        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let summary = session.summary().await;
                let idle = now - summary.last_activity > idle_cutoff;
                if idle || summary.status == SessionStatus::Terminated {
                    expired.push((id.clone(), idle));
                }
            }
        }

        for (id, idle) in expired {
            let session = {
                let mut sessions = self.sessions.write().await;
                sessions.remove(&id)
            };
            if let Some(session) = session {
                if idle {
                    log::info!("session {id} idle past timeout, reaping");
                }
                session.cleanup().await;
            }
        }
    }

    /// Spawns the long-lived reaper task. Stops when the shutdown
    /// channel flips.
    pub fn start_timeout_reaper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => manager.reap_once().await,
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("timeout reaper stopped");
        })
    }
}

/// `^[A-Za-z0-9_-]+$`
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lexically normalizes a path: resolves `.` and `..` without touching
/// the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// True iff `candidate` normalizes to a proper descendant of `base`.
fn is_strictly_under(base: &Path, candidate: &Path) -> bool {
    let base = normalize(base);
    let candidate = normalize(candidate);
    candidate.starts_with(&base) && candidate != base
}

fn create_workspace(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
