//! A single PTY-backed session and its resources.
//!
//! Each session owns one PTY pair, one child process, and one output
//! reader. The reader is a dedicated OS thread (PTY reads block) feeding
//! a bounded channel drained by a tokio task that appends to the session
//! buffer. Cleanup escalates SIGTERM → SIGKILL on the child's process
//! group, closes the PTY to EOF the reader, and is idempotent.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use super::error::SessionError;
use super::output::{OutputBuffer, OutputChunk, Utf8Decoder};
use super::store::{self, SessionStore};

/// Maximum accepted command size in bytes.
pub const COMMAND_MAX_BYTES: usize = 16384;
/// Minimum spacing between two commands on one session.
pub const COMMAND_MIN_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 256;
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Terminated => "terminated",
        }
    }
}

/// Snapshot of a session for listings and the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Mutable state guarded by the session lock.
struct SessionState {
    status: SessionStatus,
    output: OutputBuffer,
    last_activity: DateTime<Utc>,
    last_command_at: Option<Instant>,
}

/// Everything needed to spawn a session; built by the manager.
pub struct SpawnOptions {
    pub id: String,
    pub user_id: String,
    pub workspace: PathBuf,
    /// Command line of the wrapped tool, split on whitespace.
    pub command: String,
    /// Extra child environment, including the decrypted credentials.
    /// Consumed here and never stored.
    pub env: Vec<(String, String)>,
    /// Ciphertexts as persisted; kept for store upserts only.
    pub encrypted_credentials: HashMap<String, String>,
    pub buffer_capacity: usize,
    pub delete_workspace_on_cleanup: bool,
    pub store: Option<Arc<dyn SessionStore>>,
}

/// A live PTY session. Shared as `Arc<Session>`; all mutation goes
/// through the internal locks.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub encrypted_credentials: HashMap<String, String>,

    state: RwLock<SessionState>,
    /// Writer half of the PTY master. `None` once cleanup closed it.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Master PTY handle, used for resize. `None` once cleanup closed it.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    child_pid: i32,
    #[cfg(unix)]
    pgid: i32,
    /// Stops the drain task during cleanup.
    done: Notify,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    cleaned: AtomicBool,
    delete_workspace: bool,
    store: Option<Arc<dyn SessionStore>>,
}

impl Session {
    /// Spawns the wrapped tool in a fresh PTY and starts the output
    /// reader. The returned session is `Active`.
    pub async fn spawn(opts: SpawnOptions) -> Result<Arc<Self>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyStartFailed(format!("openpty: {e}")))?;

        let mut parts = opts.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SessionError::PtyStartFailed("empty command".to_string()))?;
        let mut cmd = CommandBuilder::new(program);
        cmd.args(parts);
        cmd.cwd(&opts.workspace);
        cmd.env("TERM", "xterm-256color");
        cmd.env("TERMBRIDGE_SESSION_ID", &opts.id);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::PtyStartFailed(format!("spawn: {e}")))?;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| SessionError::PtyStartFailed("no child pid".to_string()))?;

        // portable-pty calls setsid() on spawn, so the child leads its own
        // process group; read it from the master rather than assuming.
        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::PtyStartFailed(format!("take writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyStartFailed(format!("clone reader: {e}")))?;

        let now = Utc::now();
        let session = Arc::new(Session {
            id: opts.id,
            user_id: opts.user_id,
            workspace: opts.workspace,
            created_at: now,
            encrypted_credentials: opts.encrypted_credentials,
            state: RwLock::new(SessionState {
                status: SessionStatus::Initializing,
                output: OutputBuffer::new(opts.buffer_capacity),
                last_activity: now,
                last_command_at: None,
            }),
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(Some(child)),
            child_pid,
            #[cfg(unix)]
            pgid,
            done: Notify::new(),
            reader_handle: Mutex::new(None),
            cleaned: AtomicBool::new(false),
            delete_workspace: opts.delete_workspace_on_cleanup,
            store: opts.store,
        });

        // The slave is the child's side; the master keeps the PTY alive.
        drop(pair.slave);

        Arc::clone(&session).start_reader(reader)?;
        session.state.write().await.status = SessionStatus::Active;

        log::info!(
            "session {} spawned (pid={child_pid}, user={})",
            session.id,
            session.user_id
        );
        Ok(session)
    }

    /// Starts the blocking reader thread and the async drain task.
    fn start_reader(
        self: Arc<Self>,
        mut reader: Box<dyn Read + Send>,
    ) -> Result<(), SessionError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_DEPTH);
        let id = self.id.clone();

        let handle = std::thread::Builder::new()
            .name(format!("pty-reader-{id}"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break, // EOF — child exited or PTY closed
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break; // receiver gone
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("pty reader {id}: {e}");
                            break;
                        }
                    }
                }
                log::debug!("pty reader {id} exited");
            })
            .map_err(|e| SessionError::PtyStartFailed(format!("reader thread: {e}")))?;

        match self.reader_handle.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(e) => log::warn!("session {}: reader handle lock poisoned: {e}", self.id),
        }

        let session = self;
        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            loop {
                tokio::select! {
                    data = rx.recv() => match data {
                        Some(bytes) => {
                            let text = decoder.decode(&bytes);
                            if !text.is_empty() {
                                session.append_output(text).await;
                            }
                        }
                        None => {
                            // EOF from the reader thread: the child is gone.
                            session.mark_terminated().await;
                            break;
                        }
                    },
                    _ = session.done.notified() => break,
                }
            }
            log::debug!("session {} drain task exited", session.id);
        });

        Ok(())
    }

    /// Appends one decoded chunk under the session lock, evicting the
    /// oldest chunks past capacity, and logs it to the store.
    async fn append_output(&self, text: String) {
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            state.output.push(OutputChunk {
                timestamp: now,
                data: text.clone(),
            });
            state.last_activity = now;
        }
        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let id = self.id.clone();
            store::spawn_write("append_output", async move {
                store.append_output(&id, now, &text).await
            });
        }
    }

    /// Flips the status to `Terminated` without tearing anything down.
    /// The reaper removes terminated sessions on its next pass.
    async fn mark_terminated(&self) {
        {
            let mut state = self.state.write().await;
            if state.status == SessionStatus::Terminated {
                return;
            }
            state.status = SessionStatus::Terminated;
        }
        log::info!("session {} terminated (PTY closed)", self.id);
        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let id = self.id.clone();
            store::spawn_write("update_status", async move {
                store.update_status(&id, SessionStatus::Terminated.as_str()).await
            });
        }
    }

    /// Writes a sanitized command to the PTY.
    ///
    /// Rejects commands over [`COMMAND_MAX_BYTES`] and commands arriving
    /// within [`COMMAND_MIN_INTERVAL`] of the previous one. Control bytes
    /// other than TAB, LF, and CR are stripped silently.
    pub async fn send_command(&self, command: &[u8]) -> Result<(), SessionError> {
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            if state.status != SessionStatus::Active {
                return Err(SessionError::NotActive(self.id.clone()));
            }
            if command.len() > COMMAND_MAX_BYTES {
                return Err(SessionError::CommandTooLong(COMMAND_MAX_BYTES));
            }
            if let Some(prev) = state.last_command_at {
                if prev.elapsed() < COMMAND_MIN_INTERVAL {
                    return Err(SessionError::CommandRateLimited(
                        COMMAND_MIN_INTERVAL.as_millis() as u64,
                    ));
                }
            }

            let cleaned = sanitize_command(command);
            let write_result = {
                let mut writer = self
                    .writer
                    .lock()
                    .map_err(|e| SessionError::WriteFailed(format!("writer lock poisoned: {e}")))?;
                match writer.as_mut() {
                    Some(w) => w.write_all(&cleaned).and_then(|_| w.flush()),
                    None => {
                        return Err(SessionError::WriteFailed("PTY already closed".to_string()))
                    }
                }
            };
            if let Err(e) = write_result {
                // A dead PTY won't come back; let the reaper collect it.
                state.status = SessionStatus::Terminated;
                return Err(SessionError::WriteFailed(e.to_string()));
            }

            state.last_command_at = Some(Instant::now());
            state.last_activity = now;
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let id = self.id.clone();
            store::spawn_write("update_last_activity", async move {
                store.update_last_activity(&id, now).await
            });
        }
        Ok(())
    }

    /// Returns a consistent snapshot of the output buffer, emptying it
    /// atomically with the copy when `clear` is set.
    pub async fn output(&self, clear: bool) -> Vec<OutputChunk> {
        if clear {
            self.state.write().await.output.drain()
        } else {
            self.state.read().await.output.snapshot()
        }
    }

    /// Applies a terminal window size to the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize);
        }
        let master = self
            .master
            .lock()
            .map_err(|e| SessionError::ResizeFailed(format!("master lock poisoned: {e}")))?;
        match master.as_ref() {
            Some(m) => m
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::ResizeFailed(e.to_string())),
            None => Err(SessionError::ResizeFailed("PTY already closed".to_string())),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.state.read().await.last_activity
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.read().await;
        SessionSummary {
            session_id: self.id.clone(),
            status: state.status,
            last_activity: state.last_activity,
            created_at: self.created_at,
        }
    }

    /// Tears the session down: kills the child process group with a
    /// SIGTERM → SIGKILL escalation, closes the PTY (which EOFs the
    /// reader), reaps the child, joins the reader thread, and removes
    /// the workspace when it is session-owned. Safe to call repeatedly;
    /// only the first call does work.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.write().await.status = SessionStatus::Terminated;
        self.done.notify_one();

        #[cfg(unix)]
        {
            let pgid = self.pgid;
            let pid = self.child_pid;
            // Negative pgid signals the whole group.
            if unsafe { libc::kill(-pgid, libc::SIGTERM) } != 0 {
                log::debug!(
                    "session {}: SIGTERM pgid {pgid}: {}",
                    self.id,
                    std::io::Error::last_os_error()
                );
            }
            let exited = tokio::time::timeout(KILL_GRACE, async {
                loop {
                    if unsafe { libc::kill(pid, 0) } != 0 {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            if exited.is_err() {
                log::warn!("session {} required SIGKILL (pid={pid})", self.id);
                let _ = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            }
        }

        // Closing the master/writer FDs makes the reader thread see EOF.
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        drop(writer);
        let master = self.master.lock().ok().and_then(|mut m| m.take());
        drop(master);

        // Reap the child so it does not linger as a zombie.
        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            #[cfg(not(unix))]
            let _ = child.kill();
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
        }

        let handle = self.reader_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        if self.delete_workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "session {}: failed to remove workspace {}: {e}",
                        self.id,
                        self.workspace.display()
                    );
                }
            }
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let id = self.id.clone();
            store::spawn_write("update_status", async move {
                store.update_status(&id, SessionStatus::Terminated.as_str()).await
            });
        }
        log::info!("session {} cleaned up", self.id);
    }
}

/// Strips bytes in `0x00..0x1F` except TAB (0x09), LF (0x0A), and
/// CR (0x0D). Applied silently; stripping is not an error.
pub fn sanitize_command(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .copied()
        .filter(|b| *b >= 0x20 || matches!(b, 0x09 | 0x0A | 0x0D))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_printable_and_whitespace() {
        let input = b"echo hi\tthere\r\n";
        assert_eq!(sanitize_command(input), input.to_vec());
    }

    #[test]
    fn test_sanitize_strips_bel_and_esc() {
        let input = b"ok\x07\x1b[31mred";
        assert_eq!(sanitize_command(input), b"ok[31mred".to_vec());
    }

    #[test]
    fn test_sanitize_strips_nul() {
        assert_eq!(sanitize_command(b"a\x00b"), b"ab".to_vec());
    }

    #[test]
    fn test_sanitize_keeps_del_and_high_bytes() {
        // Only 0x00..0x1F is filtered; DEL and UTF-8 continuation bytes pass.
        let input: Vec<u8> = vec![0x7F, 0xC3, 0xA9];
        assert_eq!(sanitize_command(&input), input);
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(SessionStatus::Active.as_str(), "active");
        assert_eq!(SessionStatus::Terminated.as_str(), "terminated");
        assert_eq!(SessionStatus::Initializing.as_str(), "initializing");
    }
}
