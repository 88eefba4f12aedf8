use thiserror::Error;

/// Errors from the credential vault.
///
/// `Auth` covers both a corrupted ciphertext and a wrong key; the AEAD tag
/// check cannot distinguish the two, so neither can we.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption key must be 64 hex characters")]
    KeyFormat,
    #[error("ciphertext authentication failed")]
    Auth,
    #[error("malformed ciphertext: {0}")]
    Encoding(String),
    #[error("encryption failed")]
    Encrypt,
}

/// Errors surfaced by session lifecycle operations.
///
/// Ownership mismatches map to `NotFound` on purpose: the API must not
/// reveal whether a session id exists for another user.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("user id must match ^[A-Za-z0-9_-]+$")]
    InvalidUserId,
    #[error("session limit reached (max {0} per user)")]
    SessionLimitExceeded(usize),
    #[error("credentials must include a primary key")]
    MissingPrimaryKey,
    #[error("workspace path escapes the configured base")]
    PathTraversal,
    #[error("failed to create workspace: {0}")]
    WorkspaceCreateFailed(String),
    #[error("failed to start PTY: {0}")]
    PtyStartFailed(String),
    #[error("failed to encrypt credentials: {0}")]
    EncryptFailed(#[from] VaultError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} is not active")]
    NotActive(String),
    #[error("command exceeds {0} bytes")]
    CommandTooLong(usize),
    #[error("commands are limited to one per {0} ms")]
    CommandRateLimited(u64),
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    #[error("cols and rows must be positive")]
    InvalidSize,
}

/// Errors from the durable store. Never propagated to the request path;
/// background writers log and drop them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
