pub mod error;
pub mod output;
pub mod session;
pub mod session_manager;
pub mod store;
pub mod vault;

pub use error::{SessionError, StoreError, VaultError};
pub use output::{OutputBuffer, OutputChunk, Utf8Decoder};
pub use session::{Session, SessionStatus, SessionSummary};
pub use session_manager::{Credentials, SessionManager, SessionPolicy};
pub use store::{PgStore, SessionRecord, SessionStore};
pub use vault::CredentialCipher;
