//! Session module: token storage, decoding, refresh coordination and the
//! `SessionManager` facade.
//!
//! - `TokenStore`: persistence for the credential pair and user snapshot
//!   (memory, JSON file, OS keychain, encrypted file)
//! - `TokenCodec`: offline decoding of token claims and expiry checks
//! - `RefreshCoordinator`: single-flight refresh with a FIFO waiter queue
//! - `SessionManager`: login, logout, status and token access for the application

pub mod codec;
pub mod encrypted;
pub mod error;
pub mod keychain;
pub mod refresh;
pub mod session;
pub mod store;

pub use codec::{DecodedClaims, TokenCodec, UserClaims};
pub use encrypted::EncryptedFileTokenStore;
pub use error::SessionError;
pub use keychain::KeychainTokenStore;
pub use refresh::RefreshCoordinator;
pub use session::{LoginOutcome, SessionEvent, SessionManager};
pub use store::{CredentialPair, FileTokenStore, MemoryTokenStore, StoredSession, TokenStore};
