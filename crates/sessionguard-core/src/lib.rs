//! sessionguard-core - client-side session token lifecycle.
//!
//! Acquires, stores, validates and transparently refreshes short-lived access
//! tokens for outbound API calls. Concurrent callers that hit an expired token
//! share a single refresh call, and a request refused with 401 is replayed once
//! with a fresh token.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiError, HttpIdentityClient, IdentityProvider, LoginCredentials, TokenGrant};
pub use auth::{
    CredentialPair, DecodedClaims, EncryptedFileTokenStore, FileTokenStore, KeychainTokenStore,
    LoginOutcome, MemoryTokenStore, RefreshCoordinator, SessionError, SessionEvent, SessionManager,
    StoredSession, TokenCodec, TokenStore, UserClaims,
};
pub use config::{SessionConfig, StoreBackend};
