//! HTTP side of the session.
//!
//! This module provides the `ApiClient` for making authenticated calls to the
//! application's API and the `IdentityProvider` seam for the identity
//! service's token and refresh endpoints.
//!
//! The API uses bearer token authentication; tokens come from the
//! `RefreshCoordinator`, never from the caller.

pub mod client;
pub mod error;
pub mod identity;

pub use client::{build_http_client, ApiClient};
pub use error::ApiError;
pub use identity::{HttpIdentityClient, IdentityProvider, LoginCredentials, TokenGrant};
