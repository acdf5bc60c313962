//! `jobwatch-auth`: bearer credential handling for the job client.
//!
//! This crate is intentionally decoupled from HTTP: it only decides whether a
//! stored credential may be attached to an outgoing request.

pub mod credential;
pub mod store;

pub use credential::{Credential, CredentialError, validate_credential};
pub use store::CredentialStore;
