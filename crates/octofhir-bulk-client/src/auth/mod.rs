//! SMART Backend Services authorization.
//!
//! - [`key`] - private key validation and signing algorithm assignment
//! - [`assertion`] - RFC 7523 client assertion JWTs
//! - [`granter`] - client-credentials token requests

pub mod assertion;
pub mod granter;
pub mod key;

pub use assertion::ClientAssertionClaims;
pub use granter::{AccessToken, CredentialGranter, TokenEndpointMetadata};
pub use key::{ClientKey, KeyKind};
