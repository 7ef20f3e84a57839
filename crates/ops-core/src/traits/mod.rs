//! Core trait definitions

mod credentials;
mod transport;

pub use credentials::{Credential, CredentialProvider};
pub use transport::{Dialer, RemoteSession, Transport};
