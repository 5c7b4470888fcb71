//! Credential decryption, isolated behind the internal key.

pub mod broker;
pub mod cipher;
pub mod remote;

pub use broker::{CredentialSource, ImportReport, ResolvedCredential, SecretsBroker};
pub use cipher::SecretCipher;
pub use remote::RemoteBrokerClient;
