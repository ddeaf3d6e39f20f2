pub mod credentials;
pub mod sessions;

pub use credentials::CredentialValidator;
pub use sessions::{DeviceSession, SessionRegistry};
