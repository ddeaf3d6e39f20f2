use crate::config::AuthConfig;
use std::collections::HashMap;

/// Checks a device id and API key against the configured secrets.
///
/// A per-device key takes precedence over the shared key. Devices without a
/// per-device entry fall back to the shared key when one is configured.
#[derive(Clone, Default)]
pub struct CredentialValidator {
    shared_key: Option<String>,
    device_keys: HashMap<String, String>,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("shared_key", &self.shared_key.as_ref().map(|_| "***"))
            .field("devices", &self.device_keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialValidator {
    pub fn new(shared_key: Option<String>, device_keys: HashMap<String, String>) -> Self {
        Self {
            shared_key: shared_key.filter(|k| !k.is_empty()),
            device_keys,
        }
    }

    pub fn shared(key: impl Into<String>) -> Self {
        Self::new(Some(key.into()), HashMap::new())
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.api_key.clone(), config.device_keys.clone())
    }

    pub fn validate(&self, device_id: &str, api_key: &str) -> bool {
        if device_id.is_empty() || api_key.is_empty() {
            return false;
        }

        let expected = match self
            .device_keys
            .get(device_id)
            .or(self.shared_key.as_ref())
        {
            Some(key) => key,
            None => return false,
        };

        constant_time_eq(expected.as_bytes(), api_key.as_bytes())
    }
}

/// Compares every byte of both inputs, never returning early on a mismatch.
fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    let len = expected.len().max(presented.len());
    let mut diff = expected.len() ^ presented.len();

    for i in 0..len {
        let a = expected.get(i).copied().unwrap_or(0);
        let b = presented.get(i).copied().unwrap_or(0);
        diff |= usize::from(a ^ b);
    }

    diff == 0
}
