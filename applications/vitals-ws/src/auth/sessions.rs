//! Device session registry
//!
//! Tracks which devices currently hold a live authenticated session. Sessions
//! slide forward on every successful liveness check and are evicted by a
//! periodic sweep. Liveness is always re-verified on lookup, so eviction
//! timing never decides whether an expired session is trusted.

use crate::auth::credentials::CredentialValidator;
use crate::error::AuthError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub device_id: String,
    pub last_seen_at: DateTime<Utc>,
}

impl DeviceSession {
    fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_seen_at > timeout
    }
}

pub struct SessionRegistry {
    validator: CredentialValidator,
    sessions: DashMap<String, DeviceSession>,
    timeout: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(validator: CredentialValidator, timeout: Duration) -> Self {
        Self {
            validator,
            sessions: DashMap::new(),
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    pub fn credentials(&self) -> &CredentialValidator {
        &self.validator
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    /// Authenticate a device handshake presented at `timestamp`.
    pub fn authenticate(
        &self,
        device_id: &str,
        api_key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<DeviceSession, AuthError> {
        self.authenticate_at(device_id, api_key, timestamp, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        device_id: &str,
        api_key: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeviceSession, AuthError> {
        if !self.validator.validate(device_id, api_key) {
            tracing::warn!(device_id = %device_id, "Invalid device API key");
            return Err(AuthError::InvalidCredentials);
        }

        let skew = (now - timestamp).abs();
        if skew > self.timeout {
            tracing::warn!(
                device_id = %device_id,
                presented = %timestamp,
                skew_ms = skew.num_milliseconds(),
                "Stale authentication message"
            );
            return Err(AuthError::StaleTimestamp);
        }

        Ok(self.upsert(device_id, now))
    }

    /// Header-style credential check used by request endpoints.
    ///
    /// Shares the validator with the handshake path; a successful check opens
    /// or refreshes the device session just like a handshake would.
    pub fn authorize(&self, device_id: &str, api_key: &str) -> Result<DeviceSession, AuthError> {
        self.authorize_at(device_id, api_key, Utc::now())
    }

    pub fn authorize_at(
        &self,
        device_id: &str,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceSession, AuthError> {
        if !self.validator.validate(device_id, api_key) {
            tracing::warn!(device_id = %device_id, "Invalid device API key");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(self.upsert(device_id, now))
    }

    fn upsert(&self, device_id: &str, now: DateTime<Utc>) -> DeviceSession {
        let session = DeviceSession {
            device_id: device_id.to_string(),
            last_seen_at: now,
        };
        self.sessions.insert(device_id.to_string(), session.clone());
        tracing::info!(device_id = %device_id, "Device authenticated successfully");
        session
    }

    /// True iff the device holds an unexpired session. Refreshes `last_seen_at`.
    pub fn is_authenticated(&self, device_id: &str) -> bool {
        self.is_authenticated_at(device_id, Utc::now())
    }

    pub fn is_authenticated_at(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) => {
                if !session.is_expired(now, self.timeout) {
                    if now > session.last_seen_at {
                        session.last_seen_at = now;
                    }
                    return true;
                }
            }
            None => return false,
        }

        // The entry guard is released before removal; dashmap shards are not reentrant.
        let timeout = self.timeout;
        if self
            .sessions
            .remove_if(device_id, |_, s| s.is_expired(now, timeout))
            .is_some()
        {
            tracing::info!(device_id = %device_id, "Session expired");
        }
        false
    }

    pub fn session(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.get(device_id).map(|s| s.clone())
    }

    pub fn remove(&self, device_id: &str) {
        if self.sessions.remove(device_id).is_some() {
            tracing::info!(device_id = %device_id, "Device removed from authenticated list");
        }
    }

    pub fn authenticated_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }

    /// Evict every session idle longer than the timeout. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.timeout;
        let mut evicted = 0;
        self.sessions.retain(|device_id, session| {
            if session.is_expired(now, timeout) {
                tracing::info!(device_id = %device_id, "Removed stale device");
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Run [`SessionRegistry::sweep`] on a fixed interval until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Session sweeper started (interval: {}s)", every.as_secs());

            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::debug!("Session sweep evicted {} device(s)", evicted);
                }
            }
        })
    }
}
