//! Credential lifecycle management
//!
//! [`TokenManager`] hands out a usable access secret for an account,
//! refreshing it through a [`TokenEndpoint`] when it has expired. The store is
//! the only source of truth; nothing is cached between calls.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SyncError;
use crate::models::{Credential, CredentialState, TokenGrant};
use crate::storage::CredentialStore;
use crate::sync::{Clock, SystemClock};

/// Remote endpoint that exchanges a refresh secret for a new grant
pub trait TokenEndpoint: Send + Sync {
    /// Perform a `refresh_token` grant. Called at most once per refresh secret.
    fn refresh(&self, refresh_secret: &str) -> anyhow::Result<TokenGrant>;
}

/// Returns valid access secrets, refreshing expired credentials
///
/// Calls for the same account are serialized, so a single-use refresh
/// secret is presented to the endpoint at most once; later callers observe
/// the refreshed row. Calls for different accounts do not block each other.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            store,
            endpoint,
            clock: Arc::new(SystemClock),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get a currently valid access secret for the account
    ///
    /// # Errors
    /// - [`SyncError::NoCredential`] if the account has no stored credential
    /// - [`SyncError::RefreshExpired`] if the credential expired and cannot be refreshed
    /// - [`SyncError::RefreshFailed`] if the token endpoint call failed
    /// - [`SyncError::Storage`] if the store could not be read or written
    pub fn get_access_token(&self, account_id: &str) -> Result<String, SyncError> {
        let lock = self.account_lock(account_id);
        // The guarded value is (), so a poisoned lock carries no broken state
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let credential = self
            .store
            .most_recent_credential(account_id)?
            .ok_or_else(|| SyncError::NoCredential {
                account_id: account_id.to_string(),
            })?;

        let now = self.clock.now();
        match credential.state(now) {
            CredentialState::Valid => {
                debug!("Using stored access token for account {}", account_id);
                Ok(credential.access_secret)
            }
            CredentialState::Refreshable => {
                let refreshed = self.refresh(credential)?;
                Ok(refreshed.access_secret)
            }
            CredentialState::Unrefreshable => {
                warn!(
                    "Access token for account {} expired and cannot be refreshed",
                    account_id
                );
                Err(SyncError::RefreshExpired {
                    account_id: account_id.to_string(),
                })
            }
        }
    }

    /// Record a grant obtained outside the manager (e.g. the authorization
    /// handshake) as the account's newest credential
    pub fn store_grant(
        &self,
        account_id: &str,
        grant: TokenGrant,
    ) -> Result<Credential, SyncError> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut created_at = self.clock.now();
        if let Some(previous) = self.store.most_recent_credential(account_id)? {
            created_at = created_at.max(previous.created_at);
        }
        let credential = Credential::from_grant(account_id, grant, created_at);
        let stored = self
            .store
            .upsert_and_reload_credential(credential)?
            .ok_or_else(|| SyncError::NoCredential {
                account_id: account_id.to_string(),
            })?;
        info!("Stored new credential for account {}", account_id);
        Ok(stored)
    }

    /// Exchange the refresh secret, persist the result and re-read it.
    ///
    /// Must be called with the account lock held.
    fn refresh(&self, current: Credential) -> Result<Credential, SyncError> {
        let account_id = current.account_id.clone();
        let Some(refresh_secret) = current.refresh_secret.as_deref() else {
            return Err(SyncError::RefreshExpired { account_id });
        };

        info!("Refreshing access token for account {}", account_id);
        let grant = self
            .endpoint
            .refresh(refresh_secret)
            .map_err(|source| SyncError::RefreshFailed {
                account_id: account_id.clone(),
                source,
            })?
            .or_refresh_from(&current);

        // Never stamp the new row earlier than the one it replaces
        let created_at = self.clock.now().max(current.created_at);
        let replacement = Credential::from_grant(account_id.clone(), grant, created_at);

        let stored = self
            .store
            .upsert_and_reload_credential(replacement)?
            .ok_or_else(|| SyncError::NoCredential {
                account_id: account_id.clone(),
            })?;

        if stored.state(self.clock.now()) != CredentialState::Valid {
            warn!(
                "Refreshed access token for account {} is already expired (expiry {})",
                account_id, stored.access_expiry
            );
        }
        info!(
            "Access token for account {} refreshed, valid until {}",
            account_id, stored.access_expiry
        );
        Ok(stored)
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
