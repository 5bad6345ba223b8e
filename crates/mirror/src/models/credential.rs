//! Stored OAuth credential for a merchant account

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access/refresh secret pair for one account
///
/// Several rows may exist per account; the one with the latest `created_at`
/// is the active credential. Rows are never mutated, a refresh inserts a new one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Merchant account identifier
    pub account_id: String,
    /// Bearer secret sent on API calls
    pub access_secret: String,
    /// Token type tag (e.g. "bearer")
    pub secret_kind: String,
    /// When the access secret stops being accepted
    pub access_expiry: DateTime<Utc>,
    /// Single-use refresh secret; `None` means the credential cannot be refreshed
    pub refresh_secret: Option<String>,
    /// When the refresh secret expires; `None` means no known expiry
    pub refresh_expiry: Option<DateTime<Utc>>,
    /// Whether the provider flagged the access secret as short lived
    pub short_lived: bool,
    /// When this row was created
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a credential at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// Access secret can be used as-is
    Valid,
    /// Access secret expired, refresh secret still usable
    Refreshable,
    /// Access secret expired and no usable refresh secret
    Unrefreshable,
}

impl Credential {
    /// Build a credential row from a token grant
    pub fn from_grant(
        account_id: impl Into<String>,
        grant: TokenGrant,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            access_secret: grant.access_token,
            secret_kind: grant.token_type,
            access_expiry: grant.expires_at,
            refresh_secret: grant.refresh_token,
            refresh_expiry: grant.refresh_token_expires_at,
            short_lived: grant.short_lived,
            created_at,
        }
    }

    /// Classify the credential at `now`
    pub fn state(&self, now: DateTime<Utc>) -> CredentialState {
        if self.access_expiry > now {
            return CredentialState::Valid;
        }
        let refresh_alive = self.refresh_secret.is_some()
            && self.refresh_expiry.is_none_or(|expiry| expiry > now);
        if refresh_alive {
            CredentialState::Refreshable
        } else {
            CredentialState::Unrefreshable
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("secret_kind", &self.secret_kind)
            .field("access_expiry", &self.access_expiry)
            .field("has_refresh_secret", &self.refresh_secret.is_some())
            .field("refresh_expiry", &self.refresh_expiry)
            .field("short_lived", &self.short_lived)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub short_lived: bool,
    #[serde(default)]
    pub merchant_id: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenGrant {
    /// Keep the previous refresh secret when the endpoint did not rotate it
    pub fn or_refresh_from(mut self, previous: &Credential) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_secret.clone();
            self.refresh_token_expires_at = previous.refresh_expiry;
        }
        self
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("short_lived", &self.short_lived)
            .field("merchant_id", &self.merchant_id)
            .finish()
    }
}
