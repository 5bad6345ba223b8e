//! Error types surfaced by the token manager and the sync engine

/// Fatal failure of a sync attempt
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No credential row exists for the account
    #[error("No credential stored for account {account_id}, re-authorization required")]
    NoCredential { account_id: String },

    /// Access secret expired and no usable refresh secret remains
    #[error(
        "Credential for account {account_id} expired and cannot be refreshed, \
         re-authorization required"
    )]
    RefreshExpired { account_id: String },

    /// The token endpoint rejected or failed the refresh call.
    ///
    /// Not retried: the single-use refresh secret may already be consumed.
    #[error("Token refresh for account {account_id} failed")]
    RefreshFailed {
        account_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A store read or write failed
    #[error("Storage unavailable")]
    Storage(#[from] anyhow::Error),
}

/// What a caller can do about a [`SyncError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A new authorization handshake is required
    NeedsReauthorization,
    /// Retrying later may succeed
    Transient,
    /// The local store cannot be used
    StorageUnavailable,
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::NoCredential { .. } | SyncError::RefreshExpired { .. } => {
                FailureKind::NeedsReauthorization
            }
            SyncError::RefreshFailed { .. } => FailureKind::Transient,
            SyncError::Storage(_) => FailureKind::StorageUnavailable,
        }
    }
}

/// Failure of a single listing request
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// HTTP 429 from the listing endpoint
    #[error("Rate limited by remote API")]
    RateLimited,

    /// Any other HTTP, network or decoding failure
    #[error("Listing request failed")]
    Remote(#[source] anyhow::Error),
}
