//! Domain models for mirrored merchant data

mod credential;
mod record;
mod watermark;

pub use credential::{Credential, CredentialState, TokenGrant};
pub use record::{Customer, Order, Payment, Record, RecordId, Resource};
pub use watermark::SyncWatermark;
