//! # couloir-store
//!
//! The storage boundary: an opaque keyed record store plus the persisted
//! models whose sensitive fields are sealed before they ever reach it.
//!
//! Plaintext never crosses this boundary. Encryption is per-field, not
//! per-record, so a record remains partially usable even when one field
//! fails to decrypt.

pub mod models;
pub mod store;

mod error;

pub use error::StoreError;
pub use models::{Invite, StoredMessage};
pub use store::{RecordStore, SqliteStore};
