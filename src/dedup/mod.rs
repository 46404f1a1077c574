//! Record deduplication
//!
//! Identity keys and content hashes are pure functions of record content.
//! Classification compares a record with the stored entity for its key and
//! runs inside the persistence transaction.

mod classify;
mod identity;

pub use classify::{classify, Classification, FieldChange};
pub use identity::{compute_content_hash, compute_identity_key};
