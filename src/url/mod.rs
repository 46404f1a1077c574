//! URL handling module for Dredge
//!
//! Normalization gives every URL a single frontier identity; the host key
//! groups URLs for per-host rate limiting.

mod host;
mod normalize;

pub use host::{host_key, resolve_link};
pub use normalize::normalize_url;
