//! Record extraction
//!
//! Turns fetched documents into structured records according to declarative
//! page mappings (selector plus optional transform per field).

mod extractor;
mod record;
mod transform;

pub use extractor::{DiscoveredLink, Extractor, ParsedPage};
pub use record::{FieldDiagnostic, FieldValue, Record};
pub use transform::Transform;

use thiserror::Error;

/// Errors raised while extracting a page
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Malformed document at {url}: {reason}")]
    MalformedDocument { url: String, reason: String },
}
