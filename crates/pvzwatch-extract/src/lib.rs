//! Field extraction from colloquial Russian shift postings, the two-level
//! dedup helpers, and the per-task business filter.

mod dedup;
mod extractor;
mod filter;

pub use dedup::{author_key, content_hash};
pub use extractor::{extract, Extracted};
pub use filter::ItemFilter;
