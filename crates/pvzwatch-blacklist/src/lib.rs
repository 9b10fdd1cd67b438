//! On-demand blacklist search: a three-phase scan (username substring,
//! resolved numeric id, name tokens) over every registered blacklist chat or
//! forum topic, on a session that is opened and closed per call.

mod error;
mod search;

pub use error::SearchError;
pub use search::{
    BlacklistSearch, ExtractedInfo, SearchHit, SearchMiss, SearchOutcome, SearchQuery,
};
