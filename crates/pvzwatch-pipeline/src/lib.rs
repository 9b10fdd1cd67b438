//! Per-task ingestion: chat-spec parsing, the monitoring pipeline itself and
//! the process-wide task supervisor.

mod chatspec;
mod error;
mod pipeline;
mod supervisor;

pub use chatspec::ChatPlan;
pub use error::PipelineError;
pub use pipeline::{IngestionPipeline, PipelineConfig};
pub use supervisor::{Supervisor, TaskSnapshot};
