use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Client(#[from] pvzwatch_telegram::ClientError),

    #[error(transparent)]
    Store(#[from] pvzwatch_store::StoreError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
