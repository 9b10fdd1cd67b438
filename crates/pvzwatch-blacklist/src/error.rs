use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Neither a username nor a name was given")]
    EmptyQuery,

    #[error("No active blacklist chats registered")]
    NoChats,

    #[error(transparent)]
    Client(#[from] pvzwatch_telegram::ClientError),

    #[error(transparent)]
    Store(#[from] pvzwatch_store::StoreError),
}

pub type Result<T> = std::result::Result<T, SearchError>;
