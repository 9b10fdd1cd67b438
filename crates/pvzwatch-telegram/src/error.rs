use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The session file was revoked server-side; terminal for its task.
    #[error("Session authorization expired")]
    AuthExpired,

    #[error("Session file error: {0}")]
    Session(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
