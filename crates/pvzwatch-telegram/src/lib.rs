//! Telegram plumbing: the MTProto user-session client behind the [`MtClient`]
//! seam, and the Bot-API notifier behind [`Notify`].
//!
//! Two session files per tenant are a hard requirement: a session opened by
//! two clients at once has its authorization keys rotated by the protocol,
//! silently breaking the other consumer. The parser session belongs to one
//! ingestion pipeline; the blacklist session is opened and closed per search.

mod client;
mod error;
mod notifier;
mod types;
mod user_client;

pub use client::MtClient;
pub use error::ClientError;
pub use notifier::{BotNotifier, Notify};
pub use types::{ChatRef, IncomingMessage};
pub use user_client::UserClient;
