//! Error kinds, kept disjoint so callers can branch on kind rather than message.
//!
//! Mirrors the shape of the teacher's `host_client::HostErr<WireErr>`: one
//! small enum per failure domain, unified by [`WormholeError`] where a
//! single fallible surface is needed.

use thiserror::Error;

use crate::id::NodeId;

/// Payload could not be turned back into a value.
#[derive(Debug, Error)]
#[error("decode error: malformed payload ({len} bytes): {repr}")]
pub struct DecodeError {
    pub len: usize,
    /// A diagnostic `Debug`-style representation of the offending bytes.
    pub repr: String,
}

impl DecodeError {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len(),
            repr: format!("{:?}", bytes.iter().take(64).collect::<Vec<_>>()),
        }
    }
}

/// A queue URI failed the `wh://base[:group][/tag]` grammar.
#[derive(Debug, Error)]
#[error("invalid queue name: {0:?}")]
pub struct QueueUriError(pub String);

/// Handler table precondition violated.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler already registered for {0}")]
    AlreadyRegistered(String),
    #[error("no handler registered for {0}")]
    NotRegistered(String),
}

/// Channel-level failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("broker connection error: {0}")]
    Connection(String),
}

/// `wait_for_reply` could not produce a successful outcome.
#[derive(Debug, Error)]
pub enum WaitForReplyError {
    #[error("no node ever claimed the message")]
    NoHandlers,
    #[error("claimer {0:?} timed out before replying")]
    TimeoutFrom(NodeId),
}

/// The remote handler raised; carries the decoded error payload it sent back.
#[derive(Debug, Error)]
#[error("remote handler error: {message}")]
pub struct RemoteError {
    pub message: String,
}

/// A private-queue payload had no matching command header.
#[derive(Debug, Error)]
#[error("unknown command header: {0:#04x}")]
pub struct UnknownCommandError(pub u8);

/// Caller-side misuse of an API, e.g. passing both `session` and `tag`/`group`.
#[derive(Debug, Error)]
#[error("send error: {0}")]
pub struct SendError(pub String);

/// Unified error type for call sites that need one `Result` surface.
#[derive(Debug, Error)]
pub enum WormholeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    QueueUri(#[from] QueueUriError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    WaitForReply(#[from] WaitForReplyError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommandError),
    #[error(transparent)]
    Send(#[from] SendError),
}
