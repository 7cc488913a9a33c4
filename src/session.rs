//! Caller-side handle for one in-flight request (spec §4.6).
//!
//! Holds a non-owning reference to the channel — a session is short-lived
//! and never outlives the node that created it (spec §9 "Cyclic references
//! between node and session"). The resend thunk captures the original send
//! arguments by value, not the session itself, so retries don't need to
//! reach back into the node.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::channel::{Channel, ReplyResult};
use crate::encoding;
use crate::error::{RemoteError, WaitForReplyError, WormholeError};
use crate::id::{MessageId, NodeId};

pub type ResendThunk =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = MessageId> + Send>> + Send + Sync>;

/// The outcome of one `wait_for_reply`, decode-agnostic.
#[derive(Clone, Debug)]
enum Outcome {
    Success(Option<Vec<u8>>),
    Error(Vec<u8>),
}

struct SessionState {
    message_id: MessageId,
    cached: Option<Outcome>,
    claimer: NodeId,
}

/// A caller-side handle to one in-flight request.
pub struct Session {
    channel: Arc<dyn Channel>,
    resend: ResendThunk,
    reply_timeout_s: u64,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(channel: Arc<dyn Channel>, message_id: MessageId, reply_timeout_s: u64, resend: ResendThunk) -> Self {
        Self {
            channel,
            resend,
            reply_timeout_s,
            state: Mutex::new(SessionState {
                message_id,
                cached: None,
                claimer: NodeId::empty(),
            }),
        }
    }

    pub async fn message_id(&self) -> MessageId {
        self.state.lock().await.message_id
    }

    pub async fn claimer(&self) -> NodeId {
        self.state.lock().await.claimer
    }

    /// Non-blocking check; `true` once a reply is available, at which point
    /// the outcome is fetched and cached (spec §4.6 `poll`).
    pub async fn poll(&self) -> Result<bool, WormholeError> {
        let message_id = self.state.lock().await.message_id;
        if !self.channel.check_for_reply(message_id).await.map_err(|e| {
            WormholeError::Channel(e)
        })? {
            return Ok(false);
        }
        let _ = self.wait_raw(0).await;
        Ok(true)
    }

    async fn wait_raw(&self, retries: u32) -> Result<Outcome, WormholeError> {
        {
            let guard = self.state.lock().await;
            if let Some(outcome) = &guard.cached {
                return Ok(outcome.clone());
            }
        }

        let mut retries_left = retries;
        loop {
            let message_id = self.state.lock().await.message_id;
            let result = self
                .channel
                .wait_for_reply(message_id, self.reply_timeout_s)
                .await
                .map_err(WormholeError::Channel)?;

            match result {
                ReplyResult::NoHandlers if retries_left > 0 => {
                    retries_left -= 1;
                    let new_id = (self.resend)().await;
                    self.state.lock().await.message_id = new_id;
                    continue;
                }
                ReplyResult::NoHandlers => {
                    let outcome = Outcome::Error(Vec::new());
                    let mut guard = self.state.lock().await;
                    guard.cached = Some(outcome.clone());
                    return Ok(outcome);
                }
                ReplyResult::Timeout { claimer } => {
                    let mut guard = self.state.lock().await;
                    guard.claimer = claimer;
                    // timed out with a known claimer: not retried (spec §4.6,
                    // §7 "retried up to retries times only when no claimer
                    // was ever recorded"). Surfaced as an empty error payload,
                    // distinguished from NoHandlers at the `wait` call site.
                    let outcome = Outcome::Error(Vec::new());
                    guard.cached = Some(outcome.clone());
                    return Ok(outcome);
                }
                ReplyResult::Error { claimer, payload } => {
                    let mut guard = self.state.lock().await;
                    guard.claimer = claimer;
                    let outcome = Outcome::Error(payload);
                    guard.cached = Some(outcome.clone());
                    return Ok(outcome);
                }
                ReplyResult::Success { claimer, payload } => {
                    let mut guard = self.state.lock().await;
                    guard.claimer = claimer;
                    let outcome = Outcome::Success(payload);
                    guard.cached = Some(outcome.clone());
                    return Ok(outcome);
                }
            }
        }
    }

    /// Await the reply and decode it as `T`.
    ///
    /// `raise_on_error = true`: a remote handler error or an unclaimed
    /// message raises; `raise_on_error = false`: the decoded (possibly
    /// `None`) success value is returned even on the error path, best-effort.
    pub async fn wait<T: DeserializeOwned>(
        &self,
        raise_on_error: bool,
        retries: u32,
    ) -> Result<Option<T>, WormholeError> {
        let outcome = self.wait_raw(retries).await?;
        match outcome {
            Outcome::Success(None) => Ok(None),
            Outcome::Success(Some(payload)) => {
                let value: T = encoding::decode(&payload).map_err(WormholeError::Decode)?;
                Ok(Some(value))
            }
            Outcome::Error(payload) => {
                if !raise_on_error {
                    return Ok(None);
                }
                let claimer = self.state.lock().await.claimer;
                if payload.is_empty() {
                    return Err(if claimer.is_empty() {
                        WaitForReplyError::NoHandlers.into()
                    } else {
                        WaitForReplyError::TimeoutFrom(claimer).into()
                    });
                }
                let message: String = encoding::decode(&payload)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&payload).into_owned());
                Err(RemoteError { message }.into())
            }
        }
    }
}
