//! The broker abstraction (spec §4.2): enqueue, blocking multi-pop, reply
//! posting/polling, group membership, named locks, rate stats, close.
//!
//! [`Channel`] is the trait every node talks to. [`redis_channel::RedisChannel`]
//! is the production implementation over a Redis-style broker;
//! [`fake::FakeBroker`] is an in-memory double with the same contract, used
//! throughout the test suite the way the teacher's `host_client::test_utils`
//! `LocalFakeServer` stands in for real USB/serial transport.

pub mod fake;
pub mod redis_channel;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::id::{MessageId, NodeId};
use crate::queue::QueueUri;

/// Result of a successful [`Channel::pop_next`].
#[derive(Clone, Debug)]
pub struct PopResult {
    pub queue: QueueUri,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub flags: u32,
}

/// Result of [`Channel::wait_for_reply`] (spec §4.2).
#[derive(Clone, Debug)]
pub enum ReplyResult {
    /// The empty pop timed out and no node ever claimed the message (`hid` unset).
    NoHandlers,
    /// The empty pop timed out but a claimer had already been recorded.
    Timeout { claimer: NodeId },
    /// The handler raised; `payload` is the still-encoded error value.
    Error { claimer: NodeId, payload: Vec<u8> },
    /// The handler completed; `payload` is `None` when `out` was never set
    /// (e.g. a `DONT_REPLY` send), which the caller treats as a null reply.
    Success {
        claimer: NodeId,
        payload: Option<Vec<u8>>,
    },
}

/// Rolling per-node send/receive rates (spec §4.2, §4.2.1). `-1.0` means
/// "no window has closed yet" or "stats are disabled".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateStats {
    pub sends_per_second: f64,
    pub processing_per_second: f64,
}

impl RateStats {
    pub const DISABLED: RateStats = RateStats {
        sends_per_second: -1.0,
        processing_per_second: -1.0,
    };
}

/// The broker contract. All operations are safe to call from multiple nodes
/// sharing one channel (spec §5 "Shared resource policy") — implementations
/// must route everything through atomic broker primitives rather than
/// holding synchronized client-side state beyond simple counters.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn enqueue(
        &self,
        sender_id: NodeId,
        queue: &QueueUri,
        payload: Vec<u8>,
        timeout_s: u64,
        flags: u32,
    ) -> Result<MessageId, ChannelError>;

    /// Blocking pop from any of `queues`. `None` on timeout.
    async fn pop_next(
        &self,
        receiver_id: NodeId,
        queues: &[QueueUri],
        timeout_s: u64,
    ) -> Result<Option<PopResult>, ChannelError>;

    async fn reply(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        is_error: bool,
        timeout_s: u64,
    ) -> Result<(), ChannelError>;

    async fn check_for_reply(&self, message_id: MessageId) -> Result<bool, ChannelError>;

    async fn wait_for_reply(
        &self,
        message_id: MessageId,
        timeout_s: u64,
    ) -> Result<ReplyResult, ChannelError>;

    async fn delete(&self, message_id: MessageId) -> Result<(), ChannelError>;

    async fn touch_for_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
        ttl_s: u64,
    ) -> Result<(), ChannelError>;

    async fn remove_from_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
    ) -> Result<(), ChannelError>;

    async fn find_group_members(&self, group: &str) -> Result<Vec<NodeId>, ChannelError>;

    /// `lock_timeout_s = None` means no TTL is applied to the held lock.
    async fn lock(
        &self,
        name: &str,
        block: bool,
        block_timeout_s: u64,
        lock_timeout_s: Option<u64>,
    ) -> Result<Option<String>, ChannelError>;

    async fn release(&self, name: &str, secret: &str, force: bool) -> Result<bool, ChannelError>;

    async fn is_locked(&self, name: &str) -> Result<bool, ChannelError>;

    async fn get_stats(&self, node: NodeId) -> Result<RateStats, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;

    fn is_closed(&self) -> bool;
}
