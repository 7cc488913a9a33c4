//! In-memory broker double implementing the same [`Channel`] contract a
//! real Redis-backed broker would. Mirrors the teacher's
//! `host_client::test_utils::LocalFakeServer` role: every test in this
//! crate drives nodes against a [`FakeBroker`] instead of a live broker.
//!
//! TTLs are tracked as real wall-clock deadlines (via [`tokio::time::Instant`])
//! rather than collapsed away, so lock-liveness and message-expiry tests can
//! observe real expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Channel, PopResult, RateStats, ReplyResult};
use crate::error::ChannelError;
use crate::id::{MessageId, NodeId};
use crate::message::MessageRecord;
use crate::queue::QueueUri;

#[derive(Clone, Copy)]
struct ReplyToken {
    is_error: bool,
}

struct LockState {
    secret: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct NodeStats {
    send_count: u64,
    send_window_start: Option<Instant>,
    last_send_rate: f64,
    recv_count: u64,
    recv_window_start: Option<Instant>,
    last_recv_rate: f64,
}

impl NodeStats {
    fn new() -> Self {
        Self {
            last_send_rate: -1.0,
            last_recv_rate: -1.0,
            ..Default::default()
        }
    }
}

const STATS_WINDOW: Duration = Duration::from_secs(60);
const STATS_EVENT_CAP: u64 = 2000;

struct Inner {
    messages: HashMap<MessageId, MessageRecord>,
    message_expiry: HashMap<MessageId, Instant>,
    queues: HashMap<QueueUri, VecDeque<MessageId>>,
    responses: HashMap<MessageId, VecDeque<ReplyToken>>,
    groups: HashMap<String, HashMap<NodeId, Instant>>,
    locks: HashMap<String, LockState>,
    stats: HashMap<NodeId, NodeStats>,
    closed: bool,
}

/// An in-memory stand-in for the shared broker, safe to clone-share (via
/// `Arc`) across many simulated nodes in one process.
pub struct FakeBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    stats_enabled: bool,
    seq: AtomicU64,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::with_stats(true)
    }

    pub fn with_stats(stats_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: HashMap::new(),
                message_expiry: HashMap::new(),
                queues: HashMap::new(),
                responses: HashMap::new(),
                groups: HashMap::new(),
                locks: HashMap::new(),
                stats: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            stats_enabled,
            seq: AtomicU64::new(0),
        }
    }

    fn fresh_secret(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.seq.fetch_add(1, Ordering::Relaxed);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    async fn wait_until<F, T>(&self, timeout_s: u64, mut check: F) -> Option<T>
    where
        F: FnMut(&mut Inner) -> Option<T>,
    {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_s as f64);
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(v) = check(&mut guard) {
                    return Some(v);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    fn record_send(stats: &mut NodeStats, now: Instant) {
        if stats.send_window_start.is_none() {
            stats.send_window_start = Some(now);
        }
        stats.send_count += 1;
        let elapsed = now.duration_since(stats.send_window_start.unwrap()).as_secs_f64();
        if elapsed >= STATS_WINDOW.as_secs_f64() || stats.send_count >= STATS_EVENT_CAP {
            stats.last_send_rate = if elapsed > 0.0 {
                stats.send_count as f64 / elapsed
            } else {
                stats.send_count as f64
            };
            stats.send_count = 0;
            stats.send_window_start = Some(now);
        }
    }

    fn record_recv(stats: &mut NodeStats, now: Instant) {
        if stats.recv_window_start.is_none() {
            stats.recv_window_start = Some(now);
        }
        stats.recv_count += 1;
        let elapsed = now.duration_since(stats.recv_window_start.unwrap()).as_secs_f64();
        if elapsed >= STATS_WINDOW.as_secs_f64() || stats.recv_count >= STATS_EVENT_CAP {
            stats.last_recv_rate = if elapsed > 0.0 {
                stats.recv_count as f64 / elapsed
            } else {
                stats.recv_count as f64
            };
            stats.recv_count = 0;
            stats.recv_window_start = Some(now);
        }
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for FakeBroker {
    async fn enqueue(
        &self,
        sender_id: NodeId,
        queue: &QueueUri,
        payload: Vec<u8>,
        timeout_s: u64,
        flags: u32,
    ) -> Result<MessageId, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let message_id = MessageId::new();
        let mut guard = self.inner.lock().await;
        guard
            .messages
            .insert(message_id, MessageRecord::new(payload, flags));
        let expiry = Instant::now() + Duration::from_secs(timeout_s + 2);
        guard.message_expiry.insert(message_id, expiry);
        guard.queues.entry(queue.clone()).or_default().push_front(message_id);
        if self.stats_enabled {
            let stats = guard.stats.entry(sender_id).or_insert_with(NodeStats::new);
            Self::record_send(stats, Instant::now());
        }
        drop(guard);
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn pop_next(
        &self,
        receiver_id: NodeId,
        queues: &[QueueUri],
        timeout_s: u64,
    ) -> Result<Option<PopResult>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let queues_owned: Vec<QueueUri> = queues.to_vec();
        let found = self
            .wait_until(timeout_s, move |inner| {
                // randomize order client-side to reduce starvation (spec §4.2).
                let mut order: Vec<usize> = (0..queues_owned.len()).collect();
                shuffle(&mut order);
                let now = Instant::now();
                for idx in order {
                    let q = &queues_owned[idx];
                    if let Some(ids) = inner.queues.get_mut(q) {
                        while let Some(message_id) = ids.pop_back() {
                            if inner
                                .message_expiry
                                .get(&message_id)
                                .is_some_and(|expires_at| *expires_at <= now)
                            {
                                inner.messages.remove(&message_id);
                                inner.message_expiry.remove(&message_id);
                            }
                            // tolerate a stale husk (data key missing, including one
                            // just reaped by TTL) as if timed out for *this* queue
                            // slot, but keep looking at this queue.
                            if !inner.messages.contains_key(&message_id) {
                                continue;
                            }
                            if let Some(record) = inner.messages.get_mut(&message_id) {
                                record.claimer = Some(receiver_id);
                                let flags = record.meta;
                                let payload = record.input.clone();
                                return Some(PopResult {
                                    queue: q.clone(),
                                    message_id,
                                    payload,
                                    flags,
                                });
                            }
                        }
                    }
                }
                None
            })
            .await;

        if self.stats_enabled {
            if found.is_some() {
                let mut guard = self.inner.lock().await;
                let stats = guard.stats.entry(receiver_id).or_insert_with(NodeStats::new);
                Self::record_recv(stats, Instant::now());
            }
        }
        Ok(found)
    }

    async fn reply(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        is_error: bool,
        timeout_s: u64,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            // tolerate closed-channel errors silently on the reply path (spec §4.2).
            return Ok(());
        }
        let mut guard = self.inner.lock().await;
        let Some(record) = guard.messages.get_mut(&message_id) else {
            return Ok(());
        };
        if is_error {
            record.err = Some(payload);
        } else {
            record.output = Some(payload);
        }
        let expiry = Instant::now() + Duration::from_secs(timeout_s + 2);
        guard.message_expiry.insert(message_id, expiry);
        guard
            .responses
            .entry(message_id)
            .or_default()
            .push_back(ReplyToken { is_error });
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn check_for_reply(&self, message_id: MessageId) -> Result<bool, ChannelError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .responses
            .get(&message_id)
            .map(|q| !q.is_empty())
            .unwrap_or(false))
    }

    async fn wait_for_reply(
        &self,
        message_id: MessageId,
        timeout_s: u64,
    ) -> Result<ReplyResult, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let popped = self
            .wait_until(timeout_s, move |inner| {
                let q = inner.responses.get_mut(&message_id)?;
                q.pop_front()
            })
            .await;

        let Some(token) = popped else {
            let guard = self.inner.lock().await;
            let claimer = guard.messages.get(&message_id).and_then(|r| r.claimer);
            return Ok(match claimer {
                None => ReplyResult::NoHandlers,
                Some(claimer) => ReplyResult::Timeout { claimer },
            });
        };

        let mut guard = self.inner.lock().await;
        let record = guard.messages.remove(&message_id);
        guard.message_expiry.remove(&message_id);
        guard.responses.remove(&message_id);
        let Some(record) = record else {
            return Ok(ReplyResult::NoHandlers);
        };
        let claimer = record.claimer.unwrap_or(NodeId::empty());
        if token.is_error {
            Ok(ReplyResult::Error {
                claimer,
                payload: record.err.unwrap_or_default(),
            })
        } else {
            Ok(ReplyResult::Success {
                claimer,
                payload: record.output,
            })
        }
    }

    async fn delete(&self, message_id: MessageId) -> Result<(), ChannelError> {
        let mut guard = self.inner.lock().await;
        guard.messages.remove(&message_id);
        guard.message_expiry.remove(&message_id);
        guard.responses.remove(&message_id);
        Ok(())
    }

    async fn touch_for_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
        ttl_s: u64,
    ) -> Result<(), ChannelError> {
        let mut guard = self.inner.lock().await;
        let expiry = Instant::now() + Duration::from_secs(ttl_s);
        for group in groups {
            guard
                .groups
                .entry(group.clone())
                .or_default()
                .insert(receiver, expiry);
        }
        Ok(())
    }

    async fn remove_from_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
    ) -> Result<(), ChannelError> {
        let mut guard = self.inner.lock().await;
        for group in groups {
            if let Some(members) = guard.groups.get_mut(group) {
                members.remove(&receiver);
            }
        }
        Ok(())
    }

    async fn find_group_members(&self, group: &str) -> Result<Vec<NodeId>, ChannelError> {
        let guard = self.inner.lock().await;
        let now = Instant::now();
        Ok(guard
            .groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn lock(
        &self,
        name: &str,
        block: bool,
        block_timeout_s: u64,
        lock_timeout_s: Option<u64>,
    ) -> Result<Option<String>, ChannelError> {
        loop {
            let secret = self.fresh_secret();
            {
                let mut guard = self.inner.lock().await;
                reap_expired_lock(&mut guard, name);
                if !guard.locks.contains_key(name) {
                    let expires_at = lock_timeout_s.map(|s| Instant::now() + Duration::from_secs(s));
                    guard.locks.insert(
                        name.to_string(),
                        LockState {
                            secret: secret.clone(),
                            expires_at,
                        },
                    );
                    return Ok(Some(secret));
                }
            }
            if !block {
                return Ok(None);
            }
            let name_owned = name.to_string();
            let woke = self
                .wait_until(block_timeout_s, move |inner| {
                    reap_expired_lock(inner, &name_owned);
                    (!inner.locks.contains_key(&name_owned)).then_some(())
                })
                .await;
            if woke.is_none() {
                return Ok(None);
            }
        }
    }

    async fn release(&self, name: &str, secret: &str, force: bool) -> Result<bool, ChannelError> {
        let mut guard = self.inner.lock().await;
        reap_expired_lock(&mut guard, name);
        let Some(state) = guard.locks.get(name) else {
            return Ok(false);
        };
        if !force && state.secret != secret {
            return Ok(false);
        }
        guard.locks.remove(name);
        drop(guard);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn is_locked(&self, name: &str) -> Result<bool, ChannelError> {
        let mut guard = self.inner.lock().await;
        reap_expired_lock(&mut guard, name);
        Ok(guard.locks.contains_key(name))
    }

    async fn get_stats(&self, node: NodeId) -> Result<RateStats, ChannelError> {
        if !self.stats_enabled {
            return Ok(RateStats::DISABLED);
        }
        let guard = self.inner.lock().await;
        let stats = guard.stats.get(&node);
        Ok(RateStats {
            sends_per_second: stats.map(|s| s.last_send_rate).unwrap_or(-1.0),
            processing_per_second: stats.map(|s| s.last_recv_rate).unwrap_or(-1.0),
        })
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut guard = self.inner.lock().await;
        guard.closed = true;
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        // best-effort synchronous check; `try_lock` avoids making this async.
        self.inner.try_lock().map(|g| g.closed).unwrap_or(false)
    }
}

fn reap_expired_lock(inner: &mut Inner, name: &str) {
    let expired = inner
        .locks
        .get(name)
        .and_then(|s| s.expires_at)
        .map(|at| at <= Instant::now())
        .unwrap_or(false);
    if expired {
        inner.locks.remove(name);
    }
}

fn shuffle(order: &mut [usize]) {
    use rand::seq::SliceRandom;
    order.shuffle(&mut rand::thread_rng());
}
