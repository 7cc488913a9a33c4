//! Production [`Channel`] over a Redis-style broker (spec §6 "Broker key
//! layout (bit-exact)"):
//!
//! | Key | Type | Fields / Content |
//! |---|---|---|
//! | `wh:<uid>` | hash | `in`, `meta`, `out`, `err`, `hid` |
//! | `response:wh:<uid>` | list | single token: `handled` or `error` |
//! | `wh://<base>[:<group>][/<tag>]` | list | message ids awaiting pop |
//! | `whgm://<group>/<node>` | string+TTL | node id |
//! | `whlk://<name>` | string | lock secret |
//! | `whlks://<name>` | list | wake tokens |
//! | `whstats://<node>:{sends,receive,*_touch_time}` | string | counters |
//!
//! All multi-key writes that must be atomic (enqueue, reply, group touch)
//! go through a single `MULTI`/`EXEC` pipeline rather than a Lua script
//! (spec §9(c) — accept occasional rate-stat over/under-report instead of
//! adding broker-side scripting).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Channel, PopResult, RateStats, ReplyResult};
use crate::error::ChannelError;
use crate::id::{MessageId, NodeId};
use crate::queue::QueueUri;

const STATS_WINDOW_SECS: u64 = 60;
const STATS_EVENT_CAP: u64 = 2000;

fn message_key(id: MessageId) -> String {
    format!("wh:{id}")
}

fn response_key(id: MessageId) -> String {
    format!("response:wh:{id}")
}

fn group_key(group: &str, node: NodeId) -> String {
    format!("whgm://{group}/{node}")
}

fn lock_key(name: &str) -> String {
    format!("whlk://{name}")
}

fn lock_signal_key(name: &str) -> String {
    format!("whlks://{name}")
}

pub struct RedisChannel {
    conn: ConnectionManager,
    closed: std::sync::atomic::AtomicBool,
    stats_enabled: bool,
}

impl RedisChannel {
    pub async fn connect(uri: &str, stats_enabled: bool) -> Result<Self, ChannelError> {
        let client =
            redis::Client::open(uri).map_err(|e| ChannelError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            closed: std::sync::atomic::AtomicBool::new(false),
            stats_enabled,
        })
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    async fn bump_rate(&self, node: NodeId, kind: &str) -> Result<(), ChannelError> {
        if !self.stats_enabled {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let count_key = format!("whstats://{node}:{kind}");
        let touch_key = format!("whstats://{node}:{kind}_touch_time");
        let rate_key = format!("whstats://{node}:{kind}_rate");

        let count: u64 = conn
            .incr(&count_key, 1u64)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let last_touch: Option<u64> = conn
            .get(&touch_key)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let now = now_secs();
        let last_touch = match last_touch {
            Some(t) => t,
            None => {
                let _: () = conn
                    .set(&touch_key, now)
                    .await
                    .map_err(|e| ChannelError::Connection(e.to_string()))?;
                now
            }
        };
        let elapsed = now.saturating_sub(last_touch);
        if elapsed >= STATS_WINDOW_SECS || count >= STATS_EVENT_CAP {
            let rate = if elapsed > 0 {
                count as f64 / elapsed as f64
            } else {
                count as f64
            };
            let mut pipe = redis::pipe();
            pipe.atomic()
                .set(&rate_key, rate)
                .set(&count_key, 0u64)
                .set(&touch_key, now);
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[async_trait]
impl Channel for RedisChannel {
    async fn enqueue(
        &self,
        sender_id: NodeId,
        queue: &QueueUri,
        payload: Vec<u8>,
        timeout_s: u64,
        flags: u32,
    ) -> Result<MessageId, ChannelError> {
        self.ensure_open()?;
        let message_id = MessageId::new();
        let ttl = timeout_s + 2;
        let mut conn = self.conn.clone();
        let qkey = queue.to_string();
        let mkey = message_key(message_id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&mkey, "in", payload)
            .ignore()
            .hset(&mkey, "meta", flags)
            .ignore()
            .expire(&mkey, ttl as i64)
            .ignore()
            .lpush(&qkey, message_id.as_hex())
            .ignore()
            .expire(&qkey, ttl as i64)
            .ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        self.bump_rate(sender_id, "sends").await?;
        Ok(message_id)
    }

    async fn pop_next(
        &self,
        receiver_id: NodeId,
        queues: &[QueueUri],
        timeout_s: u64,
    ) -> Result<Option<PopResult>, ChannelError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = queues.iter().map(|q| q.to_string()).collect();
        keys.shuffle(&mut rand::thread_rng());
        if keys.is_empty() {
            tokio::time::sleep(std::time::Duration::from_secs(timeout_s)).await;
            return Ok(None);
        }

        let popped: Option<(String, String)> = conn
            .blpop(keys, timeout_s as f64)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let Some((qkey, id_hex)) = popped else {
            return Ok(None);
        };
        let Ok(message_id) = id_hex.parse::<MessageId>() else {
            return Ok(None);
        };

        let mkey = message_key(message_id);
        let input: Option<Vec<u8>> = conn
            .hget(&mkey, "in")
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        // a stale husk (data key missing) is treated as a timeout for this pop.
        let Some(input) = input else {
            return Ok(None);
        };
        let flags: u32 = conn
            .hget(&mkey, "meta")
            .await
            .unwrap_or(0);
        let _: () = conn
            .hset(&mkey, "hid", receiver_id.as_hex())
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        self.bump_rate(receiver_id, "receive").await?;

        let queue = queues
            .iter()
            .find(|q| q.to_string() == qkey)
            .cloned()
            .unwrap_or_else(|| QueueUri::new(qkey));

        Ok(Some(PopResult {
            queue,
            message_id,
            payload: input,
            flags,
        }))
    }

    async fn reply(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        is_error: bool,
        timeout_s: u64,
    ) -> Result<(), ChannelError> {
        // tolerate closed-channel errors silently on the reply path (spec §4.2).
        if self.is_closed() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mkey = message_key(message_id);
        let rkey = response_key(message_id);
        let field = if is_error { "err" } else { "out" };
        let token = if is_error { "error" } else { "handled" };
        let ttl = timeout_s + 2;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&mkey, field, payload)
            .ignore()
            .expire(&mkey, ttl as i64)
            .ignore()
            .lpush(&rkey, token)
            .ignore()
            .expire(&rkey, ttl as i64)
            .ignore();
        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "reply: broker error swallowed on reply path");
                Ok(())
            }
        }
    }

    async fn check_for_reply(&self, message_id: MessageId) -> Result<bool, ChannelError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn
            .llen(response_key(message_id))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(len > 0)
    }

    async fn wait_for_reply(
        &self,
        message_id: MessageId,
        timeout_s: u64,
    ) -> Result<ReplyResult, ChannelError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let rkey = response_key(message_id);
        let popped: Option<(String, String)> = conn
            .blpop(rkey, timeout_s as f64)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let mkey = message_key(message_id);
        if popped.is_none() {
            let hid: Option<String> = conn
                .hget(&mkey, "hid")
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            return Ok(match hid.and_then(|h| h.parse::<NodeId>().ok()) {
                None => ReplyResult::NoHandlers,
                Some(claimer) => ReplyResult::Timeout { claimer },
            });
        }

        let (_, token) = popped.unwrap();
        let is_error = token == "error";
        let hid: Option<String> = conn
            .hget(&mkey, "hid")
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let claimer = hid
            .and_then(|h| h.parse::<NodeId>().ok())
            .unwrap_or(NodeId::empty());

        let result = if is_error {
            let err: Option<Vec<u8>> = conn
                .hget(&mkey, "err")
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            ReplyResult::Error {
                claimer,
                payload: err.unwrap_or_default(),
            }
        } else {
            let out: Option<Vec<u8>> = conn
                .hget(&mkey, "out")
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            ReplyResult::Success { claimer, payload: out }
        };

        let _: () = conn
            .del(&mkey)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(result)
    }

    async fn delete(&self, message_id: MessageId) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(message_key(message_id))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn touch_for_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
        ttl_s: u64,
    ) -> Result<(), ChannelError> {
        if groups.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for group in groups {
            pipe.set_ex(group_key(group, receiver), receiver.as_hex(), ttl_s)
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn remove_from_groups(
        &self,
        groups: &[String],
        receiver: NodeId,
    ) -> Result<(), ChannelError> {
        if groups.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = groups.iter().map(|g| group_key(g, receiver)).collect();
        let _: () = conn
            .del(keys)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn find_group_members(&self, group: &str) -> Result<Vec<NodeId>, ChannelError> {
        let mut conn = self.conn.clone();
        let pattern = format!("whgm://{group}/*");
        let keys: Vec<String> = conn
            .keys(pattern)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let prefix_len = format!("whgm://{group}/").len();
        Ok(keys
            .into_iter()
            .filter_map(|k| k[prefix_len..].parse::<NodeId>().ok())
            .collect())
    }

    async fn lock(
        &self,
        name: &str,
        block: bool,
        block_timeout_s: u64,
        lock_timeout_s: Option<u64>,
    ) -> Result<Option<String>, ChannelError> {
        let mut conn = self.conn.clone();
        loop {
            let mut secret_bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut secret_bytes);
            let secret: String = secret_bytes.iter().map(|b| format!("{b:02x}")).collect();

            let set: bool = conn
                .set_nx(lock_key(name), &secret)
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            if set {
                if let Some(ttl) = lock_timeout_s {
                    let _: () = conn
                        .expire(lock_key(name), ttl as i64)
                        .await
                        .map_err(|e| ChannelError::Connection(e.to_string()))?;
                }
                return Ok(Some(secret));
            }
            if !block {
                return Ok(None);
            }
            let woke: Option<(String, String)> = conn
                .blpop(lock_signal_key(name), block_timeout_s as f64)
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            if woke.is_none() {
                return Ok(None);
            }
        }
    }

    async fn release(&self, name: &str, secret: &str, force: bool) -> Result<bool, ChannelError> {
        let mut conn = self.conn.clone();
        let current: Option<String> = conn
            .get(lock_key(name))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let Some(current) = current else {
            return Ok(false);
        };
        if !force && current != secret {
            return Ok(false);
        }
        // spec §4.2: delete the key, push a wake token, and set a short TTL
        // on the (now deleted) lock key slot as a cleanup hint.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(lock_key(name))
            .ignore()
            .lpush(lock_signal_key(name), "released")
            .ignore()
            .expire(lock_key(name), 30)
            .ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(true)
    }

    async fn is_locked(&self, name: &str) -> Result<bool, ChannelError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(lock_key(name))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(exists)
    }

    async fn get_stats(&self, node: NodeId) -> Result<RateStats, ChannelError> {
        if !self.stats_enabled {
            return Ok(RateStats::DISABLED);
        }
        let mut conn = self.conn.clone();
        let sends: Option<f64> = conn
            .get(format!("whstats://{node}:sends_rate"))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let receive: Option<f64> = conn
            .get(format!("whstats://{node}:receive_rate"))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(RateStats {
            sends_per_second: sends.unwrap_or(-1.0),
            processing_per_second: receive.unwrap_or(-1.0),
        })
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
