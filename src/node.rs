//! The node runtime (spec §4.3): handler table, group membership, the main
//! blocking multi-queue pop loop, command dispatch, and the bounded-parallelism
//! worker pool (spec §4.5).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::channel::{Channel, ReplyResult};
use crate::command::{self, Command, CommandHandler, CommandMarker, Ping};
use crate::config::{AsyncMode, NodeConfig};
use crate::encoding;
use crate::error::{
    ChannelError, HandlerError, RemoteError, SendError, UnknownCommandError, WaitForReplyError,
    WormholeError,
};
use crate::id::{MessageId, NodeId};
use crate::message;
use crate::queue::QueueUri;
use crate::session::{ResendThunk, Session};

/// How long a single `pop_next` call blocks (spec §5 "Suspension points": at
/// most one second per call, so `stop` stays responsive).
const LOOP_TICK_SECS: u64 = 1;

/// Group presence TTL: loop tick plus slack (spec §4.3 step 3).
const GROUP_TOUCH_TTL: u64 = LOOP_TICK_SECS + 5;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered handler, type-erased. `self: Arc<Self>` lets the dispatch
/// loop hand a cheap clone into a spawned worker task without requiring the
/// wrapped closure itself to be `Clone`.
pub trait Handler: Send + Sync + 'static {
    fn call(self: Arc<Self>, payload: Vec<u8>) -> BoxFuture<Result<Vec<u8>, Vec<u8>>>;
}

struct TypedHandler<F> {
    f: F,
}

impl<T, R, F, Fut> Handler for TypedHandler<F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, String>> + Send + 'static,
{
    fn call(self: Arc<Self>, payload: Vec<u8>) -> BoxFuture<Result<Vec<u8>, Vec<u8>>> {
        Box::pin(async move {
            let value: T = encoding::decode(&payload)
                .map_err(|e| encoding::encode(&e.to_string()))?;
            match (self.f)(value).await {
                Ok(reply) => Ok(encoding::encode(&reply)),
                Err(message) => Err(encoding::encode(&message)),
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Inactive,
    Active,
    Deactivating,
}

/// One running participant (spec §3 "Lifecycle", §4.3).
pub struct Node {
    pub id: NodeId,
    channel: Arc<dyn Channel>,
    config: NodeConfig,
    handlers: Mutex<HashMap<QueueUri, Arc<dyn Handler>>>,
    groups: Mutex<HashSet<String>>,
    previous_groups: Mutex<HashSet<String>>,
    commands: Mutex<HashMap<u8, Arc<dyn CommandHandler>>>,
    state: Mutex<NodeState>,
    start_time: Mutex<Option<Instant>>,
    live_workers: AtomicUsize,
    parallel_admitting: AtomicBool,
    worker_done: Notify,
}

impl Node {
    pub fn new(channel: Arc<dyn Channel>, config: NodeConfig) -> Arc<Self> {
        let mut commands: HashMap<u8, Arc<dyn CommandHandler>> = HashMap::new();
        commands.insert(Ping::HEADER, Arc::new(CommandMarker::<Ping>::new()));
        Arc::new(Self {
            id: NodeId::new(),
            channel,
            config,
            handlers: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            previous_groups: Mutex::new(HashSet::new()),
            commands: Mutex::new(commands),
            state: Mutex::new(NodeState::Inactive),
            start_time: Mutex::new(None),
            live_workers: AtomicUsize::new(0),
            parallel_admitting: AtomicBool::new(true),
            worker_done: Notify::new(),
        })
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub async fn state(&self) -> NodeState {
        *self.state.lock().await
    }

    fn private_queue(&self) -> QueueUri {
        QueueUri::new(self.id.as_hex())
    }

    // ---- handler registration (spec §4.3 "Registration") ----

    pub async fn register_handler<T, R, F, Fut>(
        &self,
        base: impl Into<String>,
        tag: Option<String>,
        f: F,
    ) -> Result<(), HandlerError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let mut uri = QueueUri::new(base.into());
        if let Some(tag) = tag {
            uri = uri.with_tag(tag);
        }
        {
            let mut handlers = self.handlers.lock().await;
            if handlers.contains_key(&uri) {
                return Err(HandlerError::AlreadyRegistered(uri.to_string()));
            }
            handlers.insert(uri, Arc::new(TypedHandler { f }));
        }
        self.send_refresh().await;
        Ok(())
    }

    pub async fn unregister_handler(
        &self,
        base: impl Into<String>,
        tag: Option<String>,
    ) -> Result<(), HandlerError> {
        let mut uri = QueueUri::new(base.into());
        if let Some(tag) = tag {
            uri = uri.with_tag(tag);
        }
        {
            let mut handlers = self.handlers.lock().await;
            if handlers.remove(&uri).is_none() {
                return Err(HandlerError::NotRegistered(uri.to_string()));
            }
        }
        self.send_refresh().await;
        Ok(())
    }

    pub async fn unregister_all_handlers(&self) {
        self.handlers.lock().await.clear();
        self.send_refresh().await;
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }

    // ---- group membership ----

    pub async fn add_to_group(&self, group: impl Into<String>) {
        self.groups.lock().await.insert(group.into());
    }

    pub async fn remove_from_group(&self, group: impl AsRef<str>) {
        self.groups.lock().await.remove(group.as_ref());
    }

    // ---- commands (spec §4.4) ----

    pub async fn learn_command(&self, handler: Arc<dyn CommandHandler>) {
        self.commands.lock().await.insert(handler.header(), handler);
    }

    pub async fn unlearn_command(&self, header: u8) {
        self.commands.lock().await.remove(&header);
    }

    /// `func(receiver).wait()` round trip via the `Ping` command (spec §4.3
    /// "Utilities").
    pub async fn ping(&self, receiver: NodeId) -> Result<f64, WormholeError> {
        self.send_command(receiver, &Ping::now()).await
    }

    pub async fn uptime(&self, receiver: NodeId) -> Result<f64, WormholeError> {
        let framed = command::frame(b'u', &[]);
        let reply = self.send_private_and_wait(receiver, framed).await?;
        let value: f64 = encoding::decode(&reply).map_err(WormholeError::Decode)?;
        Ok(value)
    }

    /// Send the `s` (stop) command, non-raising, then optionally wait for
    /// the node to reach [`NodeState::Inactive`] (spec §4.3, §4.5).
    pub async fn stop(&self, wait: bool) {
        self.parallel_admitting.store(false, Ordering::SeqCst);
        self.send_private_frame(b's', &[]).await;
        if !wait {
            return;
        }
        while self.live_workers.load(Ordering::SeqCst) > 0 {
            self.worker_done.notified().await;
        }
        while *self.state.lock().await != NodeState::Inactive {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Send an arbitrary [`Command`] to `receiver`'s private queue and await
    /// its response (spec §4.4 `Command::send`).
    pub async fn send_command<C: Command>(&self, receiver: NodeId, cmd: &C) -> Result<C::Response, WormholeError> {
        let framed = command::frame(C::HEADER, &cmd.serialize_request());
        let reply = self.send_private_and_wait(receiver, framed).await?;
        C::deserialize_response(&reply).map_err(WormholeError::Decode)
    }

    async fn send_private_and_wait(&self, receiver: NodeId, framed: Vec<u8>) -> Result<Vec<u8>, WormholeError> {
        let uri = QueueUri::new(receiver.as_hex());
        let id = self
            .channel
            .enqueue(self.id, &uri, framed, self.config.send_timeout_s, 0)
            .await
            .map_err(WormholeError::Channel)?;
        let result = self
            .channel
            .wait_for_reply(id, self.config.reply_expiration_s)
            .await
            .map_err(WormholeError::Channel)?;
        match result {
            ReplyResult::Success { payload: Some(bytes), .. } => Ok(bytes),
            ReplyResult::Success { payload: None, .. } => Ok(Vec::new()),
            ReplyResult::Error { payload, .. } => {
                let message = encoding::decode::<String>(&payload)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&payload).into_owned());
                Err(RemoteError { message }.into())
            }
            ReplyResult::NoHandlers => Err(WaitForReplyError::NoHandlers.into()),
            ReplyResult::Timeout { claimer } => Err(WaitForReplyError::TimeoutFrom(claimer).into()),
        }
    }

    async fn send_refresh(&self) {
        self.send_private_frame(b'r', &[]).await;
    }

    async fn send_private_frame(&self, header: u8, body: &[u8]) {
        if self.channel.is_closed() {
            return;
        }
        let framed = command::frame(header, body);
        let uri = self.private_queue();
        if let Err(e) = self
            .channel
            .enqueue(self.id, &uri, framed, LOOP_TICK_SECS, message::DONT_REPLY)
            .await
        {
            tracing::warn!(error = %e, "failed to enqueue private command frame");
        }
    }

    // ---- send / RPC (spec §4.3 "Send") ----

    /// Exactly one of `tag`/`group` or `session` may be set (spec §4.3).
    /// `session` addresses the destination group as the given claimer id,
    /// routing the new request to whoever served the prior one.
    pub async fn send<T: Serialize>(
        &self,
        base: impl Into<String>,
        data: &T,
        tag: Option<String>,
        group: Option<String>,
        session: Option<NodeId>,
    ) -> Result<Arc<Session>, WormholeError> {
        if session.is_some() && (tag.is_some() || group.is_some()) {
            return Err(
                SendError("exactly one of session, and tag/group, may be given".into()).into(),
            );
        }
        let effective_group = session.map(|claimer| claimer.as_hex()).or(group);
        let payload = encoding::encode(data);
        self.send_encoded(base.into(), tag, effective_group, payload)
            .await
    }

    /// As [`Self::send`], but for payloads already encoded upstream (bytes
    /// passthrough callers, spec §4.1).
    pub async fn send_raw_bytes(
        &self,
        base: impl Into<String>,
        bytes: &[u8],
        tag: Option<String>,
        group: Option<String>,
        session: Option<NodeId>,
    ) -> Result<Arc<Session>, WormholeError> {
        if session.is_some() && (tag.is_some() || group.is_some()) {
            return Err(
                SendError("exactly one of session, and tag/group, may be given".into()).into(),
            );
        }
        let effective_group = session.map(|claimer| claimer.as_hex()).or(group);
        let payload = encoding::encode_bytes(bytes);
        self.send_encoded(base.into(), tag, effective_group, payload)
            .await
    }

    async fn send_encoded(
        &self,
        base: String,
        tag: Option<String>,
        group: Option<String>,
        payload: Vec<u8>,
    ) -> Result<Arc<Session>, WormholeError> {
        let uri = build_uri(&base, &tag, &group);
        let id = self
            .channel
            .enqueue(self.id, &uri, payload.clone(), self.config.send_timeout_s, 0)
            .await
            .map_err(WormholeError::Channel)?;

        let resend: ResendThunk = {
            let channel = self.channel.clone();
            let sender = self.id;
            let send_timeout_s = self.config.send_timeout_s;
            Arc::new(move || {
                let channel = channel.clone();
                let uri = uri.clone();
                let payload = payload.clone();
                Box::pin(async move {
                    channel
                        .enqueue(sender, &uri, payload, send_timeout_s, 0)
                        .await
                        .unwrap_or_else(|_| MessageId::empty())
                })
            })
        };

        Ok(Arc::new(Session::new(
            self.channel.clone(),
            id,
            self.config.reply_expiration_s,
            resend,
        )))
    }

    // ---- main loop (spec §4.3 "Main loop (process_blocking)") ----

    fn is_handling_enabled(&self) -> bool {
        match self.config.async_mode {
            AsyncMode::Inline => true,
            AsyncMode::Pool { max_parallel } => {
                self.parallel_admitting.load(Ordering::SeqCst)
                    && self.live_workers.load(Ordering::SeqCst) < max_parallel
            }
        }
    }

    async fn build_listen_set(&self) -> Vec<QueueUri> {
        let mut set = vec![self.private_queue()];
        if !self.is_handling_enabled() {
            // saturated: stop claiming externally-visible queues so other
            // nodes advertising the same queues pick up the slack (spec §4.5).
            return set;
        }
        let handlers = self.handlers.lock().await;
        let groups = self.groups.lock().await;
        let self_group = self.id.as_hex();
        for uri in handlers.keys() {
            set.push(uri.clone());
            for group in groups.iter().chain(std::iter::once(&self_group)) {
                set.push(uri.clone().with_group(group.clone()));
            }
        }
        set
    }

    /// Build the current listen set, refresh group presence, and run one
    /// blocking `pop_next`. Runs until the node leaves [`NodeState::Active`]
    /// or the channel closes.
    pub async fn process_blocking(self: Arc<Self>) {
        *self.state.lock().await = NodeState::Active;
        *self.start_time.lock().await = Some(Instant::now());

        loop {
            if *self.state.lock().await != NodeState::Active {
                break;
            }

            let listen_set = self.build_listen_set().await;

            let current_groups: HashSet<String> = self.groups.lock().await.iter().cloned().collect();
            let removed: Vec<String> = {
                let mut prev = self.previous_groups.lock().await;
                let removed: Vec<String> = prev.difference(&current_groups).cloned().collect();
                *prev = current_groups.clone();
                removed
            };
            if !removed.is_empty() {
                if let Err(e) = self.channel.remove_from_groups(&removed, self.id).await {
                    tracing::warn!(error = %e, "remove_from_groups failed");
                }
            }
            let group_list: Vec<String> = current_groups.into_iter().collect();
            if let Err(e) = self
                .channel
                .touch_for_groups(&group_list, self.id, GROUP_TOUCH_TTL)
                .await
            {
                tracing::warn!(error = %e, "touch_for_groups failed");
            }

            match self.channel.pop_next(self.id, &listen_set, LOOP_TICK_SECS).await {
                Ok(None) => continue,
                Ok(Some(popped)) => {
                    tracing::trace!(queue = %popped.queue, "popped message");
                    self.clone().dispatch(popped).await;
                }
                Err(ChannelError::Closed) => {
                    tracing::debug!(node = %self.id, "channel closed, exiting loop");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pop_next error");
                }
            }
        }

        self.handlers.lock().await.clear();
        self.groups.lock().await.clear();
        *self.state.lock().await = NodeState::Inactive;
    }

    async fn dispatch(self: Arc<Self>, popped: crate::channel::PopResult) {
        let uri = popped.queue.without_group();
        if uri.base == self.id.as_hex() {
            self.handle_command(popped).await;
            return;
        }

        let handler = self.handlers.lock().await.get(&uri).cloned();
        let Some(handler) = handler else {
            tracing::warn!(queue = %uri, "popped message for an unregistered handler");
            return;
        };

        match self.config.async_mode {
            AsyncMode::Inline => {
                self.execute_handler(handler, popped).await;
            }
            AsyncMode::Pool { .. } => {
                self.live_workers.fetch_add(1, Ordering::SeqCst);
                let node = self.clone();
                tokio::spawn(async move {
                    node.execute_handler(handler, popped).await;
                    node.live_workers.fetch_sub(1, Ordering::SeqCst);
                    node.worker_done.notify_one();
                    node.send_refresh().await;
                });
            }
        }
    }

    /// Invoke `handler`, then reply with the outcome (spec §4.3
    /// "Handler dispatch"). A `DONT_REPLY` flag still runs the handler but
    /// suppresses the reply write.
    async fn execute_handler(&self, handler: Arc<dyn Handler>, popped: crate::channel::PopResult) {
        let dont_reply = popped.flags & message::DONT_REPLY != 0;
        let result = handler.call(popped.payload).await;
        if dont_reply {
            return;
        }
        let reply_timeout = self.config.reply_expiration_s;
        let outcome = match result {
            Ok(bytes) => self.channel.reply(popped.message_id, bytes, false, reply_timeout).await,
            Err(bytes) => self.channel.reply(popped.message_id, bytes, true, reply_timeout).await,
        };
        // channel-closed and connection errors are swallowed on the reply
        // path (spec §4.2) — the handler already ran, there's nothing useful
        // left to do beyond logging.
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "reply after handler dispatch failed");
        }
    }

    async fn uptime_secs(&self) -> f64 {
        match *self.start_time.lock().await {
            Some(t) => t.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    async fn handle_command(&self, popped: crate::channel::PopResult) {
        let dont_reply = popped.flags & message::DONT_REPLY != 0;
        let Some((header, body)) = command::unframe(&popped.payload) else {
            tracing::warn!("empty private-queue payload");
            return;
        };

        match header {
            b's' => {
                *self.state.lock().await = NodeState::Deactivating;
            }
            b'r' => {
                // no-op: the loop rebuilds the listen set from current state
                // every iteration; popping this frame is the whole point.
            }
            b'u' => {
                if !dont_reply {
                    let elapsed = self.uptime_secs().await;
                    let reply_timeout = self.config.reply_expiration_s;
                    if let Err(e) = self
                        .channel
                        .reply(popped.message_id, encoding::encode(&elapsed), false, reply_timeout)
                        .await
                    {
                        tracing::warn!(error = %e, "uptime reply failed");
                    }
                }
            }
            other => {
                let handler = self.commands.lock().await.get(&other).cloned();
                let outcome: Result<Vec<u8>, WormholeError> = match handler {
                    Some(h) => h.handle(body),
                    None => Err(UnknownCommandError(other).into()),
                };
                if dont_reply {
                    return;
                }
                let reply_timeout = self.config.reply_expiration_s;
                let send_result = match outcome {
                    Ok(bytes) => self.channel.reply(popped.message_id, bytes, false, reply_timeout).await,
                    Err(e) => {
                        self.channel
                            .reply(popped.message_id, encoding::encode(&e.to_string()), true, reply_timeout)
                            .await
                    }
                };
                if let Err(e) = send_result {
                    tracing::warn!(error = %e, "command reply failed");
                }
            }
        }
    }
}

fn build_uri(base: &str, tag: &Option<String>, group: &Option<String>) -> QueueUri {
    let mut uri = QueueUri::new(base);
    if let Some(group) = group {
        uri = uri.with_group(group.clone());
    }
    if let Some(tag) = tag {
        uri = uri.with_tag(tag.clone());
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeBroker;
    use std::time::Duration;

    fn new_node(config: NodeConfig) -> Arc<Node> {
        let broker: Arc<dyn Channel> = Arc::new(FakeBroker::new());
        Node::new(broker, config)
    }

    #[tokio::test]
    async fn scalar_rpc_sum() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        node.register_handler("sum", None, |xs: Vec<i64>| async move {
            Ok::<i64, String>(xs.iter().sum())
        })
        .await
        .unwrap();

        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());

        let session = node.send("sum", &vec![1i64, 1, 3], None, None, None).await.unwrap();
        let result: Option<i64> = session.wait(true, 0).await.unwrap();
        assert_eq!(result, Some(5));

        node.stop(true).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        node.register_handler("x", None, |v: i64| async move { Ok::<i64, String>(v) })
            .await
            .unwrap();
        let err = node
            .register_handler("x", None, |v: i64| async move { Ok::<i64, String>(v) })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn unregister_missing_fails() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        let err = node.unregister_handler("nope", None).await.unwrap_err();
        assert!(matches!(err, HandlerError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());
        // give the loop a tick to enter ACTIVE and start listening
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rtt = node.ping(node.id).await.unwrap();
        assert!(rtt < 0.5, "ping took {rtt}s");

        node.stop(true).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn uptime_is_nonnegative_and_increases() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = node.uptime(node.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = node.uptime(node.id).await.unwrap();
        assert!(second >= first);

        node.stop(true).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn send_to_missing_handler_retries_resend_thunk() {
        let node = new_node(NodeConfig::new("redis://unused/").with_reply_expiration_s(1));
        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let session = node
            .send("nobody-home", &1i64, None, None, None)
            .await
            .unwrap();
        let result: Result<Option<i64>, _> = session.wait(true, 1).await;
        assert!(result.is_err());

        node.stop(true).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn backpressure_trims_listen_set_when_saturated() {
        let config = NodeConfig::new("redis://unused/").with_pool(1);
        let node = new_node(config);
        node.register_handler("slow", None, |_: i64| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<i64, String>(0)
        })
        .await
        .unwrap();

        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // saturate the single worker slot
        let _s1 = node.send("slow", &1i64, None, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!node.is_handling_enabled());

        node.stop(true).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn group_add_remove_reflected_after_one_tick() {
        let node = new_node(NodeConfig::new("redis://unused/"));
        node.add_to_group("G").await;

        let loop_node = node.clone();
        let handle = tokio::spawn(loop_node.process_blocking());
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(node
            .channel()
            .find_group_members("G")
            .await
            .unwrap()
            .contains(&node.id));

        node.remove_from_group("G").await;
        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!node
            .channel()
            .find_group_members("G")
            .await
            .unwrap()
            .contains(&node.id));

        node.stop(true).await;
        handle.await.unwrap();
    }
}
