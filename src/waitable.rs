//! Ad-hoc receive-side primitive (spec §4.7): an observer with no
//! registered handler claims a message from a chosen set of queues.
//!
//! This bypasses normal dispatch entirely — it is just another blocking
//! `pop_next` call racing whichever node's main loop is also listening on
//! the same queue (spec §4.7: "whichever call is blocked in `pop_next`
//! first wins; the loser sees timeout").

use std::sync::Arc;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::id::{MessageId, NodeId};
use crate::message::Message;
use crate::queue::QueueUri;

/// A target descriptor for [`wait_for_any`]: a plain queue base, an
/// optionally-tagged queue, or a typed message class.
#[derive(Clone, Debug)]
pub struct Waitable(QueueUri);

impl Waitable {
    pub fn queue(base: impl Into<String>) -> Self {
        Self(QueueUri::new(base))
    }

    pub fn tagged(base: impl Into<String>, tag: impl Into<String>) -> Self {
        Self(QueueUri::new(base).with_tag(tag))
    }

    pub fn message<M: Message>() -> Self {
        Self(QueueUri::new(M::queue_base()))
    }

    pub fn tagged_message<M: Message>(tag: impl Into<String>) -> Self {
        Self(QueueUri::new(M::queue_base()).with_tag(tag))
    }

    pub fn uri(&self) -> &QueueUri {
        &self.0
    }
}

/// The result of a successful [`wait_for_any`]: which waitable matched, the
/// raw (still-encoded) payload, and a reply closure over the popped message.
pub struct WaitForAnyResult {
    channel: Arc<dyn Channel>,
    pub matched: Waitable,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub flags: u32,
    pub reply_timeout_s: u64,
}

impl WaitForAnyResult {
    pub fn tag(&self) -> Option<&str> {
        self.matched.uri().tag.as_deref()
    }

    pub async fn reply(&self, payload: Vec<u8>, is_error: bool) -> Result<(), ChannelError> {
        self.channel
            .reply(self.message_id, payload, is_error, self.reply_timeout_s)
            .await
    }
}

/// Block on any of `items`, in the order given but without bias toward the
/// first (the channel randomizes non-empty-queue selection itself).
pub async fn wait_for_any(
    channel: Arc<dyn Channel>,
    receiver_id: NodeId,
    items: &[Waitable],
    timeout_s: u64,
    reply_timeout_s: u64,
) -> Result<Option<WaitForAnyResult>, ChannelError> {
    let uris: Vec<QueueUri> = items.iter().map(|w| w.uri().clone()).collect();
    let Some(popped) = channel.pop_next(receiver_id, &uris, timeout_s).await? else {
        return Ok(None);
    };

    let matched = items
        .iter()
        .find(|w| *w.uri() == popped.queue)
        .cloned()
        .unwrap_or_else(|| Waitable(popped.queue.clone()));

    Ok(Some(WaitForAnyResult {
        channel,
        matched,
        message_id: popped.message_id,
        payload: popped.payload,
        flags: popped.flags,
        reply_timeout_s,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeBroker;
    use crate::encoding;

    #[tokio::test]
    async fn tagged_wins_over_untagged_in_send_order() {
        let channel: Arc<dyn Channel> = Arc::new(FakeBroker::new());
        let sender = NodeId::new();
        let receiver = NodeId::new();

        let tagged_uri = QueueUri::new("asd").with_tag("t1");
        let plain_uri = QueueUri::new("asd");

        channel
            .enqueue(sender, &plain_uri, encoding::encode(&1i64), 5, 0)
            .await
            .unwrap();
        channel
            .enqueue(sender, &tagged_uri, encoding::encode(&2i64), 5, 0)
            .await
            .unwrap();

        let items = vec![Waitable::tagged("asd", "t1"), Waitable::queue("asd")];

        let first = wait_for_any(channel.clone(), receiver, &items, 1, 5)
            .await
            .unwrap()
            .unwrap();
        let second = wait_for_any(channel.clone(), receiver, &items, 1, 5)
            .await
            .unwrap()
            .unwrap();

        let tags: Vec<Option<String>> = vec![
            first.tag().map(String::from),
            second.tag().map(String::from),
        ];
        assert!(tags.contains(&Some("t1".to_string())));
        assert!(tags.contains(&None));
    }

    #[tokio::test]
    async fn reply_flows_back_to_sender() {
        let channel: Arc<dyn Channel> = Arc::new(FakeBroker::new());
        let sender = NodeId::new();
        let receiver = NodeId::new();
        let uri = QueueUri::new("asd");
        let id = channel
            .enqueue(sender, &uri, encoding::encode(&1i64), 5, 0)
            .await
            .unwrap();

        let got = wait_for_any(channel.clone(), receiver, &[Waitable::queue("asd")], 1, 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message_id, id);
        got.reply(encoding::encode(&2i64), false).await.unwrap();

        let result = channel.wait_for_reply(id, 1).await.unwrap();
        match result {
            crate::channel::ReplyResult::Success { payload, .. } => {
                let value: i64 = encoding::decode(&payload.unwrap()).unwrap();
                assert_eq!(value, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
