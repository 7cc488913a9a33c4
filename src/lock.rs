//! Distributed mutex built over the channel's named-lock primitives
//! (spec §4.2 "Locks", §5 "Locks").
//!
//! The lock is advisory and fair only by race: the signal list wakes one
//! waiter per release, so other blocked waiters keep sleeping until their
//! own `block_timeout_s` elapses (spec §9 open question (a)).

use std::sync::Arc;

use crate::channel::Channel;
use crate::error::ChannelError;

/// A held named lock. Dropping it without calling [`NamedLock::release`]
/// leaves the lock held until its own `lock_timeout_s` expires, if any —
/// there is no synchronous drop-release, since release is a broker round
/// trip (spec §5 "an expired lock silently releases").
pub struct NamedLock {
    channel: Arc<dyn Channel>,
    name: String,
    secret: String,
}

impl NamedLock {
    /// Acquire `name`. `block = false` returns immediately with `None` if
    /// contended; `block = true` waits up to `block_timeout_s`.
    pub async fn acquire(
        channel: Arc<dyn Channel>,
        name: impl Into<String>,
        block: bool,
        block_timeout_s: u64,
        lock_timeout_s: Option<u64>,
    ) -> Result<Option<Self>, ChannelError> {
        let name = name.into();
        let secret = channel
            .lock(&name, block, block_timeout_s, lock_timeout_s)
            .await?;
        Ok(secret.map(|secret| Self {
            channel,
            name,
            secret,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(self, force: bool) -> Result<bool, ChannelError> {
        self.channel.release(&self.name, &self.secret, force).await
    }

    pub async fn is_locked(&self) -> Result<bool, ChannelError> {
        self.channel.is_locked(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeBroker;

    #[tokio::test]
    async fn exclusive_then_release_unblocks() {
        let channel: Arc<dyn Channel> = Arc::new(FakeBroker::new());
        let a = NamedLock::acquire(channel.clone(), "L", false, 1, None)
            .await
            .unwrap();
        assert!(a.is_some());
        let b = NamedLock::acquire(channel.clone(), "L", false, 1, None)
            .await
            .unwrap();
        assert!(b.is_none());

        let a = a.unwrap();
        assert!(a.release(false).await.unwrap());

        let c = NamedLock::acquire(channel, "L", false, 1, None).await.unwrap();
        assert!(c.is_some());
    }

    #[tokio::test]
    async fn force_release_bypasses_ownership() {
        let channel: Arc<dyn Channel> = Arc::new(FakeBroker::new());
        let held = NamedLock::acquire(channel.clone(), "L", false, 1, None)
            .await
            .unwrap()
            .unwrap();
        // simulate a foreign releaser with the wrong secret but force=true
        assert!(channel.release("L", "not-the-secret", true).await.unwrap());
        assert!(!held.is_locked().await.unwrap());
    }
}
