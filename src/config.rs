//! Per-node configuration (spec §6 "Configuration").

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncMode {
    /// Handlers run inline on the main loop.
    Inline,
    /// Handlers run on a bounded worker pool (spec §4.5).
    Pool { max_parallel: usize },
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub broker_uri: String,
    pub max_connections: u32,
    pub send_timeout_s: u64,
    pub reply_expiration_s: u64,
    pub async_mode: AsyncMode,
    pub stats_enabled: bool,
}

impl NodeConfig {
    pub fn new(broker_uri: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            max_connections: 20,
            send_timeout_s: 60,
            reply_expiration_s: 60,
            async_mode: AsyncMode::Inline,
            stats_enabled: true,
        }
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_send_timeout_s(mut self, s: u64) -> Self {
        self.send_timeout_s = s;
        self
    }

    pub fn with_reply_expiration_s(mut self, s: u64) -> Self {
        self.reply_expiration_s = s;
        self
    }

    pub fn with_pool(mut self, max_parallel: usize) -> Self {
        self.async_mode = if max_parallel == 0 {
            AsyncMode::Inline
        } else {
            AsyncMode::Pool { max_parallel }
        };
        self
    }

    pub fn with_stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1/")
    }
}
