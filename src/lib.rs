//! `wormhole` — an RPC and message-distribution framework riding on a
//! Redis-style shared broker (spec §1). Nodes rendezvous through named
//! queues: a caller pushes a request, any node with a matching handler
//! claims it, executes, and posts a reply the caller can await.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` in the crate root for the full design
//! and the grounding ledger against the teacher this crate was built from.

pub mod channel;
pub mod command;
pub mod config;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod id;
pub mod lock;
pub mod message;
pub mod node;
pub mod queue;
pub mod registry;
pub mod session;
pub mod waitable;

pub use channel::{Channel, PopResult, RateStats, ReplyResult};
pub use command::{Command, CommandHandler, CommandMarker, Ping};
pub use config::{AsyncMode, NodeConfig};
pub use error::WormholeError;
pub use id::{MessageId, NodeId};
pub use lock::NamedLock;
pub use message::{Message, MessageRecord, DONT_REPLY};
pub use node::{Node, NodeState};
pub use queue::QueueUri;
pub use registry::{primary_node, set_primary_node, HandlerRegistry};
pub use session::Session;
pub use waitable::{wait_for_any, Waitable, WaitForAnyResult};
