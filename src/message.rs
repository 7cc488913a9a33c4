//! Broker-side message record (spec §3) and the typed-message convention
//! (spec §8 "Typed message", supplemented from `wormhole/message.py`).

use crate::hash::hash_ty_path;

/// `meta` flag bits (spec §3).
pub const DONT_REPLY: u32 = 1;

/// One `wh:<uid>` hash record. All five fields coexist on one key.
#[derive(Clone, Debug, Default)]
pub struct MessageRecord {
    pub input: Vec<u8>,
    pub meta: u32,
    pub output: Option<Vec<u8>>,
    pub err: Option<Vec<u8>>,
    /// Id of the node that claimed the message (`hid`), set on pop.
    pub claimer: Option<crate::id::NodeId>,
}

impl MessageRecord {
    pub fn new(input: Vec<u8>, meta: u32) -> Self {
        Self {
            input,
            meta,
            output: None,
            err: None,
            claimer: None,
        }
    }

    pub fn dont_reply(&self) -> bool {
        self.meta & DONT_REPLY != 0
    }
}

/// A typed message: its queue base is derived from the stable hash of its
/// fully-qualified type path (spec §3 "for typed messages, derived from the
/// stable hash of the fully-qualified type path").
pub trait Message: serde::Serialize + serde::de::DeserializeOwned + 'static {
    /// Override to pin a stable base instead of deriving one from
    /// [`std::any::type_name`] (which is not guaranteed stable across
    /// compiler versions for generic types).
    fn queue_base() -> String {
        hash_ty_path(std::any::type_name::<Self>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct SumMessage {
        #[allow(dead_code)]
        numbers: Vec<i64>,
    }

    impl Message for SumMessage {}

    #[test]
    fn queue_base_is_deterministic_hex() {
        let a = SumMessage::queue_base();
        let b = SumMessage::queue_base();
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
