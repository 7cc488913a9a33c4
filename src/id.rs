//! Node and message identity.
//!
//! Spec §3: "Each node has a fresh unique id on start (128-bit random,
//! rendered as hex)." Message ids are generated the same way so that a
//! caller-side retry (a fresh `send`) always produces a *new* id.

use rand::RngCore;
use std::fmt;

/// A 128-bit random id rendered as lowercase hex, used for both node and
/// message identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_hex(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// The sentinel "no claimer yet" id (`hid` unset).
    pub const fn empty() -> Self {
        Self([0u8; 16])
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            let hi = i * 2;
            *b = u8::from_str_radix(&s[hi..hi + 2], 16)?;
        }
        Ok(Self(bytes))
    }
}

/// Message ids share the node-id format (`wh:<uid>` hash keys, spec §3).
pub type MessageId = NodeId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_across_many() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(NodeId::new()));
        }
    }

    #[test]
    fn round_trips_through_hex() {
        let id = NodeId::new();
        let parsed: NodeId = id.as_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn empty_is_distinguishable() {
        assert!(NodeId::empty().is_empty());
        assert!(!NodeId::new().is_empty());
    }
}
