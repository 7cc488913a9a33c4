//! Stable hashing for typed-message queue bases.
//!
//! Grounded on the teacher's `postcard_rpc::hash` module: an FNV1a, 64-bit
//! digest over a path string. We don't carry the schema-hashing half (this
//! crate has no wire-schema concept, spec §1 "schema evolution" is a
//! Non-goal) — only the path hash, rendered as hex so it's a valid queue
//! `base` token (spec §3: `base` derived "from the stable hash of the
//! fully-qualified type path").

pub struct Fnv1a64Hasher {
    state: u64,
}

impl Fnv1a64Hasher {
    // source: https://en.wikipedia.org/wiki/Fowler%E2%80%93Noll%E2%80%93Vo_hash_function
    const BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self { state: Self::BASIS }
    }

    pub fn update(&mut self, data: &[u8]) {
        for b in data {
            self.state ^= u64::from(*b);
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }

    pub fn digest(self) -> u64 {
        self.state
    }
}

impl Default for Fnv1a64Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a fully-qualified type path (e.g. `std::any::type_name::<T>()`)
/// into a stable, queue-safe hex token.
pub fn hash_ty_path(path: &str) -> String {
    let mut hasher = Fnv1a64Hasher::new();
    hasher.update(path.as_bytes());
    format!("{:016x}", hasher.digest())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        let a = hash_ty_path("wormhole::message::SumMessage");
        let b = hash_ty_path("wormhole::message::SumMessage");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_different_paths() {
        assert_ne!(
            hash_ty_path("crate::Foo"),
            hash_ty_path("crate::Bar")
        );
    }

    #[test]
    fn is_queue_safe() {
        let h = hash_ty_path("anything");
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
