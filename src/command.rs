//! Command framework (spec §4.4): inline operations framed by a one-byte
//! header on a node's private queue.
//!
//! `s` (stop), `r` (refresh) and `u` (uptime) are special-cased directly in
//! the node loop (spec §4.3 "Commands") since they touch runtime state the
//! command framework itself has no access to. Everything else — including
//! the built-in `Ping` — goes through [`Command`] and the per-node header
//! table.

use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;

use crate::encoding;
use crate::error::{DecodeError, WormholeError};

/// A command class: one-byte header, request/response framing, and a
/// server-side `handle`.
pub trait Command: Send + Sync + 'static {
    const HEADER: u8;
    type Response: DeserializeOwned;

    fn serialize_request(&self) -> Vec<u8>;

    fn deserialize_response(bytes: &[u8]) -> Result<Self::Response, DecodeError>;

    fn handle(body: &[u8]) -> Result<Vec<u8>, WormholeError>;
}

/// Type-erased server-side half of a [`Command`], indexed by header byte in
/// the node's command table (spec §4.3 `learn_command`/`unlearn_command`).
pub trait CommandHandler: Send + Sync {
    fn header(&self) -> u8;
    fn handle(&self, body: &[u8]) -> Result<Vec<u8>, WormholeError>;
}

pub struct CommandMarker<C: Command>(PhantomData<C>);

impl<C: Command> CommandMarker<C> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<C: Command> Default for CommandMarker<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> CommandHandler for CommandMarker<C> {
    fn header(&self) -> u8 {
        C::HEADER
    }

    fn handle(&self, body: &[u8]) -> Result<Vec<u8>, WormholeError> {
        C::handle(body)
    }
}

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Built-in round-trip-time command (spec §4.4).
pub struct Ping {
    pub sent_at: f64,
}

impl Ping {
    pub fn now() -> Self {
        Self {
            sent_at: now_secs_f64(),
        }
    }
}

impl Command for Ping {
    const HEADER: u8 = b'p';
    type Response = f64;

    fn serialize_request(&self) -> Vec<u8> {
        encoding::encode(&self.sent_at)
    }

    fn deserialize_response(bytes: &[u8]) -> Result<f64, DecodeError> {
        let sent_at: f64 = encoding::decode(bytes)?;
        Ok((now_secs_f64() - sent_at).max(0.0))
    }

    fn handle(body: &[u8]) -> Result<Vec<u8>, WormholeError> {
        Ok(body.to_vec())
    }
}

/// Frame `[header | body]` for the wire (private-queue payload, spec §4.3).
pub fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header);
    out.extend_from_slice(body);
    out
}

/// Split a private-queue payload back into `(header, body)`.
pub fn unframe(payload: &[u8]) -> Option<(u8, &[u8])> {
    payload.split_first().map(|(h, body)| (*h, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_handle_echoes_body() {
        let req = Ping::now();
        let wire = req.serialize_request();
        let echoed = Ping::handle(&wire).unwrap();
        assert_eq!(echoed, wire);
        let elapsed = Ping::deserialize_response(&echoed).unwrap();
        assert!(elapsed < 0.05);
    }

    #[test]
    fn frame_round_trip() {
        let framed = frame(b'p', b"body");
        let (header, body) = unframe(&framed).unwrap();
        assert_eq!(header, b'p');
        assert_eq!(body, b"body");
    }
}
