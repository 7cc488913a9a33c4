//! Wire encoding: values <-> opaque byte payloads, with transparent gzip.
//!
//! Wire shape (spec §4.1):
//!   - leading byte `%` — the remaining bytes literally (bytes passthrough).
//!   - leading byte `$` — gzip of an otherwise-valid encoded payload (one
//!     level, never nested).
//!   - otherwise — opaque `serde_json` output.
//!
//! Gzip is applied iff the pre-compression serialized form exceeds
//! [`COMPRESSION_THRESHOLD`] bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DecodeError;

const PASSTHROUGH_MARKER: u8 = b'%';
const GZIP_MARKER: u8 = b'$';

/// encode(x) gzips iff the pre-compression form is strictly larger than this.
pub const COMPRESSION_THRESHOLD: usize = 2048;

fn maybe_compress(body: Vec<u8>) -> Vec<u8> {
    if body.len() <= COMPRESSION_THRESHOLD {
        return body;
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // encoder failures are only possible on an I/O-backed writer; a Vec<u8> never errors.
    encoder.write_all(&body).expect("gzip to a Vec<u8> cannot fail");
    let gzipped = encoder.finish().expect("gzip to a Vec<u8> cannot fail");
    let mut out = Vec::with_capacity(gzipped.len() + 1);
    out.push(GZIP_MARKER);
    out.extend_from_slice(&gzipped);
    out
}

/// Encode any serde-serializable value into an opaque payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let body = serde_json::to_vec(value).expect("serde_json serialization is infallible for owned values");
    maybe_compress(body)
}

/// Encode a raw byte string — never re-serialized, always passthrough
/// (spec §4.1, §8.2: "the encoded form begins with `%`").
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 1);
    body.push(PASSTHROUGH_MARKER);
    body.extend_from_slice(bytes);
    maybe_compress(body)
}

/// Decode a payload previously produced by [`encode`] or [`encode_bytes`].
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    let unwrapped = unwrap_gzip(payload)?;
    match unwrapped.first() {
        Some(&PASSTHROUGH_MARKER) => Err(DecodeError::new(payload)),
        _ => serde_json::from_slice(&unwrapped).map_err(|_| DecodeError::new(payload)),
    }
}

/// Decode a payload known to carry raw bytes.
pub fn decode_bytes(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let unwrapped = unwrap_gzip(payload)?;
    match unwrapped.first() {
        Some(&PASSTHROUGH_MARKER) => Ok(unwrapped[1..].to_vec()),
        _ => Err(DecodeError::new(payload)),
    }
}

fn unwrap_gzip(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match payload.first() {
        Some(&GZIP_MARKER) => {
            let mut decoder = GzDecoder::new(&payload[1..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| DecodeError::new(payload))?;
            Ok(out)
        }
        Some(_) => Ok(payload.to_vec()),
        None => Err(DecodeError::new(payload)),
    }
}

/// Whether a previously-encoded payload is gzip-wrapped.
pub fn is_gzipped(payload: &[u8]) -> bool {
    payload.first() == Some(&GZIP_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn round_trips_values() {
        let p = Point { x: 1, y: -2 };
        let wire = encode(&p);
        let back: Point = decode(&wire).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn round_trips_bytes_with_passthrough_marker() {
        let bytes = b"raw data".to_vec();
        let wire = encode_bytes(&bytes);
        assert_eq!(wire[0], PASSTHROUGH_MARKER);
        assert_eq!(decode_bytes(&wire).unwrap(), bytes);
    }

    #[test]
    fn compresses_past_threshold() {
        let small = vec![1u8, 2, 3];
        let wire = encode(&small);
        assert!(!is_gzipped(&wire));

        let big = "x".repeat(COMPRESSION_THRESHOLD + 1);
        let wire = encode(&big);
        assert!(is_gzipped(&wire));
        let back: String = decode(&wire).unwrap();
        assert_eq!(back, big);
    }

    #[test]
    fn large_string_round_trip() {
        let original: String = "abcdefgh".repeat(100_000);
        let reversed: String = original.chars().rev().collect();
        let wire = encode(&reversed);
        assert!(is_gzipped(&wire));
        let back: String = decode(&wire).unwrap();
        assert_eq!(back, reversed);
    }

    #[test]
    fn decode_failure_carries_repr() {
        let err = decode::<Point>(&[0xffu8, 0x00]).unwrap_err();
        assert!(err.repr.contains("255"));
    }
}
