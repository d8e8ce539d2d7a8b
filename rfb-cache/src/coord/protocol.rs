//! Framed coordinator messages.
//!
//! Master and slaves exchange length-prefixed typed messages over the local
//! stream socket. Every frame is:
//!
//! - 1 byte: message type
//! - 4 bytes: payload length (u32)
//! - N bytes: payload
//!
//! All multi-byte fields are **big-endian** (network byte order); this is
//! part of protocol version 1.
//!
//! Parsing is incremental: an incomplete buffer yields "need more bytes"
//! with nothing consumed, while a malformed frame is a hard error and the
//! peer that sent it gets disconnected.

use crate::index::{WireIndexEntry, WIRE_INDEX_ENTRY_BYTES};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Coordinator protocol version, sent in HELLO and WELCOME.
pub const COORD_PROTOCOL_VERSION: u32 = 1;

/// Frame header size: type byte plus payload length.
pub const FRAME_HEADER_BYTES: usize = 5;

/// Upper bound on a single payload; anything larger is malformed.
pub const MAX_PAYLOAD_BYTES: u32 = 16 * 1024 * 1024;

// Message type codes. Stable across releases.
const TYPE_HELLO: u8 = 1;
const TYPE_WELCOME: u8 = 2;
const TYPE_WRITE_REQ: u8 = 3;
const TYPE_WRITE_ACK: u8 = 4;
const TYPE_WRITE_NACK: u8 = 5;
const TYPE_INDEX_UPDATE: u8 = 6;
const TYPE_QUERY_INDEX: u8 = 7;
const TYPE_QUERY_RESP: u8 = 8;
const TYPE_PING: u8 = 9;
const TYPE_PONG: u8 = 10;
const TYPE_SLAVE_EXIT: u8 = 11;
const TYPE_MASTER_EXIT: u8 = 12;

/// Hard framing errors. Any of these disconnects the offending peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown coordinator message type {0}")]
    UnknownType(u8),
    #[error("payload length {0} exceeds {MAX_PAYLOAD_BYTES} byte limit")]
    Oversized(u32),
    #[error("malformed {0} payload")]
    BadPayload(&'static str),
}

/// A coordinator protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordMessage {
    /// Slave introduces itself after connecting.
    Hello { version: u32, pid: u32 },
    /// Master hands the slave a snapshot of the persistent index.
    Welcome {
        version: u32,
        master_pid: u32,
        current_shard: u32,
        entries: Vec<WireIndexEntry>,
    },
    /// Slave asks the master to persist one cache entry. The entry's shard
    /// and offset are zero; the master fills them in.
    WriteRequest {
        entry: WireIndexEntry,
        payload: Vec<u8>,
    },
    /// Success response carrying the completed entry.
    WriteAck {
        entry: WireIndexEntry,
        correlation: u32,
    },
    /// Failure response.
    WriteNack,
    /// Broadcast of newly persisted entries.
    IndexUpdate {
        sequence: u32,
        entries: Vec<WireIndexEntry>,
    },
    /// Probe the master's index by content hash and geometry.
    QueryIndex {
        hash: [u8; 16],
        width: u16,
        height: u16,
    },
    /// Response to a QueryIndex probe.
    QueryResponse { entry: Option<WireIndexEntry> },
    Ping,
    Pong,
    SlaveExit,
    MasterExit,
}

impl CoordMessage {
    /// The wire type code for this message.
    pub fn message_type(&self) -> u8 {
        match self {
            CoordMessage::Hello { .. } => TYPE_HELLO,
            CoordMessage::Welcome { .. } => TYPE_WELCOME,
            CoordMessage::WriteRequest { .. } => TYPE_WRITE_REQ,
            CoordMessage::WriteAck { .. } => TYPE_WRITE_ACK,
            CoordMessage::WriteNack => TYPE_WRITE_NACK,
            CoordMessage::IndexUpdate { .. } => TYPE_INDEX_UPDATE,
            CoordMessage::QueryIndex { .. } => TYPE_QUERY_INDEX,
            CoordMessage::QueryResponse { .. } => TYPE_QUERY_RESP,
            CoordMessage::Ping => TYPE_PING,
            CoordMessage::Pong => TYPE_PONG,
            CoordMessage::SlaveExit => TYPE_SLAVE_EXIT,
            CoordMessage::MasterExit => TYPE_MASTER_EXIT,
        }
    }

    /// Encode the full frame (header plus payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        match self {
            CoordMessage::Hello { version, pid } => {
                payload.put_u32(*version);
                payload.put_u32(*pid);
                payload.put_u32(0); // reserved
            }
            CoordMessage::Welcome {
                version,
                master_pid,
                current_shard,
                entries,
            } => {
                payload.put_u32(*version);
                payload.put_u32(*master_pid);
                payload.put_u32(entries.len() as u32);
                payload.put_u32(*current_shard);
                for entry in entries {
                    entry.encode_to(&mut payload);
                }
            }
            CoordMessage::WriteRequest { entry, payload: data } => {
                entry.encode_to(&mut payload);
                payload.put_u32(data.len() as u32);
                payload.extend_from_slice(data);
            }
            CoordMessage::WriteAck { entry, correlation } => {
                entry.encode_to(&mut payload);
                payload.put_u32(*correlation);
            }
            CoordMessage::IndexUpdate { sequence, entries } => {
                payload.put_u32(entries.len() as u32);
                payload.put_u32(*sequence);
                for entry in entries {
                    entry.encode_to(&mut payload);
                }
            }
            CoordMessage::QueryIndex {
                hash,
                width,
                height,
            } => {
                payload.extend_from_slice(hash);
                payload.put_u16(*width);
                payload.put_u16(*height);
            }
            CoordMessage::QueryResponse { entry } => {
                match entry {
                    Some(entry) => {
                        payload.put_u8(1);
                        entry.encode_to(&mut payload);
                    }
                    None => payload.put_u8(0),
                }
            }
            CoordMessage::WriteNack
            | CoordMessage::Ping
            | CoordMessage::Pong
            | CoordMessage::SlaveExit
            | CoordMessage::MasterExit => {}
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
        frame.push(self.message_type());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Try to parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed (nothing consumed), or
    /// `Ok(Some((message, consumed)))` on success. A hard [`FrameError`]
    /// means the stream is unrecoverable and the peer must be dropped.
    pub fn parse(buf: &[u8]) -> Result<Option<(CoordMessage, usize)>, FrameError> {
        if buf.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let msg_type = buf[0];
        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(FrameError::Oversized(payload_len));
        }
        let total = FRAME_HEADER_BYTES + payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let mut payload = &buf[FRAME_HEADER_BYTES..total];

        let message = match msg_type {
            TYPE_HELLO => {
                if payload.len() != 12 {
                    return Err(FrameError::BadPayload("HELLO"));
                }
                let version = payload.get_u32();
                let pid = payload.get_u32();
                CoordMessage::Hello { version, pid }
            }
            TYPE_WELCOME => {
                if payload.len() < 16 {
                    return Err(FrameError::BadPayload("WELCOME"));
                }
                let version = payload.get_u32();
                let master_pid = payload.get_u32();
                let count = payload.get_u32() as usize;
                let current_shard = payload.get_u32();
                let entries = decode_entries(&mut payload, count, "WELCOME")?;
                CoordMessage::Welcome {
                    version,
                    master_pid,
                    current_shard,
                    entries,
                }
            }
            TYPE_WRITE_REQ => {
                let Some(entry) = WireIndexEntry::decode_from(&mut payload) else {
                    return Err(FrameError::BadPayload("WRITE_REQ"));
                };
                if payload.len() < 4 {
                    return Err(FrameError::BadPayload("WRITE_REQ"));
                }
                let data_len = payload.get_u32() as usize;
                if payload.len() != data_len {
                    return Err(FrameError::BadPayload("WRITE_REQ"));
                }
                CoordMessage::WriteRequest {
                    entry,
                    payload: payload.to_vec(),
                }
            }
            TYPE_WRITE_ACK => {
                let Some(entry) = WireIndexEntry::decode_from(&mut payload) else {
                    return Err(FrameError::BadPayload("WRITE_ACK"));
                };
                if payload.len() != 4 {
                    return Err(FrameError::BadPayload("WRITE_ACK"));
                }
                let correlation = payload.get_u32();
                CoordMessage::WriteAck { entry, correlation }
            }
            TYPE_WRITE_NACK => {
                if !payload.is_empty() {
                    return Err(FrameError::BadPayload("WRITE_NACK"));
                }
                CoordMessage::WriteNack
            }
            TYPE_INDEX_UPDATE => {
                if payload.len() < 8 {
                    return Err(FrameError::BadPayload("INDEX_UPDATE"));
                }
                let count = payload.get_u32() as usize;
                let sequence = payload.get_u32();
                let entries = decode_entries(&mut payload, count, "INDEX_UPDATE")?;
                CoordMessage::IndexUpdate { sequence, entries }
            }
            TYPE_QUERY_INDEX => {
                if payload.len() != 20 {
                    return Err(FrameError::BadPayload("QUERY_INDEX"));
                }
                let mut hash = [0u8; 16];
                payload.copy_to_slice(&mut hash);
                let width = payload.get_u16();
                let height = payload.get_u16();
                CoordMessage::QueryIndex {
                    hash,
                    width,
                    height,
                }
            }
            TYPE_QUERY_RESP => {
                if payload.is_empty() {
                    return Err(FrameError::BadPayload("QUERY_RESP"));
                }
                let found = payload.get_u8();
                let entry = match found {
                    0 if payload.is_empty() => None,
                    1 => {
                        let entry = WireIndexEntry::decode_from(&mut payload)
                            .ok_or(FrameError::BadPayload("QUERY_RESP"))?;
                        if !payload.is_empty() {
                            return Err(FrameError::BadPayload("QUERY_RESP"));
                        }
                        Some(entry)
                    }
                    _ => return Err(FrameError::BadPayload("QUERY_RESP")),
                };
                CoordMessage::QueryResponse { entry }
            }
            TYPE_PING => empty_payload(payload, CoordMessage::Ping, "PING")?,
            TYPE_PONG => empty_payload(payload, CoordMessage::Pong, "PONG")?,
            TYPE_SLAVE_EXIT => empty_payload(payload, CoordMessage::SlaveExit, "SLAVE_EXIT")?,
            TYPE_MASTER_EXIT => {
                empty_payload(payload, CoordMessage::MasterExit, "MASTER_EXIT")?
            }
            other => return Err(FrameError::UnknownType(other)),
        };

        Ok(Some((message, total)))
    }
}

fn empty_payload(
    payload: &[u8],
    message: CoordMessage,
    name: &'static str,
) -> Result<CoordMessage, FrameError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(FrameError::BadPayload(name))
    }
}

fn decode_entries(
    payload: &mut &[u8],
    count: usize,
    name: &'static str,
) -> Result<Vec<WireIndexEntry>, FrameError> {
    if payload.len() != count * WIRE_INDEX_ENTRY_BYTES {
        return Err(FrameError::BadPayload(name));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(
            WireIndexEntry::decode_from(payload).ok_or(FrameError::BadPayload(name))?,
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(cache_id: u64) -> WireIndexEntry {
        WireIndexEntry {
            cache_id,
            shard: 1,
            offset: 1 << 20,
            length: 4096,
            width: 128,
            height: 128,
            encoding: 16,
        }
    }

    fn all_messages() -> Vec<CoordMessage> {
        vec![
            CoordMessage::Hello {
                version: COORD_PROTOCOL_VERSION,
                pid: 4242,
            },
            CoordMessage::Welcome {
                version: COORD_PROTOCOL_VERSION,
                master_pid: 100,
                current_shard: 3,
                entries: vec![entry(1), entry(2)],
            },
            CoordMessage::WriteRequest {
                entry: entry(7),
                payload: vec![0xAB; 100],
            },
            CoordMessage::WriteAck {
                entry: entry(7),
                correlation: 55,
            },
            CoordMessage::WriteNack,
            CoordMessage::IndexUpdate {
                sequence: 9,
                entries: vec![entry(7)],
            },
            CoordMessage::QueryIndex {
                hash: [0x11; 16],
                width: 256,
                height: 64,
            },
            CoordMessage::QueryResponse {
                entry: Some(entry(7)),
            },
            CoordMessage::QueryResponse { entry: None },
            CoordMessage::Ping,
            CoordMessage::Pong,
            CoordMessage::SlaveExit,
            CoordMessage::MasterExit,
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for message in all_messages() {
            let frame = message.encode();
            let (parsed, consumed) = CoordMessage::parse(&frame).unwrap().unwrap();
            assert_eq!(parsed, message);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn test_incomplete_buffer_needs_more() {
        let frame = CoordMessage::Welcome {
            version: COORD_PROTOCOL_VERSION,
            master_pid: 1,
            current_shard: 0,
            entries: vec![entry(1)],
        }
        .encode();

        for cut in 0..frame.len() {
            assert_eq!(
                CoordMessage::parse(&frame[..cut]).unwrap(),
                None,
                "prefix of {} bytes should need more",
                cut
            );
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut stream = CoordMessage::Ping.encode();
        let second = CoordMessage::WriteNack.encode();
        stream.extend_from_slice(&second);

        let (first, consumed) = CoordMessage::parse(&stream).unwrap().unwrap();
        assert_eq!(first, CoordMessage::Ping);
        let (rest, consumed2) = CoordMessage::parse(&stream[consumed..]).unwrap().unwrap();
        assert_eq!(rest, CoordMessage::WriteNack);
        assert_eq!(consumed + consumed2, stream.len());
    }

    #[test]
    fn test_unknown_type_is_hard_error() {
        let frame = [0xEEu8, 0, 0, 0, 0];
        assert_eq!(
            CoordMessage::parse(&frame),
            Err(FrameError::UnknownType(0xEE))
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut frame = vec![TYPE_PING];
        frame.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
        assert!(matches!(
            CoordMessage::parse(&frame),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn test_truncated_entry_table_rejected() {
        // WELCOME claiming two entries but carrying bytes for one.
        let mut payload = BytesMut::new();
        payload.put_u32(COORD_PROTOCOL_VERSION);
        payload.put_u32(1);
        payload.put_u32(2); // entry count
        payload.put_u32(0); // shard
        entry(1).encode_to(&mut payload);

        let mut frame = vec![TYPE_WELCOME];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        assert_eq!(
            CoordMessage::parse(&frame),
            Err(FrameError::BadPayload("WELCOME"))
        );
    }

    #[test]
    fn test_write_req_payload_length_must_match() {
        let mut payload = BytesMut::new();
        entry(1).encode_to(&mut payload);
        payload.put_u32(10); // claims 10 bytes
        payload.extend_from_slice(&[0u8; 5]); // carries 5

        let mut frame = vec![TYPE_WRITE_REQ];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        assert_eq!(
            CoordMessage::parse(&frame),
            Err(FrameError::BadPayload("WRITE_REQ"))
        );
    }

    #[test]
    fn test_nonempty_keepalive_rejected() {
        let mut frame = vec![TYPE_PONG];
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.push(0);
        assert_eq!(
            CoordMessage::parse(&frame),
            Err(FrameError::BadPayload("PONG"))
        );
    }

    proptest! {
        /// Any encoded message parses back identically from any larger
        /// buffer, consuming exactly its own frame.
        #[test]
        fn test_parse_ignores_trailing_bytes(
            idx in 0usize..13,
            trailer in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let message = all_messages()[idx].clone();
            let mut frame = message.encode();
            let frame_len = frame.len();
            frame.extend_from_slice(&trailer);

            let (parsed, consumed) = CoordMessage::parse(&frame).unwrap().unwrap();
            prop_assert_eq!(parsed, message);
            prop_assert_eq!(consumed, frame_len);
        }

        /// Write payloads of arbitrary content round-trip.
        #[test]
        fn test_write_request_round_trip(
            payload in prop::collection::vec(any::<u8>(), 0..2048),
            cache_id in any::<u64>(),
        ) {
            let message = CoordMessage::WriteRequest {
                entry: entry(cache_id),
                payload,
            };
            let frame = message.encode();
            let (parsed, _) = CoordMessage::parse(&frame).unwrap().unwrap();
            prop_assert_eq!(parsed, message);
        }
    }
}
