//! Wire encoding of node messages.
//!
//! A node message is a fixed binary header followed by a CBOR content body:
//! TTL as big-endian u16, the sender entity id (16-byte endpoint id plus
//! big-endian u64 object), a one-byte content tag, then the encoded data or
//! command message.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::data::{Data, Real};
use crate::id::{EndpointId, EntityId};
use crate::message::{
    Command, CommandMessage, DataMessage, NodeContent, NodeMessage, SnapshotEntry,
};
use crate::topic::Topic;

const HEADER_LEN: usize = 2 + 16 + 8 + 1;

const TAG_DATA: u8 = 0;
const TAG_COMMAND: u8 = 1;

/// Nesting bound for decoded values.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("input truncated: {0}")]
    Truncated(&'static str),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown value tag: {0}")]
    UnknownValueTag(u8),
    #[error("unknown content tag: {0}")]
    UnknownContentTag(u8),
    #[error("unknown command op: {0}")]
    UnknownOp(String),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("value nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_node_message(msg: &NodeMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&msg.ttl.to_be_bytes());
    buf.extend_from_slice(msg.sender.endpoint.as_bytes());
    buf.extend_from_slice(&msg.sender.object.to_be_bytes());
    match &msg.content {
        NodeContent::Data(dm) => {
            buf.push(TAG_DATA);
            let mut enc = Encoder::new(&mut buf);
            encode_data_message(&mut enc, dm)?;
        }
        NodeContent::Command(cm) => {
            buf.push(TAG_COMMAND);
            let mut enc = Encoder::new(&mut buf);
            encode_command_message(&mut enc, cm)?;
        }
    }
    Ok(buf)
}

pub fn decode_node_message(bytes: &[u8]) -> Result<NodeMessage, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated("node message header"));
    }
    let ttl = u16::from_be_bytes([bytes[0], bytes[1]]);
    let mut endpoint = [0u8; 16];
    endpoint.copy_from_slice(&bytes[2..18]);
    let mut object = [0u8; 8];
    object.copy_from_slice(&bytes[18..26]);
    let sender = EntityId::new(
        EndpointId::from_bytes(endpoint),
        u64::from_be_bytes(object),
    );
    let tag = bytes[26];
    let body = &bytes[HEADER_LEN..];
    let mut dec = Decoder::new(body);
    let content = match tag {
        TAG_DATA => NodeContent::Data(decode_data_message(&mut dec)?),
        TAG_COMMAND => NodeContent::Command(decode_command_message(&mut dec)?),
        other => return Err(DecodeError::UnknownContentTag(other)),
    };
    if dec.position() != body.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(NodeMessage::new(content, ttl, sender))
}

pub fn encode_data_message(enc: &mut Enc<'_>, msg: &DataMessage) -> Result<(), EncodeError> {
    enc.array(2)?;
    enc.str(msg.topic.as_str())?;
    encode_data(enc, &msg.data)
}

pub fn decode_data_message(dec: &mut Decoder<'_>) -> Result<DataMessage, DecodeError> {
    expect_array(dec, 2, "data message")?;
    let topic = Topic::new(dec.str()?);
    let data = decode_data(dec, 0)?;
    Ok(DataMessage { topic, data })
}

pub fn encode_command_message(enc: &mut Enc<'_>, msg: &CommandMessage) -> Result<(), EncodeError> {
    enc.array(2)?;
    enc.str(msg.topic.as_str())?;
    encode_command(enc, &msg.command)
}

pub fn decode_command_message(dec: &mut Decoder<'_>) -> Result<CommandMessage, DecodeError> {
    expect_array(dec, 2, "command message")?;
    let topic = Topic::new(dec.str()?);
    let command = decode_command(dec)?;
    Ok(CommandMessage { topic, command })
}

// -- dynamic data -----------------------------------------------------------

// Every value is a two-element array: variant tag, payload. Containers
// recurse; sets and records reuse the array payload with their own tag.
const DATA_NIL: u8 = 0;
const DATA_BOOL: u8 = 1;
const DATA_INTEGER: u8 = 2;
const DATA_REAL: u8 = 3;
const DATA_STR: u8 = 4;
const DATA_BYTES: u8 = 5;
const DATA_LIST: u8 = 6;
const DATA_TABLE: u8 = 7;
const DATA_SET: u8 = 8;
const DATA_RECORD: u8 = 9;

pub fn encode_data(enc: &mut Enc<'_>, value: &Data) -> Result<(), EncodeError> {
    enc.array(2)?;
    match value {
        Data::Nil => {
            enc.u8(DATA_NIL)?;
            enc.null()?;
        }
        Data::Bool(x) => {
            enc.u8(DATA_BOOL)?;
            enc.bool(*x)?;
        }
        Data::Integer(x) => {
            enc.u8(DATA_INTEGER)?;
            enc.i64(*x)?;
        }
        Data::Real(x) => {
            enc.u8(DATA_REAL)?;
            enc.f64(x.0)?;
        }
        Data::Str(x) => {
            enc.u8(DATA_STR)?;
            enc.str(x)?;
        }
        Data::Bytes(x) => {
            enc.u8(DATA_BYTES)?;
            enc.bytes(x)?;
        }
        Data::List(xs) => {
            enc.u8(DATA_LIST)?;
            enc.array(xs.len() as u64)?;
            for x in xs {
                encode_data(enc, x)?;
            }
        }
        Data::Table(xs) => {
            enc.u8(DATA_TABLE)?;
            enc.map(xs.len() as u64)?;
            for (k, v) in xs {
                encode_data(enc, k)?;
                encode_data(enc, v)?;
            }
        }
        Data::Set(xs) => {
            enc.u8(DATA_SET)?;
            enc.array(xs.len() as u64)?;
            for x in xs {
                encode_data(enc, x)?;
            }
        }
        Data::Record(xs) => {
            enc.u8(DATA_RECORD)?;
            enc.array(xs.len() as u64)?;
            for x in xs {
                encode_data(enc, x)?;
            }
        }
    }
    Ok(())
}

pub fn decode_data(dec: &mut Decoder<'_>, depth: usize) -> Result<Data, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    expect_array(dec, 2, "data value")?;
    let tag = dec.u8()?;
    let value = match tag {
        DATA_NIL => {
            dec.null()?;
            Data::Nil
        }
        DATA_BOOL => Data::Bool(dec.bool()?),
        DATA_INTEGER => Data::Integer(dec.i64()?),
        DATA_REAL => Data::Real(Real(dec.f64()?)),
        DATA_STR => Data::Str(dec.str()?.to_string()),
        DATA_BYTES => Data::Bytes(Bytes::copy_from_slice(dec.bytes()?)),
        DATA_LIST => {
            let len = definite_array(dec)?;
            let mut xs = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                xs.push(decode_data(dec, depth + 1)?);
            }
            Data::List(xs)
        }
        DATA_TABLE => {
            let len = definite_map(dec)?;
            let mut xs = std::collections::BTreeMap::new();
            for _ in 0..len {
                let k = decode_data(dec, depth + 1)?;
                let v = decode_data(dec, depth + 1)?;
                xs.insert(k, v);
            }
            Data::Table(xs)
        }
        DATA_SET => {
            let len = definite_array(dec)?;
            let mut xs = std::collections::BTreeSet::new();
            for _ in 0..len {
                xs.insert(decode_data(dec, depth + 1)?);
            }
            Data::Set(xs)
        }
        DATA_RECORD => {
            let len = definite_array(dec)?;
            let mut xs = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                xs.push(decode_data(dec, depth + 1)?);
            }
            Data::Record(xs)
        }
        other => return Err(DecodeError::UnknownValueTag(other)),
    };
    Ok(value)
}

// -- commands ----------------------------------------------------------------

fn encode_command(enc: &mut Enc<'_>, command: &Command) -> Result<(), EncodeError> {
    match command {
        Command::Put {
            key,
            value,
            expiry,
            publisher,
        } => {
            enc.map(5)?;
            enc.str("op")?;
            enc.str("put")?;
            enc.str("key")?;
            encode_data(enc, key)?;
            enc.str("value")?;
            encode_data(enc, value)?;
            enc.str("expiry")?;
            encode_expiry(enc, expiry)?;
            enc.str("publisher")?;
            encode_entity(enc, publisher)?;
        }
        Command::Erase { key, publisher } => {
            enc.map(3)?;
            enc.str("op")?;
            enc.str("erase")?;
            enc.str("key")?;
            encode_data(enc, key)?;
            enc.str("publisher")?;
            encode_entity(enc, publisher)?;
        }
        Command::Clear { publisher } => {
            enc.map(2)?;
            enc.str("op")?;
            enc.str("clear")?;
            enc.str("publisher")?;
            encode_entity(enc, publisher)?;
        }
        Command::Add {
            key,
            delta,
            expiry,
            publisher,
        } => {
            encode_arithmetic(enc, "add", key, delta, expiry, publisher)?;
        }
        Command::Subtract {
            key,
            delta,
            expiry,
            publisher,
        } => {
            encode_arithmetic(enc, "subtract", key, delta, expiry, publisher)?;
        }
        Command::SnapshotRequest { requester } => {
            enc.map(2)?;
            enc.str("op")?;
            enc.str("snapshot_request")?;
            enc.str("publisher")?;
            encode_entity(enc, requester)?;
        }
        Command::Snapshot { entries } => {
            enc.map(2)?;
            enc.str("op")?;
            enc.str("snapshot")?;
            enc.str("entries")?;
            enc.array(entries.len() as u64)?;
            for entry in entries {
                enc.array(3)?;
                encode_data(enc, &entry.key)?;
                encode_data(enc, &entry.value)?;
                encode_expiry(enc, &entry.expiry)?;
            }
        }
        Command::Keepalive => {
            enc.map(1)?;
            enc.str("op")?;
            enc.str("keepalive")?;
        }
    }
    Ok(())
}

fn encode_arithmetic(
    enc: &mut Enc<'_>,
    op: &str,
    key: &Data,
    delta: &Data,
    expiry: &Option<Duration>,
    publisher: &EntityId,
) -> Result<(), EncodeError> {
    enc.map(5)?;
    enc.str("op")?;
    enc.str(op)?;
    enc.str("key")?;
    encode_data(enc, key)?;
    enc.str("delta")?;
    encode_data(enc, delta)?;
    enc.str("expiry")?;
    encode_expiry(enc, expiry)?;
    enc.str("publisher")?;
    encode_entity(enc, publisher)?;
    Ok(())
}

fn decode_command(dec: &mut Decoder<'_>) -> Result<Command, DecodeError> {
    let len = definite_map(dec)?;
    let mut op = None;
    let mut key = None;
    let mut value = None;
    let mut delta = None;
    let mut expiry = None;
    let mut publisher = None;
    let mut entries = None;

    for _ in 0..len {
        match dec.str()? {
            "op" => op = Some(dec.str()?.to_string()),
            "key" => key = Some(decode_data(dec, 0)?),
            "value" => value = Some(decode_data(dec, 0)?),
            "delta" => delta = Some(decode_data(dec, 0)?),
            "expiry" => expiry = Some(decode_expiry(dec)?),
            "publisher" => publisher = Some(decode_entity(dec)?),
            "entries" => {
                let n = definite_array(dec)?;
                let mut xs = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    expect_array(dec, 3, "snapshot entry")?;
                    xs.push(SnapshotEntry {
                        key: decode_data(dec, 0)?,
                        value: decode_data(dec, 0)?,
                        expiry: decode_expiry(dec)?,
                    });
                }
                entries = Some(xs);
            }
            _ => dec.skip()?,
        }
    }

    let op = op.ok_or(DecodeError::MissingField("op"))?;
    let expiry = expiry.unwrap_or(None);
    let command = match op.as_str() {
        "put" => Command::Put {
            key: key.ok_or(DecodeError::MissingField("key"))?,
            value: value.ok_or(DecodeError::MissingField("value"))?,
            expiry,
            publisher: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "erase" => Command::Erase {
            key: key.ok_or(DecodeError::MissingField("key"))?,
            publisher: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "clear" => Command::Clear {
            publisher: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "add" => Command::Add {
            key: key.ok_or(DecodeError::MissingField("key"))?,
            delta: delta.ok_or(DecodeError::MissingField("delta"))?,
            expiry,
            publisher: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "subtract" => Command::Subtract {
            key: key.ok_or(DecodeError::MissingField("key"))?,
            delta: delta.ok_or(DecodeError::MissingField("delta"))?,
            expiry,
            publisher: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "snapshot_request" => Command::SnapshotRequest {
            requester: publisher.ok_or(DecodeError::MissingField("publisher"))?,
        },
        "snapshot" => Command::Snapshot {
            entries: entries.ok_or(DecodeError::MissingField("entries"))?,
        },
        "keepalive" => Command::Keepalive,
        _ => return Err(DecodeError::UnknownOp(op)),
    };
    Ok(command)
}

// -- entity ids and expiries -------------------------------------------------

fn encode_entity(enc: &mut Enc<'_>, entity: &EntityId) -> Result<(), EncodeError> {
    if entity.is_nil() {
        enc.null()?;
    } else {
        enc.array(2)?;
        enc.bytes(entity.endpoint.as_bytes())?;
        enc.u64(entity.object)?;
    }
    Ok(())
}

fn decode_entity(dec: &mut Decoder<'_>) -> Result<EntityId, DecodeError> {
    if dec.datatype()? == Type::Null {
        dec.null()?;
        return Ok(EntityId::nil());
    }
    expect_array(dec, 2, "entity id")?;
    let raw = dec.bytes()?;
    let endpoint: [u8; 16] = raw.try_into().map_err(|_| DecodeError::InvalidField {
        field: "endpoint",
        reason: format!("expected 16 bytes, got {}", raw.len()),
    })?;
    let object = dec.u64()?;
    Ok(EntityId::new(EndpointId::from_bytes(endpoint), object))
}

fn encode_expiry(enc: &mut Enc<'_>, expiry: &Option<Duration>) -> Result<(), EncodeError> {
    match expiry {
        Some(d) => {
            let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
            enc.u64(nanos)?;
        }
        None => {
            enc.null()?;
        }
    }
    Ok(())
}

fn decode_expiry(dec: &mut Decoder<'_>) -> Result<Option<Duration>, DecodeError> {
    if dec.datatype()? == Type::Null {
        dec.null()?;
        return Ok(None);
    }
    Ok(Some(Duration::from_nanos(dec.u64()?)))
}

// -- decoder helpers ----------------------------------------------------------

fn definite_array(dec: &mut Decoder<'_>) -> Result<u64, DecodeError> {
    dec.array()?.ok_or(DecodeError::IndefiniteLength)
}

fn definite_map(dec: &mut Decoder<'_>) -> Result<u64, DecodeError> {
    dec.map()?.ok_or(DecodeError::IndefiniteLength)
}

fn expect_array(dec: &mut Decoder<'_>, len: u64, what: &'static str) -> Result<(), DecodeError> {
    let got = definite_array(dec)?;
    if got != len {
        return Err(DecodeError::InvalidField {
            field: what,
            reason: format!("expected array of {len}, got {got}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn roundtrip(msg: NodeMessage) {
        let bytes = encode_node_message(&msg).unwrap();
        let decoded = decode_node_message(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    fn sender() -> EntityId {
        EntityId::new(EndpointId::from_bytes([7u8; 16]), 3)
    }

    #[test]
    fn data_message_roundtrip_preserves_every_variant() {
        let mut table = BTreeMap::new();
        table.insert(Data::from("k"), Data::from(1));
        let mut set = BTreeSet::new();
        set.insert(Data::from("member"));
        let value = Data::List(vec![
            Data::Nil,
            Data::from(true),
            Data::from(-42),
            Data::from(2.5),
            Data::from("text"),
            Data::Bytes(Bytes::from_static(b"\x00\x01")),
            Data::Table(table),
            Data::Set(set),
            Data::Record(vec![Data::from(1), Data::Nil]),
        ]);
        let msg = NodeMessage::new(
            NodeContent::Data(DataMessage::new("a/b", value)),
            20,
            sender(),
        );
        roundtrip(msg);
    }

    #[test]
    fn ttl_is_big_endian_on_the_wire() {
        let msg = NodeMessage::new(
            NodeContent::Data(DataMessage::new("t", Data::Nil)),
            0x0102,
            sender(),
        );
        let bytes = encode_node_message(&msg).unwrap();
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
    }

    #[test]
    fn command_roundtrips() {
        let commands = vec![
            Command::Put {
                key: Data::from("hello"),
                value: Data::from("world"),
                expiry: Some(Duration::from_secs(5)),
                publisher: sender(),
            },
            Command::Erase {
                key: Data::from("hello"),
                publisher: EntityId::nil(),
            },
            Command::Clear { publisher: sender() },
            Command::Add {
                key: Data::from("n"),
                delta: Data::from(2),
                expiry: None,
                publisher: sender(),
            },
            Command::Subtract {
                key: Data::from("n"),
                delta: Data::from(1),
                expiry: None,
                publisher: sender(),
            },
            Command::SnapshotRequest { requester: sender() },
            Command::Snapshot {
                entries: vec![SnapshotEntry {
                    key: Data::from("k"),
                    value: Data::from("v"),
                    expiry: Some(Duration::from_millis(20)),
                }],
            },
            Command::Keepalive,
        ];
        for command in commands {
            roundtrip(NodeMessage::new(
                NodeContent::Command(CommandMessage::new("foo/master", command)),
                7,
                sender(),
            ));
        }
    }

    #[test]
    fn nil_publisher_survives_the_wire() {
        let msg = NodeMessage::new(
            NodeContent::Command(CommandMessage::new(
                "foo/master",
                Command::Put {
                    key: Data::from("k"),
                    value: Data::from("v"),
                    expiry: None,
                    publisher: EntityId::nil(),
                },
            )),
            1,
            sender(),
        );
        let bytes = encode_node_message(&msg).unwrap();
        let decoded = decode_node_message(&bytes).unwrap();
        match decoded.content {
            NodeContent::Command(cm) => {
                assert_eq!(cm.command.publisher(), Some(EntityId::nil()));
            }
            _ => panic!("expected command"),
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let msg = NodeMessage::new(
            NodeContent::Data(DataMessage::new("t", Data::from(1))),
            2,
            sender(),
        );
        let bytes = encode_node_message(&msg).unwrap();
        assert!(decode_node_message(&bytes[..10]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let msg = NodeMessage::new(
            NodeContent::Data(DataMessage::new("t", Data::from(1))),
            2,
            sender(),
        );
        let mut bytes = encode_node_message(&msg).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_node_message(&bytes),
            Err(DecodeError::TrailingBytes)
        ));
    }
}
