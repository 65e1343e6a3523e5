//! Typed view over store change events.
//!
//! Masters publish change events on `.store_events/<name>` as lists shaped
//! `[op, key, (old,) new, expiry, endpoint, object]`. This module parses
//! them back into a typed form and renders the canonical textual shape,
//! e.g. `insert(foo, hello, world, none, (<endpoint>, 1))`.

use std::fmt;
use std::time::Duration;

use crate::data::Data;
use crate::id::EntityId;
use crate::message::DataMessage;
use crate::topic::STORE_EVENTS_PREFIX;

/// Builds the `insert` event vector.
pub(crate) fn insert_event(
    key: &Data,
    value: &Data,
    expiry: Option<Duration>,
    publisher: EntityId,
) -> Data {
    let mut fields = vec![Data::from("insert"), key.clone(), value.clone()];
    fields.push(expiry_data(expiry));
    append_publisher(&mut fields, publisher);
    Data::List(fields)
}

/// Builds the `update` event vector.
pub(crate) fn update_event(
    key: &Data,
    old_value: &Data,
    new_value: &Data,
    expiry: Option<Duration>,
    publisher: EntityId,
) -> Data {
    let mut fields = vec![
        Data::from("update"),
        key.clone(),
        old_value.clone(),
        new_value.clone(),
    ];
    fields.push(expiry_data(expiry));
    append_publisher(&mut fields, publisher);
    Data::List(fields)
}

/// Builds the `erase` event vector.
pub(crate) fn erase_event(key: &Data, publisher: EntityId) -> Data {
    let mut fields = vec![Data::from("erase"), key.clone()];
    append_publisher(&mut fields, publisher);
    Data::List(fields)
}

fn expiry_data(expiry: Option<Duration>) -> Data {
    match expiry {
        Some(d) => Data::Integer(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)),
        None => Data::Nil,
    }
}

/// An entity id flattens to two trailing slots; a nil id contributes nils.
fn append_publisher(fields: &mut Vec<Data>, publisher: EntityId) {
    if publisher.is_nil() {
        fields.push(Data::Nil);
        fields.push(Data::Nil);
    } else {
        fields.push(Data::from(publisher.endpoint.to_string()));
        fields.push(Data::Integer(
            i64::try_from(publisher.object).unwrap_or(i64::MAX),
        ));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Insert {
        store: String,
        key: Data,
        value: Data,
        expiry: Data,
        publisher_endpoint: Data,
        publisher_object: Data,
    },
    Update {
        store: String,
        key: Data,
        old_value: Data,
        new_value: Data,
        expiry: Data,
        publisher_endpoint: Data,
        publisher_object: Data,
    },
    Erase {
        store: String,
        key: Data,
        publisher_endpoint: Data,
        publisher_object: Data,
    },
}

impl StoreEvent {
    /// Parses a store event from a data message, or `None` if the message
    /// is not one.
    pub fn parse(msg: &DataMessage) -> Option<StoreEvent> {
        let store = msg
            .topic
            .as_str()
            .strip_prefix(STORE_EVENTS_PREFIX)?
            .strip_prefix('/')?
            .to_string();
        let Data::List(fields) = &msg.data else {
            return None;
        };
        let op = match fields.first() {
            Some(Data::Str(op)) => op.as_str(),
            _ => return None,
        };
        match (op, fields.len()) {
            ("insert", 6) => Some(StoreEvent::Insert {
                store,
                key: fields[1].clone(),
                value: fields[2].clone(),
                expiry: fields[3].clone(),
                publisher_endpoint: fields[4].clone(),
                publisher_object: fields[5].clone(),
            }),
            ("update", 7) => Some(StoreEvent::Update {
                store,
                key: fields[1].clone(),
                old_value: fields[2].clone(),
                new_value: fields[3].clone(),
                expiry: fields[4].clone(),
                publisher_endpoint: fields[5].clone(),
                publisher_object: fields[6].clone(),
            }),
            ("erase", 4) => Some(StoreEvent::Erase {
                store,
                key: fields[1].clone(),
                publisher_endpoint: fields[2].clone(),
                publisher_object: fields[3].clone(),
            }),
            _ => None,
        }
    }
}

fn write_expiry(f: &mut fmt::Formatter<'_>, expiry: &Data) -> fmt::Result {
    if expiry.is_nil() {
        f.write_str("none")
    } else {
        write!(f, "{expiry}")
    }
}

fn write_publisher(f: &mut fmt::Formatter<'_>, endpoint: &Data, object: &Data) -> fmt::Result {
    if endpoint.is_nil() {
        f.write_str("none")
    } else {
        write!(f, "({endpoint}, {object})")
    }
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEvent::Insert {
                store,
                key,
                value,
                expiry,
                publisher_endpoint,
                publisher_object,
            } => {
                write!(f, "insert({store}, {key}, {value}, ")?;
                write_expiry(f, expiry)?;
                f.write_str(", ")?;
                write_publisher(f, publisher_endpoint, publisher_object)?;
                f.write_str(")")
            }
            StoreEvent::Update {
                store,
                key,
                old_value,
                new_value,
                expiry,
                publisher_endpoint,
                publisher_object,
            } => {
                write!(f, "update({store}, {key}, {old_value}, {new_value}, ")?;
                write_expiry(f, expiry)?;
                f.write_str(", ")?;
                write_publisher(f, publisher_endpoint, publisher_object)?;
                f.write_str(")")
            }
            StoreEvent::Erase {
                store,
                key,
                publisher_endpoint,
                publisher_object,
            } => {
                write!(f, "erase({store}, {key}, ")?;
                write_publisher(f, publisher_endpoint, publisher_object)?;
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;

    fn event_message(fields: Vec<Data>) -> DataMessage {
        DataMessage {
            topic: Topic::store_events("foo"),
            data: Data::List(fields),
        }
    }

    #[test]
    fn insert_parses_and_renders() {
        let msg = event_message(vec![
            Data::from("insert"),
            Data::from("hello"),
            Data::from("world"),
            Data::Nil,
            Data::from("aabbccdd"),
            Data::from(1),
        ]);
        let event = StoreEvent::parse(&msg).unwrap();
        assert_eq!(event.to_string(), "insert(foo, hello, world, none, (aabbccdd, 1))");
    }

    #[test]
    fn update_parses_and_renders() {
        let msg = event_message(vec![
            Data::from("update"),
            Data::from("hello"),
            Data::from("world"),
            Data::from("universe"),
            Data::Nil,
            Data::Nil,
            Data::Nil,
        ]);
        let event = StoreEvent::parse(&msg).unwrap();
        assert_eq!(
            event.to_string(),
            "update(foo, hello, world, universe, none, none)"
        );
    }

    #[test]
    fn erase_parses_and_renders() {
        let msg = event_message(vec![
            Data::from("erase"),
            Data::from("hello"),
            Data::from("aabbccdd"),
            Data::from(2),
        ]);
        let event = StoreEvent::parse(&msg).unwrap();
        assert_eq!(event.to_string(), "erase(foo, hello, (aabbccdd, 2))");
    }

    #[test]
    fn foreign_messages_do_not_parse() {
        let msg = DataMessage::new("a/b", Data::from("x"));
        assert!(StoreEvent::parse(&msg).is_none());
        let msg = event_message(vec![Data::from("noop")]);
        assert!(StoreEvent::parse(&msg).is_none());
    }
}
