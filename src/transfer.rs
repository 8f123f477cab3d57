//! Cross-instance value codec.
//!
//! [`serialize`] walks a [`Value`] graph reachable from a single root
//! and produces the instance-neutral [`Payload`] moved into the
//! destination inbox. [`reify`] rebuilds a `Payload` into fresh tables
//! on the receiving strand. Both directions are iterative with an
//! explicit frame stack; recursion depth never depends on the value.
//!
//! Rules, checked in this order: the root must be a scalar, a string,
//! an address, the own-inbox marker or a plain table; a table with an
//! unrecognised metatable fails `not_supported` and a function-like
//! leaf fails `invalid_argument`. Inside containers the same kinds are
//! instead silently dropped, as are entries with non-string keys.
//! Reference cycles fail `cycle_exists`; nesting deeper than
//! [`MAX_LEVELS`] fails `too_many_levels` and arrays longer than
//! [`MAX_ARRAY`] fail `array_too_long`.

use std::collections::HashSet;

use crate::error::{CodecError, ErrorObject, GenericError, StdResult};
use crate::inbox::Address;
use crate::value::{Key, Payload, PayloadArray, PayloadObject, Table, Value};
use crate::vm::Actor;

/// Maximum container nesting of a transferable value.
pub const MAX_LEVELS: usize = 128;

/// Maximum length of a transferable array.
pub const MAX_ARRAY: usize = 1 << 16;

////////////////////////////////////////////////////////////////////////////////
// Serializer
////////////////////////////////////////////////////////////////////////////////

enum Slot {
    Root,
    Key(String),
    Append,
}

struct Frame {
    table_id: usize,
    /// `(key, value)` pairs for objects; `(None, value)` for arrays.
    children: std::vec::IntoIter<(Option<String>, Value)>,
    is_array: bool,
    object: PayloadObject,
    array: PayloadArray,
    slot: Slot,
}

/// Copies `value` into an instance-neutral graph, binding own-inbox
/// markers to `actor`'s inbox.
pub(crate) fn serialize(actor: &Actor, value: &Value) -> StdResult<Payload, ErrorObject> {
    match value {
        Value::Bool(b) => return Ok(Payload::Bool(*b)),
        Value::Number(n) => return Ok(Payload::Number(*n)),
        Value::Str(s) => return Ok(Payload::Str(s.clone())),
        Value::Address(a) => {
            if a.is_closed_handle() {
                return Err(GenericError::NotSupported.into());
            }
            return Ok(Payload::Address(a.clone()));
        }
        Value::OwnInbox => return Ok(Payload::Address(actor.export_inbox())),
        Value::Callable => return Err(GenericError::InvalidArgument.into()),
        Value::Table(t) => {
            if t.data().opaque_meta {
                return Err(GenericError::NotSupported.into());
            }
            // fall through to the iterative walk below
        }
    }
    let root = match value {
        Value::Table(t) => t,
        _ => unreachable!(),
    };

    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    stack.push(open_table(root, Slot::Root, &mut visited, 0)?);

    loop {
        let next = stack
            .last_mut()
            .expect("the frame stack holds the root until the walk ends")
            .children
            .next();
        let (key, child) = match next {
            Some(pair) => pair,
            None => {
                // Close event: the finished container attaches to its
                // parent, or ends the walk.
                let frame = stack.pop().unwrap();
                visited.remove(&frame.table_id);
                let payload = if frame.is_array {
                    Payload::Array(frame.array)
                } else {
                    Payload::Object(frame.object)
                };
                match frame.slot {
                    Slot::Root => return Ok(payload),
                    Slot::Key(k) => {
                        attach(stack.last_mut().unwrap(), Some(k), payload);
                    }
                    Slot::Append => {
                        attach(stack.last_mut().unwrap(), None, payload);
                    }
                }
                continue;
            }
        };

        match child {
            Value::Bool(b) => attach(stack.last_mut().unwrap(), key, Payload::Bool(b)),
            Value::Number(n) => attach(stack.last_mut().unwrap(), key, Payload::Number(n)),
            Value::Str(s) => attach(stack.last_mut().unwrap(), key, Payload::Str(s)),
            Value::Address(a) => {
                // A dead send capability inside a container is dropped
                // like any other non-transferable leaf.
                if !a.is_closed_handle() {
                    attach(stack.last_mut().unwrap(), key, Payload::Address(a.clone()));
                }
            }
            Value::OwnInbox => {
                attach(
                    stack.last_mut().unwrap(),
                    key,
                    Payload::Address(actor.export_inbox()),
                );
            }
            Value::Callable => {} // silently dropped
            Value::Table(t) => {
                if t.data().opaque_meta {
                    continue; // silently dropped
                }
                let slot = match key {
                    Some(k) => Slot::Key(k),
                    None => Slot::Append,
                };
                let frame = open_table(&t, slot, &mut visited, stack.len())?;
                stack.push(frame);
            }
        }
    }
}

fn attach(frame: &mut Frame, key: Option<String>, payload: Payload) {
    match key {
        Some(k) => {
            frame.object.insert(k, payload);
        }
        None => frame.array.push(payload),
    }
}

fn open_table(
    table: &Table,
    slot: Slot,
    visited: &mut HashSet<usize>,
    depth: usize,
) -> StdResult<Frame, ErrorObject> {
    if !visited.insert(table.id()) {
        return Err(CodecError::CycleExists.into());
    }
    if depth >= MAX_LEVELS {
        return Err(CodecError::TooManyLevels.into());
    }
    let data = table.data();
    // A positive length (or a preserved array mark) opens the node as
    // an array; the keyed part is not part of an array's image.
    let is_array = data.array_mark || !data.items.is_empty();
    let children: Vec<(Option<String>, Value)> = if is_array {
        if data.items.len() > MAX_ARRAY {
            return Err(CodecError::ArrayTooLong.into());
        }
        data.items.iter().map(|v| (None, v.clone())).collect()
    } else {
        data.entries
            .iter()
            .filter_map(|(k, v)| match k {
                Key::Str(s) => Some((Some(s.clone()), v.clone())),
                // Non-string keys are silently skipped.
                Key::Int(_) => None,
            })
            .collect()
    };
    Ok(Frame {
        table_id: table.id(),
        children: children.into_iter(),
        is_array,
        object: PayloadObject::new(),
        array: PayloadArray::new(),
        slot,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Deserializer
////////////////////////////////////////////////////////////////////////////////

enum BuildFrame {
    Object {
        src: std::collections::btree_map::IntoIter<String, Payload>,
        table: Table,
    },
    Array {
        src: std::vec::IntoIter<Payload>,
        table: Table,
    },
}

/// Rebuilds a payload into fresh values. Runs on the receiving strand;
/// address leaves move over untouched and arrays come back as tables
/// carrying the array mark.
pub(crate) fn reify(payload: Payload) -> Value {
    let root = match payload {
        Payload::Bool(b) => return Value::Bool(b),
        Payload::Number(n) => return Value::Number(n),
        Payload::Str(s) => return Value::Str(s),
        Payload::Address(a) => return Value::Address(a),
        container => container,
    };

    let (root_table, first) = open_payload(root);
    let mut stack = vec![first];
    loop {
        let next = {
            let frame = match stack.last_mut() {
                Some(frame) => frame,
                None => break,
            };
            match frame {
                BuildFrame::Object { src, table } => src
                    .next()
                    .map(|(k, v)| (Some(k), v, table.clone())),
                BuildFrame::Array { src, table } => {
                    src.next().map(|v| (None, v, table.clone()))
                }
            }
        };
        let (key, child, table) = match next {
            Some(triple) => triple,
            None => {
                stack.pop();
                continue;
            }
        };
        let value = match child {
            Payload::Bool(b) => Value::Bool(b),
            Payload::Number(n) => Value::Number(n),
            Payload::Str(s) => Value::Str(s),
            Payload::Address(a) => Value::Address(a),
            container => {
                // Containers are inserted as soon as they are opened;
                // the handle is shared, so filling them afterwards is
                // visible through the parent.
                let (child_table, child_frame) = open_payload(container);
                insert(&table, key, Value::Table(child_table));
                stack.push(child_frame);
                continue;
            }
        };
        insert(&table, key, value);
    }
    Value::Table(root_table)
}

fn open_payload(payload: Payload) -> (Table, BuildFrame) {
    match payload {
        Payload::Object(map) => {
            let table = Table::new();
            let frame = BuildFrame::Object {
                src: map.into_iter(),
                table: table.clone(),
            };
            (table, frame)
        }
        Payload::Array(items) => {
            let table = Table::new_array();
            let frame = BuildFrame::Array {
                src: items.into_iter(),
                table: table.clone(),
            };
            (table, frame)
        }
        _ => unreachable!("open_payload is only called on containers"),
    }
}

fn insert(table: &Table, key: Option<String>, value: Value) {
    match key {
        Some(k) => table.set(Key::Str(k), value),
        None => table.push(value),
    }
}
