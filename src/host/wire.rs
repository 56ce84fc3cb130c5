//! Wire encoding for context handoff
//!
//! A handoff ships the program image together with a [`Snapshot`] of the
//! pending contexts, so every id inside the snapshot refers to the image
//! in the same frame. Heap values are interned into an object table by
//! identity; aliased and cyclic references decode back to the same
//! shared cell on the receiving node.

use super::Error;
use crate::image::{FieldId, MethodId, Program, Ty};
use crate::runtime::{ArrData, Instance, Invocation, Value};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Frames larger than this are rejected before allocation.
const MAX_FRAME: u32 = 256 * 1024 * 1024;

/// One length-prefixed frame: a big-endian `u32` byte count, then the
/// bincode payload.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), Error> {
    w.write_u32::<BigEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("oversized frame ({} bytes)", len)));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// The one message of the handoff protocol. The receiver answers with a
/// single-byte acknowledgement frame once it has decoded the contexts.
#[derive(Serialize, Deserialize)]
pub struct Handoff {
    pub program: Program,
    pub snapshot: Snapshot,
}

pub const ACK: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SavedValue {
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    /// Index into the snapshot's object table
    Obj(u32),
    Arr(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SavedObject {
    Instance {
        ty: crate::image::TypeId,
        fields: Vec<(FieldId, SavedValue)>,
    },
    Array {
        elem: Ty,
        items: Vec<SavedValue>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedInvocation {
    pub method: MethodId,
    pub receiver: Option<SavedValue>,
    pub args: Vec<SavedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedContext {
    pub save: Vec<SavedValue>,
    pub entry: SavedInvocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub objects: Vec<SavedObject>,
    pub contexts: Vec<SavedContext>,
}

impl Snapshot {
    /// Encode exported contexts (save stack + entry invocation pairs)
    /// into a self-contained snapshot.
    pub fn capture(exported: &[(Vec<Value>, Invocation)]) -> Snapshot {
        let mut enc = Encoder { objects: vec![], seen: HashMap::new() };
        let contexts = exported
            .iter()
            .map(|(save, entry)| SavedContext {
                save: save.iter().map(|v| enc.value(v)).collect(),
                entry: SavedInvocation {
                    method: entry.method,
                    receiver: entry.receiver.as_ref().map(|v| enc.value(v)),
                    args: entry.args.iter().map(|v| enc.value(v)).collect(),
                },
            })
            .collect();
        Snapshot {
            objects: enc.objects.into_iter().map(|o| match o {
                Some(o) => o,
                // Every reserved slot is filled before capture returns
                None => unreachable!("unfilled object slot"),
            }).collect(),
            contexts,
        }
    }

    /// Decode back into live values. Object shells are allocated first
    /// so aliases and cycles resolve to the same cells.
    pub fn restore(&self) -> Result<Vec<(Vec<Value>, Invocation)>, Error> {
        let shells: Vec<Value> = self
            .objects
            .iter()
            .map(|obj| match obj {
                SavedObject::Instance { ty, .. } => Value::Obj(Arc::new(Mutex::new(Instance {
                    ty: *ty,
                    fields: HashMap::new(),
                }))),
                SavedObject::Array { elem, .. } => Value::Arr(Arc::new(Mutex::new(ArrData {
                    elem: elem.clone(),
                    items: vec![],
                }))),
            })
            .collect();
        for (obj, shell) in self.objects.iter().zip(&shells) {
            match (obj, shell) {
                (SavedObject::Instance { fields, .. }, Value::Obj(cell)) => {
                    let mut inner = cell.lock().unwrap_or_else(|e| e.into_inner());
                    for (id, v) in fields {
                        inner.fields.insert(*id, decode(v, &shells)?);
                    }
                }
                (SavedObject::Array { items, .. }, Value::Arr(cell)) => {
                    let mut inner = cell.lock().unwrap_or_else(|e| e.into_inner());
                    inner.items = items
                        .iter()
                        .map(|v| decode(v, &shells))
                        .collect::<Result<_, _>>()?;
                }
                _ => unreachable!(),
            }
        }
        self.contexts
            .iter()
            .map(|ctx| {
                let save = ctx
                    .save
                    .iter()
                    .map(|v| decode(v, &shells))
                    .collect::<Result<_, _>>()?;
                let receiver = match &ctx.entry.receiver {
                    Some(v) => Some(decode(v, &shells)?),
                    None => None,
                };
                let args = ctx
                    .entry
                    .args
                    .iter()
                    .map(|v| decode(v, &shells))
                    .collect::<Result<_, _>>()?;
                Ok((save, Invocation { method: ctx.entry.method, receiver, args }))
            })
            .collect()
    }
}

struct Encoder {
    objects: Vec<Option<SavedObject>>,
    // Heap cell address -> object table index
    seen: HashMap<usize, u32>,
}

impl Encoder {
    fn value(&mut self, value: &Value) -> SavedValue {
        match value {
            Value::Null => SavedValue::Null,
            Value::Bool(v) => SavedValue::Bool(*v),
            Value::I8(v) => SavedValue::I8(*v),
            Value::U8(v) => SavedValue::U8(*v),
            Value::I16(v) => SavedValue::I16(*v),
            Value::U16(v) => SavedValue::U16(*v),
            Value::I32(v) => SavedValue::I32(*v),
            Value::U32(v) => SavedValue::U32(*v),
            Value::I64(v) => SavedValue::I64(*v),
            Value::U64(v) => SavedValue::U64(*v),
            Value::F32(v) => SavedValue::F32(*v),
            Value::F64(v) => SavedValue::F64(*v),
            Value::Str(v) => SavedValue::Str(v.clone()),
            Value::Obj(cell) => {
                let key = Arc::as_ptr(cell) as usize;
                if let Some(&index) = self.seen.get(&key) {
                    return SavedValue::Obj(index);
                }
                let index = self.reserve(key);
                let (ty, raw_fields) = {
                    let inner = cell.lock().unwrap_or_else(|e| e.into_inner());
                    let mut raw: Vec<(FieldId, Value)> =
                        inner.fields.iter().map(|(id, v)| (*id, v.clone())).collect();
                    raw.sort_by_key(|(id, _)| (id.owner.0, id.index));
                    (inner.ty, raw)
                };
                let fields = raw_fields
                    .into_iter()
                    .map(|(id, v)| (id, self.value(&v)))
                    .collect();
                self.objects[index as usize] = Some(SavedObject::Instance { ty, fields });
                SavedValue::Obj(index)
            }
            Value::Arr(cell) => {
                let key = Arc::as_ptr(cell) as usize;
                if let Some(&index) = self.seen.get(&key) {
                    return SavedValue::Arr(index);
                }
                let index = self.reserve(key);
                let (elem, raw_items) = {
                    let inner = cell.lock().unwrap_or_else(|e| e.into_inner());
                    (inner.elem.clone(), inner.items.clone())
                };
                let items = raw_items.iter().map(|v| self.value(v)).collect();
                self.objects[index as usize] = Some(SavedObject::Array { elem, items });
                SavedValue::Arr(index)
            }
        }
    }

    fn reserve(&mut self, key: usize) -> u32 {
        let index = self.objects.len() as u32;
        self.objects.push(None);
        self.seen.insert(key, index);
        index
    }
}

fn decode(value: &SavedValue, shells: &[Value]) -> Result<Value, Error> {
    Ok(match value {
        SavedValue::Null => Value::Null,
        SavedValue::Bool(v) => Value::Bool(*v),
        SavedValue::I8(v) => Value::I8(*v),
        SavedValue::U8(v) => Value::U8(*v),
        SavedValue::I16(v) => Value::I16(*v),
        SavedValue::U16(v) => Value::U16(*v),
        SavedValue::I32(v) => Value::I32(*v),
        SavedValue::U32(v) => Value::U32(*v),
        SavedValue::I64(v) => Value::I64(*v),
        SavedValue::U64(v) => Value::U64(*v),
        SavedValue::F32(v) => Value::F32(*v),
        SavedValue::F64(v) => Value::F64(*v),
        SavedValue::Str(v) => Value::Str(v.clone()),
        SavedValue::Obj(i) | SavedValue::Arr(i) => shells
            .get(*i as usize)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("dangling object reference {}", i)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TypeId;

    fn obj(ty: u32) -> Value {
        Value::Obj(Arc::new(Mutex::new(Instance {
            ty: TypeId(ty),
            fields: HashMap::new(),
        })))
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = vec![];
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        let back = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = vec![];
        buf.write_u32::<BigEndian>(u32::MAX).unwrap();
        assert!(matches!(read_frame(&mut buf.as_slice()), Err(Error::Protocol(_))));
    }

    #[test]
    fn aliased_references_stay_shared() {
        // The same cell appears twice in the save stack and once as an
        // argument; all three must decode to one shared cell
        let shared = obj(0);
        let entry = Invocation {
            method: MethodId { owner: TypeId(0), index: 0 },
            receiver: None,
            args: vec![shared.clone()],
        };
        let snapshot = Snapshot::capture(&[(vec![shared.clone(), shared], entry)]);
        assert_eq!(snapshot.objects.len(), 1);

        let restored = Snapshot::restore(&snapshot).unwrap();
        let (save, entry) = &restored[0];
        match (&save[0], &save[1], &entry.args[0]) {
            (Value::Obj(a), Value::Obj(b), Value::Obj(c)) => {
                assert!(Arc::ptr_eq(a, b));
                assert!(Arc::ptr_eq(a, c));
            }
            other => panic!("unexpected shapes {:?}", other),
        }
    }

    #[test]
    fn cyclic_objects_encode_and_decode() {
        let a = obj(0);
        let b = obj(1);
        let link = FieldId { owner: TypeId(0), index: 0 };
        if let (Value::Obj(ca), Value::Obj(cb)) = (&a, &b) {
            ca.lock().unwrap().fields.insert(link, b.clone());
            cb.lock().unwrap().fields.insert(link, a.clone());
        }
        let entry = Invocation {
            method: MethodId { owner: TypeId(0), index: 0 },
            receiver: None,
            args: vec![],
        };
        let snapshot = Snapshot::capture(&[(vec![a], entry)]);
        assert_eq!(snapshot.objects.len(), 2);

        let restored = Snapshot::restore(&snapshot).unwrap();
        let first = &restored[0].0[0];
        if let Value::Obj(ca) = first {
            let back = ca.lock().unwrap().fields[&link].clone();
            if let Value::Obj(cb) = back {
                let round = cb.lock().unwrap().fields[&link].clone();
                if let Value::Obj(cc) = round {
                    assert!(Arc::ptr_eq(ca, &cc));
                } else {
                    panic!("expected an object");
                }
            } else {
                panic!("expected an object");
            }
        } else {
            panic!("expected an object");
        }
    }

    #[test]
    fn mixed_scalars_survive() {
        let arr = Value::Arr(Arc::new(Mutex::new(ArrData {
            elem: Ty::I32,
            items: vec![Value::I32(1), Value::I32(2)],
        })));
        let entry = Invocation {
            method: MethodId { owner: TypeId(0), index: 0 },
            receiver: None,
            args: vec![],
        };
        let save = vec![Value::I64(-7), Value::Str("mid-flight".into()), arr, Value::Bool(true)];
        let snapshot = Snapshot::capture(&[(save, entry)]);
        let restored = Snapshot::restore(&snapshot).unwrap();
        let save = &restored[0].0;
        assert!(matches!(save[0], Value::I64(-7)));
        assert!(matches!(&save[1], Value::Str(s) if s == "mid-flight"));
        match &save[2] {
            Value::Arr(cell) => {
                let inner = cell.lock().unwrap();
                assert_eq!(inner.items.len(), 2);
                assert!(matches!(inner.items[1], Value::I32(2)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(save[3], Value::Bool(true)));
    }
}
