use crate::image::{Ty, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Heap instance. Fields are keyed by their symbol so inherited fields
/// live alongside declared ones.
#[derive(Debug)]
pub struct Instance {
    pub ty: TypeId,
    pub fields: HashMap<crate::image::FieldId, Value>,
}

pub type ObjRef = Arc<Mutex<Instance>>;

#[derive(Debug)]
pub struct ArrData {
    pub elem: Ty,
    pub items: Vec<Value>,
}

pub type ArrRef = Arc<Mutex<ArrData>>;

/// A runtime value. Reference values share their payload through `Arc`,
/// so aliasing behaves like the image's object model and values can move
/// between context threads.
#[derive(Debug, Clone)]
pub enum Value {
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
    Obj(ObjRef),
    Arr(ArrRef),
}

impl Value {
    pub fn default_for(ty: &Ty) -> Value {
        match ty {
            Ty::Bool => Value::Bool(false),
            Ty::I8 => Value::I8(0),
            Ty::U8 => Value::U8(0),
            Ty::I16 => Value::I16(0),
            Ty::U16 => Value::U16(0),
            Ty::I32 => Value::I32(0),
            Ty::U32 => Value::U32(0),
            Ty::I64 => Value::I64(0),
            Ty::U64 => Value::U64(0),
            Ty::F32 => Value::F32(0.0),
            Ty::F64 => Value::F64(0.0),
            _ => Value::Null,
        }
    }

    /// Branch condition: zero, false, and null are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::I8(n) => *n != 0,
            Value::U8(n) => *n != 0,
            Value::I16(n) => *n != 0,
            Value::U16(n) => *n != 0,
            Value::I32(n) => *n != 0,
            Value::U32(n) => *n != 0,
            Value::I64(n) => *n != 0,
            Value::U64(n) => *n != 0,
            Value::F32(n) => *n != 0.0,
            Value::F64(n) => *n != 0.0,
            Value::Str(_) | Value::Obj(_) | Value::Arr(_) => true,
        }
    }

    /// Reference identity for `CmpEq` and snapshot deduplication.
    pub fn same_ref(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Obj(a), Value::Obj(b)) => Some(Arc::ptr_eq(a, b)),
            (Value::Arr(a), Value::Arr(b)) => Some(Arc::ptr_eq(a, b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
            Value::Obj(obj) => match obj.lock() {
                Ok(inner) => write!(f, "<object #{}>", inner.ty.0),
                Err(_) => f.write_str("<object>"),
            },
            Value::Arr(arr) => match arr.lock() {
                Ok(inner) => write!(f, "<{}[{}]>", inner.elem, inner.items.len()),
                Err(_) => f.write_str("<array>"),
            },
        }
    }
}
