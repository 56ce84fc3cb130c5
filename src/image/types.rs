use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a type in [`Program::types`](crate::image::Program::types)
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// A method, identified by its declaring type and its index there
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MethodId {
    pub owner: TypeId,
    pub index: u32,
}

/// A field, identified by its declaring type and its index there
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldId {
    pub owner: TypeId,
    pub index: u32,
}

/// Type of a local, argument, field, or stack slot
///
/// Primitives (and `Ptr`) are value types; everything else is a reference
/// type. `Object` is the universal reference root: every reference type is
/// assignable to it, and it is the fallback result of a failed stack-slot
/// merge. `Ptr` is an unmanaged pointer: it can never be captured portably,
/// so its presence on the operand stack disqualifies checkpointing there.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Ty {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
    Object,
    Class(TypeId),
    Array(Box<Ty>),
    Ptr,
}

impl Ty {
    pub fn is_value_type(&self) -> bool {
        !self.is_reference()
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Ty::Str | Ty::Object | Ty::Class(_) | Ty::Array(_))
    }

    /// Integral types that fit in 32 bits (merged down to `I32` at joins)
    pub fn is_small_integral(&self) -> bool {
        matches!(
            self,
            Ty::Bool | Ty::I8 | Ty::U8 | Ty::I16 | Ty::U16 | Ty::I32 | Ty::U32
        )
    }

    pub fn is_wide_integral(&self) -> bool {
        matches!(self, Ty::I64 | Ty::U64)
    }

    pub fn is_integral(&self) -> bool {
        self.is_small_integral() || self.is_wide_integral()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integral() || self.is_float()
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Bool => f.write_str("bool"),
            Ty::I8 => f.write_str("i8"),
            Ty::U8 => f.write_str("u8"),
            Ty::I16 => f.write_str("i16"),
            Ty::U16 => f.write_str("u16"),
            Ty::I32 => f.write_str("i32"),
            Ty::U32 => f.write_str("u32"),
            Ty::I64 => f.write_str("i64"),
            Ty::U64 => f.write_str("u64"),
            Ty::F32 => f.write_str("f32"),
            Ty::F64 => f.write_str("f64"),
            Ty::Str => f.write_str("string"),
            Ty::Object => f.write_str("object"),
            Ty::Class(id) => write!(f, "class#{}", id.0),
            Ty::Array(elem) => write!(f, "{}[]", elem),
            Ty::Ptr => f.write_str("ptr"),
        }
    }
}
