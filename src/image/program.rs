use super::{ExceptionRegion, Instruction, MethodId, Ty, TypeId};
use bitflags::bitflags;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

bitflags! {
    pub struct TypeFlags: u32 {
        /// Type is an interface (no fields, no concrete bodies)
        const INTERFACE = 0x1;
        /// Every method of the type runs under a migration lock
        const ATOMIC = 0x2;
    }
}

bitflags! {
    pub struct MethodFlags: u32 {
        const STATIC = 0x1;
        /// Method body runs under a migration lock, never checkpointed
        const ATOMIC = 0x2;
        /// Instance constructor (always treated as atomic)
        const CTOR = 0x4;
    }
}

// bitflags 1.x doesn't derive serde, so round-trip through the raw bits.
macro_rules! serde_bits {
    ($flags:ident) => {
        impl Serialize for $flags {
            fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $flags {
            fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let bits = u32::deserialize(de)?;
                $flags::from_bits(bits)
                    .ok_or_else(|| D::Error::custom(format!("bad {} bits {:#x}", stringify!($flags), bits)))
            }
        }
    };
}

serde_bits!(TypeFlags);
serde_bits!(MethodFlags);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Ty,
    pub is_static: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<Ty>,
    pub code: Vec<Instruction>,
    /// Innermost regions first
    pub regions: Vec<ExceptionRegion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub flags: MethodFlags,
    /// Declared parameters, excluding the receiver
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
    /// `None` for abstract and interface methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Argument slots as the callee sees them: receiver first for
    /// instance methods, then the declared parameters.
    pub fn arg_types(&self, owner: TypeId) -> Vec<Ty> {
        let mut args = Vec::with_capacity(self.params.len() + 1);
        if !self.is_static() {
            args.push(Ty::Class(owner));
        }
        args.extend(self.params.iter().cloned());
        args
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub flags: TypeFlags,
    pub super_ty: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }
}

/// A whole loadable image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub types: Vec<TypeDef>,
    pub entry: Option<MethodId>,
}

#[derive(Debug)]
pub enum ImageError {
    Io(std::io::Error),
    Encoding(bincode::Error),
    /// Id refers past the end of its table
    BadId(String),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImageError::Io(err) => write!(f, "image io error: {}", err),
            ImageError::Encoding(err) => write!(f, "image encoding error: {}", err),
            ImageError::BadId(what) => write!(f, "dangling reference to {}", what),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> ImageError {
        ImageError::Io(err)
    }
}

impl From<bincode::Error> for ImageError {
    fn from(err: bincode::Error) -> ImageError {
        ImageError::Encoding(err)
    }
}

impl Program {
    pub fn type_def(&self, id: TypeId) -> Result<&TypeDef, ImageError> {
        self.types
            .get(id.0 as usize)
            .ok_or_else(|| ImageError::BadId(format!("type {}", id.0)))
    }

    pub fn method_def(&self, id: MethodId) -> Result<&MethodDef, ImageError> {
        self.type_def(id.owner)?
            .methods
            .get(id.index as usize)
            .ok_or_else(|| ImageError::BadId(format!("method {}.{}", id.owner.0, id.index)))
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| TypeId(i as u32))
    }

    pub fn method_by_name(&self, ty: TypeId, name: &str) -> Option<MethodId> {
        self.types.get(ty.0 as usize).and_then(|t| {
            t.methods
                .iter()
                .position(|m| m.name == name)
                .map(|i| MethodId { owner: ty, index: i as u32 })
        })
    }

    /// Superclass chain starting at `ty` itself
    pub fn ancestry(&self, ty: TypeId) -> Vec<TypeId> {
        let mut chain = vec![ty];
        let mut cur = ty;
        while let Some(sup) = self.types.get(cur.0 as usize).and_then(|t| t.super_ty) {
            chain.push(sup);
            cur = sup;
        }
        chain
    }

    /// All interfaces `ty` implements, directly or through supertypes
    pub fn all_interfaces(&self, ty: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        let mut work: Vec<TypeId> = self.ancestry(ty);
        while let Some(t) = work.pop() {
            if let Some(def) = self.types.get(t.0 as usize) {
                for &itf in &def.interfaces {
                    if !out.contains(&itf) {
                        out.push(itf);
                        work.push(itf);
                    }
                }
                if def.is_interface() && !out.contains(&t) && t != ty {
                    out.push(t);
                }
            }
        }
        out
    }

    /// Can a value of type `from` stand where `to` is expected?
    pub fn is_assignable(&self, from: &Ty, to: &Ty) -> bool {
        if from == to {
            return true;
        }
        match (from, to) {
            // Any reference assigns to the root object type
            (f, Ty::Object) if f.is_reference() => true,
            (Ty::Class(f), Ty::Class(t)) => {
                self.ancestry(*f).contains(t) || self.all_interfaces(*f).contains(t)
            }
            // Array covariance over element types
            (Ty::Array(f), Ty::Array(t)) => self.is_assignable(f, t),
            _ => false,
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ImageError> {
        let file = BufWriter::new(File::create(path)?);
        bincode::serialize_into(file, self)?;
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> Result<Program, ImageError> {
        let file = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(name: &str, super_ty: Option<TypeId>, interfaces: Vec<TypeId>, flags: TypeFlags) -> TypeDef {
        TypeDef {
            name: name.to_owned(),
            flags,
            super_ty,
            interfaces,
            fields: vec![],
            methods: vec![],
        }
    }

    fn sample() -> Program {
        // 0: IShape (interface)
        // 1: Shape : IShape
        // 2: Circle : Shape
        // 3: Square : Shape
        Program {
            types: vec![
                ty("IShape", None, vec![], TypeFlags::INTERFACE),
                ty("Shape", None, vec![TypeId(0)], TypeFlags::empty()),
                ty("Circle", Some(TypeId(1)), vec![], TypeFlags::empty()),
                ty("Square", Some(TypeId(1)), vec![], TypeFlags::empty()),
            ],
            entry: None,
        }
    }

    #[test]
    fn assignable_through_superclass() {
        let p = sample();
        assert!(p.is_assignable(&Ty::Class(TypeId(2)), &Ty::Class(TypeId(1))));
        assert!(!p.is_assignable(&Ty::Class(TypeId(1)), &Ty::Class(TypeId(2))));
        assert!(!p.is_assignable(&Ty::Class(TypeId(2)), &Ty::Class(TypeId(3))));
    }

    #[test]
    fn assignable_through_interface() {
        let p = sample();
        assert!(p.is_assignable(&Ty::Class(TypeId(2)), &Ty::Class(TypeId(0))));
        assert!(p.is_assignable(&Ty::Class(TypeId(1)), &Ty::Class(TypeId(0))));
    }

    #[test]
    fn references_assign_to_object() {
        let p = sample();
        assert!(p.is_assignable(&Ty::Class(TypeId(2)), &Ty::Object));
        assert!(p.is_assignable(&Ty::Str, &Ty::Object));
        assert!(!p.is_assignable(&Ty::I32, &Ty::Object));
    }

    #[test]
    fn array_covariance() {
        let p = sample();
        assert!(p.is_assignable(
            &Ty::Array(Box::new(Ty::Class(TypeId(2)))),
            &Ty::Array(Box::new(Ty::Class(TypeId(1)))),
        ));
        assert!(!p.is_assignable(
            &Ty::Array(Box::new(Ty::I32)),
            &Ty::Array(Box::new(Ty::I64)),
        ));
    }
}
