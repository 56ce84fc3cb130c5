//! Old-to-new symbol translation for the whole-program rewrite
//!
//! The rewrite is two-pass: pass one allocates every output type and
//! member and records the mapping here; pass two fills signatures and
//! bodies in any order, resolving references only through the map. The
//! map is injective and must be total over every symbol a body mentions;
//! a miss aborts the rewrite.

use super::errors::Error;
use crate::image::{ExceptionRegion, FieldId, Instruction, MethodId, Op, RegionKind, Ty, TypeId};
use std::collections::HashMap;

#[derive(Default)]
pub struct SymbolMap {
    types: HashMap<TypeId, TypeId>,
    methods: HashMap<MethodId, MethodId>,
    fields: HashMap<FieldId, FieldId>,
}

impl SymbolMap {
    pub fn new() -> SymbolMap {
        SymbolMap::default()
    }

    pub fn add_type(&mut self, old: TypeId, new: TypeId) {
        self.types.insert(old, new);
    }

    pub fn add_method(&mut self, old: MethodId, new: MethodId) {
        self.methods.insert(old, new);
    }

    pub fn add_field(&mut self, old: FieldId, new: FieldId) {
        self.fields.insert(old, new);
    }

    pub fn ty(&self, old: TypeId) -> Result<TypeId, Error> {
        self.types
            .get(&old)
            .copied()
            .ok_or_else(|| Error::SymbolMiss(format!("type {}", old.0)))
    }

    pub fn method(&self, old: MethodId) -> Result<MethodId, Error> {
        self.methods
            .get(&old)
            .copied()
            .ok_or_else(|| Error::SymbolMiss(format!("method {}.{}", old.owner.0, old.index)))
    }

    pub fn field(&self, old: FieldId) -> Result<FieldId, Error> {
        self.fields
            .get(&old)
            .copied()
            .ok_or_else(|| Error::SymbolMiss(format!("field {}.{}", old.owner.0, old.index)))
    }

    /// Array types translate structurally; primitives pass through.
    pub fn map_ty(&self, ty: &Ty) -> Result<Ty, Error> {
        Ok(match ty {
            Ty::Class(id) => Ty::Class(self.ty(*id)?),
            Ty::Array(elem) => Ty::Array(Box::new(self.map_ty(elem)?)),
            other => other.clone(),
        })
    }

    pub fn map_op(&self, op: &Op) -> Result<Op, Error> {
        Ok(match op {
            Op::Call(id) => Op::Call(self.method(*id)?),
            Op::CallVirt(id) => Op::CallVirt(self.method(*id)?),
            Op::NewObj(id) => Op::NewObj(self.method(*id)?),
            Op::GetField(id) => Op::GetField(self.field(*id)?),
            Op::SetField(id) => Op::SetField(self.field(*id)?),
            Op::GetStatic(id) => Op::GetStatic(self.field(*id)?),
            Op::SetStatic(id) => Op::SetStatic(self.field(*id)?),
            Op::Conv(ty) => Op::Conv(self.map_ty(ty)?),
            Op::NewArr(ty) => Op::NewArr(self.map_ty(ty)?),
            Op::Box(ty) => Op::Box(self.map_ty(ty)?),
            Op::Unbox(ty) => Op::Unbox(self.map_ty(ty)?),
            Op::CastClass(ty) => Op::CastClass(self.map_ty(ty)?),
            Op::IsInst(ty) => Op::IsInst(self.map_ty(ty)?),
            other => other.clone(),
        })
    }

    pub fn map_code(&self, code: &[Instruction]) -> Result<Vec<Instruction>, Error> {
        code.iter()
            .map(|insn| {
                Ok(Instruction { offset: insn.offset, op: self.map_op(&insn.op)? })
            })
            .collect()
    }

    pub fn map_regions(&self, regions: &[ExceptionRegion]) -> Result<Vec<ExceptionRegion>, Error> {
        regions
            .iter()
            .map(|r| {
                let kind = match &r.kind {
                    RegionKind::Catch(ty) => RegionKind::Catch(self.map_ty(ty)?),
                    other => other.clone(),
                };
                Ok(ExceptionRegion { kind, ..r.clone() })
            })
            .collect()
    }
}
