//! Whole-program rewrite
//!
//! Pass one allocates the output symbol space and the [`SymbolMap`];
//! pass two rewrites every body (mobile or atomic) and translates its
//! symbol references through the map. Any error rejects the whole image.

use super::atomic::rewrite_atomic;
use super::errors::Error;
use super::mobile::rewrite_mobile;
use super::symbols::SymbolMap;
use crate::image::{
    FieldDef, FieldId, MethodBody, MethodDef, MethodFlags, MethodId, Program, TypeDef, TypeFlags,
    TypeId,
};
use log::{debug, info};

pub struct Rewriter {
    map: SymbolMap,
}

impl Rewriter {
    /// Produce a self-checkpointing version of `program`.
    pub fn rewrite(program: &Program) -> Result<Program, Error> {
        info!("rewriting image: {} types", program.types.len());
        let mut rw = Rewriter { map: SymbolMap::new() };
        rw.allocate(program);
        let mut types = Vec::with_capacity(program.types.len());
        for (index, ty) in program.types.iter().enumerate() {
            types.push(rw.rewrite_type(program, TypeId(index as u32), ty)?);
        }
        let entry = program.entry.map(|m| rw.map.method(m)).transpose()?;
        Ok(Program { types, entry })
    }

    fn allocate(&mut self, program: &Program) {
        for (index, ty) in program.types.iter().enumerate() {
            let old = TypeId(index as u32);
            self.map.add_type(old, old);
            for fi in 0..ty.fields.len() {
                let id = FieldId { owner: old, index: fi as u32 };
                self.map.add_field(id, id);
            }
            for mi in 0..ty.methods.len() {
                let id = MethodId { owner: old, index: mi as u32 };
                self.map.add_method(id, id);
            }
        }
    }

    fn rewrite_type(
        &self,
        program: &Program,
        id: TypeId,
        ty: &TypeDef,
    ) -> Result<TypeDef, Error> {
        let fields = ty
            .fields
            .iter()
            .map(|f| {
                Ok(FieldDef {
                    name: f.name.clone(),
                    ty: self.map.map_ty(&f.ty)?,
                    is_static: f.is_static,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let methods = ty
            .methods
            .iter()
            .enumerate()
            .map(|(mi, m)| {
                self.rewrite_method(program, ty, MethodId { owner: id, index: mi as u32 }, m)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(TypeDef {
            name: ty.name.clone(),
            flags: ty.flags,
            super_ty: ty.super_ty.map(|s| self.map.ty(s)).transpose()?,
            interfaces: ty
                .interfaces
                .iter()
                .map(|&i| self.map.ty(i))
                .collect::<Result<Vec<_>, Error>>()?,
            fields,
            methods,
        })
    }

    fn rewrite_method(
        &self,
        program: &Program,
        owner: &TypeDef,
        id: MethodId,
        method: &MethodDef,
    ) -> Result<MethodDef, Error> {
        let body = if method.body.is_none() {
            None
        } else if is_atomic(owner, method) {
            debug!("atomic rewrite of {}.{}", owner.name, method.name);
            Some(self.map_body(rewrite_atomic(program, id)?)?)
        } else {
            debug!("mobile rewrite of {}.{}", owner.name, method.name);
            Some(self.map_body(rewrite_mobile(program, id)?)?)
        };
        Ok(MethodDef {
            name: method.name.clone(),
            flags: method.flags,
            params: method
                .params
                .iter()
                .map(|p| self.map.map_ty(p))
                .collect::<Result<Vec<_>, Error>>()?,
            ret: method.ret.as_ref().map(|r| self.map.map_ty(r)).transpose()?,
            body,
        })
    }

    fn map_body(&self, body: MethodBody) -> Result<MethodBody, Error> {
        Ok(MethodBody {
            locals: body
                .locals
                .iter()
                .map(|l| self.map.map_ty(l))
                .collect::<Result<Vec<_>, Error>>()?,
            code: self.map.map_code(&body.code)?,
            regions: self.map.map_regions(&body.regions)?,
        })
    }
}

fn is_atomic(owner: &TypeDef, method: &MethodDef) -> bool {
    method.flags.contains(MethodFlags::CTOR)
        || method.flags.contains(MethodFlags::ATOMIC)
        || owner.flags.contains(TypeFlags::ATOMIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Asm, MobileOp, Op, ProgramBuilder, Ty};

    #[test]
    fn constructors_go_atomic_and_plain_methods_go_mobile() {
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        b.add_field(app, "n", Ty::I32, false);

        let mut ctor = Asm::new();
        ctor.op(Op::Ret);
        b.add_method(app, "new", MethodFlags::CTOR, vec![], None, Some(ctor.finish()));

        let mut plain = Asm::new();
        plain.op(Op::Ret);
        b.add_method(app, "work", MethodFlags::STATIC, vec![], None, Some(plain.finish()));

        let p = b.finish();
        let out = Rewriter::rewrite(&p).unwrap();

        let ctor_body = out.types[0].methods[0].body.as_ref().unwrap();
        assert!(matches!(ctor_body.code[0].op, Op::Mobile(MobileOp::Lock)));
        let work_body = out.types[0].methods[1].body.as_ref().unwrap();
        assert!(matches!(work_body.code[0].op, Op::Mobile(MobileOp::IsRestoring)));
    }

    #[test]
    fn bodyless_methods_survive_untouched() {
        let mut b = ProgramBuilder::new();
        let itf = b.add_type("IRun", TypeFlags::INTERFACE);
        b.add_method(itf, "run", MethodFlags::empty(), vec![], Some(Ty::I32), None);
        let p = b.finish();
        let out = Rewriter::rewrite(&p).unwrap();
        assert!(out.types[0].methods[0].body.is_none());
        assert_eq!(out.types[0].methods[0].ret, Some(Ty::I32));
    }

    #[test]
    fn entry_point_is_carried_over() {
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let mut main = Asm::new();
        main.op(Op::Ret);
        let id = b.add_method(app, "main", MethodFlags::STATIC, vec![], None, Some(main.finish()));
        b.set_entry(id);
        let p = b.finish();
        let out = Rewriter::rewrite(&p).unwrap();
        assert_eq!(out.entry, Some(id));
    }
}
