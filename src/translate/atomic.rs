//! The atomic method transform
//!
//! Atomic methods (constructors, and anything carrying the `ATOMIC`
//! flag) never checkpoint. Instead the whole body runs with the context
//! lock held, so no migration can observe the method half-executed: the
//! lock is taken on entry, the body is wrapped in a fresh try/finally
//! whose handler releases it, and every `Ret` is redirected through a
//! single exit past the region.

use super::emit::{CodeEmitter, Label, LabelMap};
use super::errors::Error;
use crate::image::{MethodBody, MethodId, MobileOp, Op, Program, RegionKind};

pub fn rewrite_atomic(program: &Program, id: MethodId) -> Result<MethodBody, Error> {
    let method = program.method_def(id)?;
    let body = method.body.as_ref().ok_or(Error::NoBody(id))?;

    let mut locals = body.locals.clone();
    let ret_tmp = method.ret.as_ref().map(|ty| {
        locals.push(ty.clone());
        (locals.len() - 1) as u16
    });

    let mut e = CodeEmitter::new();
    let labels = LabelMap::new(&mut e, body.code.len());
    let exit = e.fresh_label();

    e.emit(Op::Mobile(MobileOp::Lock));
    e.begin_try();

    for insn in &body.code {
        let off = insn.offset;
        for region in &body.regions {
            if region.handler_end == off {
                e.end_region()?;
            }
        }
        for region in &body.regions {
            if region.handler_start == off {
                e.begin_handler(region.kind.clone())?;
            }
        }
        for region in body.regions.iter().rev() {
            if region.try_start == off {
                e.begin_try();
            }
        }
        e.place_label(labels.get(off))?;
        match &insn.op {
            Op::Ret => {
                if let Some(tmp) = ret_tmp {
                    e.emit(Op::StoreLocal(tmp));
                }
                e.leave(exit);
            }
            Op::Br(t) => e.br(labels.get(*t)),
            Op::BrTrue(t) => e.br_true(labels.get(*t)),
            Op::BrFalse(t) => e.br_false(labels.get(*t)),
            Op::Switch(targets) => {
                let arms: Vec<Label> = targets.iter().map(|t| labels.get(*t)).collect();
                e.switch(&arms);
            }
            Op::Leave(t) => e.leave(labels.get(*t)),
            op => e.emit(op.clone()),
        }
    }

    for region in &body.regions {
        if region.handler_end as usize == body.code.len() {
            e.end_region()?;
        }
    }

    e.begin_handler(RegionKind::Finally)?;
    e.emit(Op::Mobile(MobileOp::Unlock));
    e.emit(Op::EndFinally);
    e.end_region()?;

    e.place_label(exit)?;
    if let Some(tmp) = ret_tmp {
        e.emit(Op::LoadLocal(tmp));
    }
    e.emit(Op::Ret);

    let (code, regions) = e.finish()?;
    Ok(MethodBody { locals, code, regions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Asm, MethodFlags, ProgramBuilder, Ty, TypeFlags};

    #[test]
    fn body_runs_under_the_lock_with_one_exit() {
        let mut asm = Asm::new();
        let skip = asm.label();
        asm.op(Op::ConstI32(1));
        asm.br_true(skip);
        asm.op(Op::ConstI32(2));
        asm.op(Op::Ret);
        asm.place(skip);
        asm.op(Op::ConstI32(3));
        asm.op(Op::Ret);

        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(
            app,
            "m",
            MethodFlags::STATIC | MethodFlags::ATOMIC,
            vec![],
            Some(Ty::I32),
            Some(asm.finish()),
        );
        let p = b.finish();

        let body = rewrite_atomic(&p, id).unwrap();
        assert!(matches!(body.code[0].op, Op::Mobile(MobileOp::Lock)));
        // Both original Rets are redirected; only the shared exit returns
        let rets: Vec<_> = body
            .code
            .iter()
            .filter(|i| matches!(i.op, Op::Ret))
            .collect();
        assert_eq!(rets.len(), 1);
        assert_eq!(body.regions.len(), 1);
        assert_eq!(body.regions[0].kind, RegionKind::Finally);
        // The unlock lives in the finally handler
        let unlock_at = body
            .code
            .iter()
            .position(|i| matches!(i.op, Op::Mobile(MobileOp::Unlock)))
            .unwrap() as u32;
        assert!(body.regions[0].handler_contains(unlock_at));
        // The exit sits past the region, so the finally runs before it
        assert!(body.regions[0].handler_end <= body.code.last().unwrap().offset);
    }

    #[test]
    fn trailing_handler_still_gets_wrapped() {
        let mut asm = Asm::new();
        let (ts, te, hs, he) = (asm.label(), asm.label(), asm.label(), asm.label());
        let body_at = asm.label();
        let done = asm.label();
        asm.br(body_at);
        asm.place(done);
        asm.op(Op::Ret);
        asm.place(body_at);
        asm.place(ts);
        asm.op(Op::Nop);
        asm.leave(done);
        asm.place(te);
        asm.place(hs);
        asm.op(Op::EndFinally);
        asm.place(he);
        asm.region(RegionKind::Finally, ts, te, hs, he);

        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(
            app,
            "m",
            MethodFlags::STATIC | MethodFlags::ATOMIC,
            vec![],
            None,
            Some(asm.finish()),
        );
        let p = b.finish();

        // The original finally is the last instruction; it closes before
        // the lock-releasing wrapper does
        let body = rewrite_atomic(&p, id).unwrap();
        assert_eq!(body.regions.len(), 2);
        assert_eq!(
            body.code
                .iter()
                .filter(|i| matches!(i.op, Op::Mobile(MobileOp::Unlock)))
                .count(),
            1
        );
    }
}
