//! The self-checkpointing method transform
//!
//! A rewritten method gains, per protected block (with the method body
//! itself as the outermost block):
//!
//! - numbered restore points at every eligible checkpoint: protected-block
//!   entry, `Ret`, backward branches, calls, and the instruction after a
//!   call, all gated on a clean operand stack outside any handler;
//! - an unwind epilogue that pushes the block's live state onto the
//!   context's save stack and exits; inner blocks push the id of their
//!   entry point in the enclosing block, so unwinding composes;
//! - a restore dispatch that pops a point id, re-materializes the saved
//!   slots, and jumps back to the point.
//!
//! Calls are spilled through scratch locals so the whole call, arguments
//! included, can replay on restore; after every instrumented call the
//! caller checks whether the callee unwound underneath it and, if so,
//! saves its own frame and keeps unwinding. Handlers run under the
//! context lock and are never checkpointed.

use super::emit::{CodeEmitter, Label, LabelMap};
use super::errors::Error;
use super::locals::LocalCache;
use super::slots::{Slot, SlotMap, SlotType};
use crate::image::{MethodBody, MethodId, MobileOp, Op, Program, Ty};

struct RestorePoint {
    stack: Vec<Slot>,
    point: Label,
}

/// One protected block currently being rewritten. `scope` is the original
/// try range; `None` marks the method-level frame.
struct Frame {
    unwind: Label,
    restore: Label,
    points: Vec<RestorePoint>,
    entry_id: Option<u32>,
    scope: Option<(u32, u32)>,
}

/// A jump out of a protected block, re-routed through a landing stub in
/// the destination block so pending unwinds are noticed on the way out.
struct PendingStub {
    frame_depth: usize,
    stub: Label,
    /// `None`: fall straight into the destination's unwind epilogue
    target: Option<u32>,
}

struct OpenBlock {
    region: usize,
    framed: bool,
}

pub fn rewrite_mobile(program: &Program, id: MethodId) -> Result<MethodBody, Error> {
    let method = program.method_def(id)?;
    let body = method.body.as_ref().ok_or(Error::NoBody(id))?;
    let args = method.arg_types(id.owner);
    let slots = SlotMap::analyze(program, &args, body)?;

    let orig_locals = body.locals.clone();
    let mut e = CodeEmitter::new();
    let labels = LabelMap::new(&mut e, body.code.len());
    let mut cache = LocalCache::new(body.locals.clone());

    let method_restore = e.fresh_label();
    let method_unwind = e.fresh_label();
    let mut frames = vec![Frame {
        unwind: method_unwind,
        restore: method_restore,
        points: vec![],
        entry_id: None,
        scope: None,
    }];
    let mut stubs: Vec<PendingStub> = vec![];
    let mut blocks: Vec<OpenBlock> = vec![];
    let mut handler_depth = 0usize;
    let mut prev_was_call = false;

    e.emit(Op::Mobile(MobileOp::IsRestoring));
    e.br_true(method_restore);

    for insn in &body.code {
        let off = insn.offset;

        // Close handlers ending here (innermost listed first)
        for (ri, region) in body.regions.iter().enumerate() {
            if region.handler_end == off {
                if let Some(pos) = blocks.iter().rposition(|b| b.region == ri) {
                    blocks.remove(pos);
                }
                e.end_region()?;
                handler_depth -= 1;
                flush_stubs(&mut e, &frames, &mut stubs, &labels)?;
            }
        }

        // Handlers starting here: first close the block's frame (restore
        // dispatch + unwind epilogue live at the tail of the try), then
        // open the handler under the context lock
        for (ri, region) in body.regions.iter().enumerate() {
            if region.handler_start == off {
                let framed = blocks.iter().any(|b| b.region == ri && b.framed);
                if framed {
                    let frame = frames.pop().ok_or(Error::RegionState("frame underflow"))?;
                    e.place_label(frame.restore)?;
                    emit_dispatch_tail(&mut e, &frame.points)?;
                    e.place_label(frame.unwind)?;
                    let entry_id = frame
                        .entry_id
                        .ok_or(Error::RegionState("block frame without an entry id"))?;
                    e.emit(Op::ConstI32(entry_id as i32));
                    e.emit(Op::Mobile(MobileOp::Save));
                    let stub = e.fresh_label();
                    stubs.push(PendingStub { frame_depth: frames.len() - 1, stub, target: None });
                    e.leave(stub);
                }
                e.begin_handler(region.kind.clone())?;
                e.emit(Op::Mobile(MobileOp::Lock));
                handler_depth += 1;
            }
        }

        // Tries opening here, outermost first
        for (ri, region) in body.regions.iter().enumerate().rev() {
            if region.try_start == off {
                let framed = handler_depth == 0;
                if framed {
                    // The block-entry restore point sits just before the
                    // try opens; re-entering it descends into the block
                    let point = e.fresh_label();
                    e.place_label(point)?;
                    let outer = frames.last_mut().ok_or(Error::RegionState("no frame"))?;
                    outer.points.push(RestorePoint { stack: vec![], point });
                    let entry_id = (outer.points.len() - 1) as u32;
                    e.begin_try();
                    let unwind = e.fresh_label();
                    let restore = e.fresh_label();
                    frames.push(Frame {
                        unwind,
                        restore,
                        points: vec![],
                        entry_id: Some(entry_id),
                        scope: Some((region.try_start, region.try_end)),
                    });
                    e.emit(Op::Mobile(MobileOp::IsRestoring));
                    e.br_true(restore);
                } else {
                    e.begin_try();
                }
                blocks.push(OpenBlock { region: ri, framed });
            }
        }

        e.place_label(labels.get(off))?;

        let stack = slots.at(off);
        let clean = stack.is_some() && !slots.is_dirty(off);
        let was_call = std::mem::take(&mut prev_was_call);
        let backward = match &insn.op {
            Op::Br(t) | Op::BrTrue(t) | Op::BrFalse(t) | Op::Leave(t) => *t <= off,
            Op::Switch(targets) => targets.iter().any(|&t| t <= off),
            _ => false,
        };

        if handler_depth == 0
            && clean
            && (was_call || backward || matches!(insn.op, Op::Ret))
        {
            let stack = stack.unwrap_or_default().to_vec();
            let frame = frames.last_mut().ok_or(Error::RegionState("no frame"))?;
            let point = e.fresh_label();
            frame.points.push(RestorePoint { stack: stack.clone(), point });
            let pid = (frame.points.len() - 1) as i32;
            e.emit(Op::Mobile(MobileOp::UnwindPending));
            e.br_false(point);
            save_eval_stack(&mut e, &stack);
            e.emit(Op::ConstI32(pid));
            e.emit(Op::Mobile(MobileOp::Save));
            e.br(frame.unwind);
            e.place_label(point)?;
        }

        // Handlers balance their entry lock on every way out
        if handler_depth > 0 && matches!(insn.op, Op::Leave(_) | Op::EndFinally) {
            e.emit(Op::Mobile(MobileOp::Unlock));
        }

        match &insn.op {
            Op::Call(_) | Op::CallVirt(_) if handler_depth == 0 && clean => {
                let stack = stack.unwrap_or_default();
                let frame = frames.last_mut().ok_or(Error::RegionState("no frame"))?;
                emit_call_site(&mut e, &mut cache, program, frame, &insn.op, stack)?;
                prev_was_call = true;
            }
            Op::Br(t) => e.br(labels.get(*t)),
            Op::BrTrue(t) => e.br_true(labels.get(*t)),
            Op::BrFalse(t) => e.br_false(labels.get(*t)),
            Op::Switch(targets) => {
                let arms: Vec<Label> = targets.iter().map(|t| labels.get(*t)).collect();
                e.switch(&arms);
            }
            Op::Leave(t) => {
                let dest = frames
                    .iter()
                    .rposition(|f| match f.scope {
                        None => true,
                        Some((lo, hi)) => lo <= *t && *t < hi,
                    })
                    .unwrap_or(0);
                if dest == frames.len() - 1 {
                    e.leave(labels.get(*t));
                } else {
                    let stub = e.fresh_label();
                    stubs.push(PendingStub { frame_depth: dest, stub, target: Some(*t) });
                    e.leave(stub);
                }
            }
            op => {
                e.emit(op.clone());
                if matches!(op, Op::Call(_) | Op::CallVirt(_) | Op::NewObj(_)) {
                    prev_was_call = true;
                }
            }
        }
    }

    // Handlers running to the end of the code close here
    for (ri, region) in body.regions.iter().enumerate() {
        if region.handler_end as usize == body.code.len() {
            if let Some(pos) = blocks.iter().rposition(|b| b.region == ri) {
                blocks.remove(pos);
            }
            e.end_region()?;
            handler_depth -= 1;
            flush_stubs(&mut e, &frames, &mut stubs, &labels)?;
        }
    }

    if handler_depth != 0 {
        return Err(Error::RegionState("handler left open"));
    }
    flush_stubs(&mut e, &frames, &mut stubs, &labels)?;
    if !stubs.is_empty() {
        return Err(Error::RegionState("leave stub left unplaced"));
    }

    // Method-level restore: locals, then arguments, then the dispatch
    e.place_label(method_restore)?;
    for (i, ty) in orig_locals.iter().enumerate().rev() {
        e.emit(Op::Mobile(MobileOp::Restore));
        emit_narrow(&mut e, ty);
        e.emit(Op::StoreLocal(i as u16));
    }
    for (i, ty) in args.iter().enumerate().rev() {
        e.emit(Op::Mobile(MobileOp::Restore));
        emit_narrow(&mut e, ty);
        e.emit(Op::StoreArg(i as u16));
    }
    let method_frame = frames.pop().ok_or(Error::RegionState("no frame"))?;
    emit_dispatch_tail(&mut e, &method_frame.points)?;

    // Method-level unwind: arguments, then locals, then a placeholder
    // return so callers regain control
    e.place_label(method_unwind)?;
    for (i, ty) in args.iter().enumerate() {
        e.emit(Op::LoadArg(i as u16));
        if ty.is_value_type() {
            e.emit(Op::Box(ty.clone()));
        }
        e.emit(Op::Mobile(MobileOp::Save));
    }
    for (i, ty) in orig_locals.iter().enumerate() {
        e.emit(Op::LoadLocal(i as u16));
        if ty.is_value_type() {
            e.emit(Op::Box(ty.clone()));
        }
        e.emit(Op::Mobile(MobileOp::Save));
    }
    if let Some(ret) = &method.ret {
        emit_default(&mut e, ret);
    }
    e.emit(Op::Ret);

    let (code, regions) = e.finish()?;
    Ok(MethodBody { locals: cache.into_locals(), code, regions })
}

/// Save the operand stack top-first. Unboxed slots are boxed on the way
/// so everything on the save stack is uniformly portable.
fn save_eval_stack(e: &mut CodeEmitter, stack: &[Slot]) {
    for slot in stack.iter().rev() {
        if let Some(SlotType { ty, boxed: false }) = slot {
            e.emit(Op::Box(ty.clone()));
        }
        e.emit(Op::Mobile(MobileOp::Save));
    }
}

/// Inverse of [`save_eval_stack`]: pops rebuild the stack bottom-first.
fn restore_eval_stack(e: &mut CodeEmitter, stack: &[Slot]) {
    for slot in stack.iter() {
        e.emit(Op::Mobile(MobileOp::Restore));
        match slot {
            Some(SlotType { ty, boxed: false }) => e.emit(Op::Unbox(ty.clone())),
            Some(SlotType { ty, boxed: true }) if *ty != Ty::Object && ty.is_reference() => {
                e.emit(Op::CastClass(ty.clone()));
            }
            _ => {}
        }
    }
}

fn emit_narrow(e: &mut CodeEmitter, ty: &Ty) {
    if ty.is_value_type() {
        e.emit(Op::Unbox(ty.clone()));
    } else if *ty != Ty::Object {
        e.emit(Op::CastClass(ty.clone()));
    }
}

fn emit_default(e: &mut CodeEmitter, ty: &Ty) {
    let op = match ty {
        Ty::Bool => Op::ConstBool(false),
        Ty::I64 | Ty::U64 => Op::ConstI64(0),
        Ty::F32 => Op::ConstF32(0.0),
        Ty::F64 => Op::ConstF64(0.0),
        t if t.is_small_integral() => Op::ConstI32(0),
        _ => Op::ConstNull,
    };
    e.emit(op);
}

/// Pop a point id off the save stack and fan out to its restore arm.
fn emit_dispatch_tail(e: &mut CodeEmitter, points: &[RestorePoint]) -> Result<(), Error> {
    e.emit(Op::Mobile(MobileOp::Restore));
    let arms: Vec<Label> = points.iter().map(|_| e.fresh_label()).collect();
    e.switch(&arms);
    e.emit(Op::ConstStr("corrupt resume id".to_owned()));
    e.emit(Op::Throw);
    for (arm, point) in arms.iter().zip(points) {
        e.place_label(*arm)?;
        restore_eval_stack(e, &point.stack);
        e.br(point.point);
    }
    Ok(())
}

fn flush_stubs(
    e: &mut CodeEmitter,
    frames: &[Frame],
    stubs: &mut Vec<PendingStub>,
    labels: &LabelMap,
) -> Result<(), Error> {
    let depth = frames.len() - 1;
    let mut i = 0;
    while i < stubs.len() {
        if stubs[i].frame_depth != depth {
            i += 1;
            continue;
        }
        let stub = stubs.swap_remove(i);
        e.place_label(stub.stub)?;
        match stub.target {
            None => e.br(frames[depth].unwind),
            Some(t) => {
                e.emit(Op::Mobile(MobileOp::IsUnwinding));
                e.br_true(frames[depth].unwind);
                e.br(labels.get(t));
            }
        }
    }
    Ok(())
}

/// Spill, reload, call, and watch for the callee unwinding underneath.
/// The restore point sits before the spill so a restore replays the call
/// itself, re-entering the callee so it can restore its own frame.
fn emit_call_site(
    e: &mut CodeEmitter,
    cache: &mut LocalCache,
    program: &Program,
    frame: &mut Frame,
    call: &Op,
    stack: &[Slot],
) -> Result<(), Error> {
    let callee_id = match call.call_target() {
        Some(id) => id,
        None => return Err(Error::RegionState("call site without a callee")),
    };
    let callee = program.method_def(callee_id)?;
    let arg_tys = callee.arg_types(callee_id.owner);
    let n = arg_tys.len();

    let point = e.fresh_label();
    e.place_label(point)?;
    frame.points.push(RestorePoint { stack: stack.to_vec(), point });
    let pid = (frame.points.len() - 1) as i32;

    // tmps[k] holds the k-th slot from the top
    let mut tmps = Vec::with_capacity(n);
    for k in 0..n {
        let ty = &arg_tys[n - 1 - k];
        let tmp = cache.borrow(ty);
        e.emit(Op::StoreLocal(tmp));
        tmps.push(tmp);
    }
    for &tmp in tmps.iter().rev() {
        e.emit(Op::LoadLocal(tmp));
    }
    e.emit(call.clone());

    let cont = e.fresh_label();
    e.emit(Op::Mobile(MobileOp::IsUnwinding));
    e.br_false(cont);
    if callee.ret.is_some() {
        // Discard the callee's placeholder result
        e.emit(Op::Pop);
    }
    for (k, &tmp) in tmps.iter().enumerate() {
        let ty = &arg_tys[n - 1 - k];
        e.emit(Op::LoadLocal(tmp));
        if ty.is_value_type() {
            e.emit(Op::Box(ty.clone()));
        }
        e.emit(Op::Mobile(MobileOp::Save));
    }
    save_eval_stack(e, &stack[..stack.len() - n]);
    e.emit(Op::ConstI32(pid));
    e.emit(Op::Mobile(MobileOp::Save));
    e.br(frame.unwind);
    e.place_label(cont)?;

    for tmp in tmps {
        cache.release(tmp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Asm, MethodFlags, ProgramBuilder, TypeFlags};

    fn one_method(asm: Asm, params: Vec<Ty>, ret: Option<Ty>) -> (Program, MethodId) {
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(app, "m", MethodFlags::STATIC, params, ret, Some(asm.finish()));
        (b.finish(), id)
    }

    fn count_ops(body: &MethodBody, pred: impl Fn(&Op) -> bool) -> usize {
        body.code.iter().filter(|i| pred(&i.op)).count()
    }

    #[test]
    fn straight_line_method_gains_entry_check_and_ret_point() {
        let mut asm = Asm::new();
        asm.op(Op::ConstI32(7));
        asm.op(Op::Ret);
        let (p, id) = one_method(asm, vec![], Some(Ty::I32));
        let body = rewrite_mobile(&p, id).unwrap();
        assert!(matches!(body.code[0].op, Op::Mobile(MobileOp::IsRestoring)));
        // One checkpoint (at Ret) polls for a pending unwind
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 1);
        // Placeholder return on the unwind path plus the original
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Ret)), 2);
    }

    #[test]
    fn backward_branch_gets_a_checkpoint() {
        let mut asm = Asm::new();
        let i = asm.local(Ty::I32);
        let head = asm.label();
        let out = asm.label();
        asm.place(head);
        asm.op(Op::LoadLocal(i));
        asm.br_false(out);
        asm.op(Op::LoadLocal(i));
        asm.op(Op::ConstI32(1));
        asm.op(Op::Sub);
        asm.op(Op::StoreLocal(i));
        asm.br(head);
        asm.place(out);
        asm.op(Op::Ret);
        let (p, id) = one_method(asm, vec![], None);
        let body = rewrite_mobile(&p, id).unwrap();
        // One for the back edge, one for Ret
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 2);
    }

    #[test]
    fn call_sites_spill_and_watch_for_unwinding() {
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let mut callee = Asm::new();
        callee.op(Op::LoadArg(0));
        callee.op(Op::Ret);
        let callee_id = b.add_method(
            app,
            "callee",
            MethodFlags::STATIC,
            vec![Ty::I32],
            Some(Ty::I32),
            Some(callee.finish()),
        );
        let mut caller = Asm::new();
        caller.op(Op::ConstI32(3));
        caller.op(Op::Call(callee_id));
        caller.op(Op::Ret);
        let caller_id = b.add_method(
            app,
            "caller",
            MethodFlags::STATIC,
            vec![],
            Some(Ty::I32),
            Some(caller.finish()),
        );
        let p = b.finish();
        let body = rewrite_mobile(&p, caller_id).unwrap();
        // Spill local for the argument was appended to the table
        assert!(body.locals.len() > 0);
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::IsUnwinding))), 1);
        // The only polling checkpoint is the after-call one at Ret; the
        // call itself restores by replay, not by polling
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 1);
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Call(_))), 1);
    }

    #[test]
    fn handlers_are_locked_and_never_checkpointed() {
        let mut asm = Asm::new();
        let (ts, te, hs, he) = (asm.label(), asm.label(), asm.label(), asm.label());
        let out = asm.label();
        asm.place(ts);
        asm.op(Op::Nop);
        asm.leave(out);
        asm.place(te);
        asm.place(hs);
        asm.op(Op::EndFinally);
        asm.place(he);
        asm.place(out);
        asm.op(Op::Ret);
        asm.region(crate::image::RegionKind::Finally, ts, te, hs, he);
        let (p, id) = one_method(asm, vec![], None);
        let body = rewrite_mobile(&p, id).unwrap();
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::Lock))), 1);
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::Unlock))), 1);
        // The finally body itself polls nothing; the only checkpoint is Ret
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 1);
        // The rewritten body still carries exactly one finally region
        assert_eq!(body.regions.len(), 1);
        assert_eq!(body.regions[0].kind, crate::image::RegionKind::Finally);
    }

    #[test]
    fn dirty_stack_suppresses_checkpoints() {
        let mut asm = Asm::new();
        let local = asm.local(Ty::I32);
        let head = asm.label();
        asm.op(Op::LoadLocalRef(local));
        asm.place(head);
        asm.op(Op::Dup);
        asm.br_false(head);
        asm.op(Op::Pop);
        asm.op(Op::Ret);
        let (p, id) = one_method(asm, vec![], None);
        let body = rewrite_mobile(&p, id).unwrap();
        // The backward branch sits on a Ptr-bearing stack: only the final
        // Ret (clean stack) checkpoints
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 1);
    }

    #[test]
    fn backward_switch_arm_gets_a_checkpoint() {
        let mut asm = Asm::new();
        let i = asm.local(Ty::I32);
        let head = asm.label();
        asm.place(head);
        asm.op(Op::LoadLocal(i));
        asm.switch(&[head]);
        asm.op(Op::Ret);
        let (p, id) = one_method(asm, vec![], None);
        let body = rewrite_mobile(&p, id).unwrap();
        // One for the back edge closing the loop, one for Ret
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 2);
    }

    #[test]
    fn handler_ending_the_method_still_closes() {
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
        asm.region(crate::image::RegionKind::Finally, ts, te, hs, he);
        let (p, id) = one_method(asm, vec![], None);
        // The finally handler is the last instruction of the method
        let body = rewrite_mobile(&p, id).unwrap();
        assert_eq!(body.regions.len(), 1);
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::Unlock))), 1);
        // Checkpoints: the backward leave out of the try, and Ret
        assert_eq!(count_ops(&body, |op| matches!(op, Op::Mobile(MobileOp::UnwindPending))), 2);
    }
}
