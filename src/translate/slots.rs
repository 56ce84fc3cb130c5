//! Stack-slot type inference
//!
//! A forward dataflow pass over a method body that computes, for every
//! reachable offset, the types of the operand-stack slots just before the
//! instruction there executes. The rewriter uses the result to decide
//! where checkpoints may go and how to box, save, and re-materialize
//! each slot.

use super::errors::Error;
use crate::image::{MethodBody, Op, Program, RegionKind, Ty};
use std::collections::VecDeque;

/// Inferred type of one operand-stack slot
///
/// `boxed` is true when the slot holds a heap reference, either a
/// reference-typed value or a value type that went through `Box`. Unboxed
/// slots must be boxed before they can be pushed on the save stack.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SlotType {
    pub ty: Ty,
    pub boxed: bool,
}

impl SlotType {
    pub fn of(ty: &Ty) -> SlotType {
        SlotType { boxed: ty.is_reference(), ty: ty.clone() }
    }
}

/// `None` marks a slot holding the null literal; its type is decided by
/// whatever it merges with.
pub type Slot = Option<SlotType>;

fn slot_of(ty: &Ty) -> Slot {
    Some(SlotType::of(ty))
}

/// Join two slots flowing into the same offset.
///
/// In order: a null placeholder yields the other side; equal slots yield
/// themselves; two unboxed integrals merge to unboxed `I32` (width <= 32)
/// or `I64` (width 64); classes merge to their nearest common superclass,
/// then to their most specific common interface; everything else becomes
/// boxed `Object`.
pub fn merge(program: &Program, a: &Slot, b: &Slot) -> Slot {
    match (a, b) {
        (None, other) | (other, None) => other.clone(),
        (Some(x), Some(y)) if x == y => Some(x.clone()),
        (Some(x), Some(y)) => Some(merge_types(program, x, y)),
    }
}

fn merge_types(program: &Program, x: &SlotType, y: &SlotType) -> SlotType {
    if !x.boxed && !y.boxed {
        if x.ty.is_small_integral() && y.ty.is_small_integral() {
            return SlotType { ty: Ty::I32, boxed: false };
        }
        if x.ty.is_wide_integral() && y.ty.is_wide_integral() {
            return SlotType { ty: Ty::I64, boxed: false };
        }
    }
    if let (Ty::Class(cx), Ty::Class(cy)) = (&x.ty, &y.ty) {
        let ax = program.ancestry(*cx);
        let ay = program.ancestry(*cy);
        // The universal root is not a TypeId, so the chains only meet at
        // a genuine common superclass.
        if let Some(sup) = ax.iter().find(|t| ay.contains(t)) {
            return SlotType { ty: Ty::Class(*sup), boxed: true };
        }
        let ix = program.all_interfaces(*cx);
        let iy = program.all_interfaces(*cy);
        let mut common: Vec<_> = ix.iter().filter(|t| iy.contains(t)).copied().collect();
        // Most specific first: an interface assignable to another is the
        // narrower of the two. Ties break on id for determinism.
        common.sort_by(|a, b| {
            let a_below_b = program.is_assignable(&Ty::Class(*a), &Ty::Class(*b));
            let b_below_a = program.is_assignable(&Ty::Class(*b), &Ty::Class(*a));
            b_below_a.cmp(&a_below_b).then(a.cmp(b))
        });
        if let Some(itf) = common.first() {
            return SlotType { ty: Ty::Class(*itf), boxed: true };
        }
    }
    SlotType { ty: Ty::Object, boxed: true }
}

/// Per-offset stack types for one method body
pub struct SlotMap {
    stacks: Vec<Option<Vec<Slot>>>,
}

impl SlotMap {
    /// Run the worklist fixpoint. `args` are the callee-view argument
    /// types (receiver included for instance methods).
    pub fn analyze(program: &Program, args: &[Ty], body: &MethodBody) -> Result<SlotMap, Error> {
        let len = body.code.len();
        let mut stacks: Vec<Option<Vec<Slot>>> = vec![None; len];
        let mut work: VecDeque<u32> = VecDeque::new();

        let seed = |stacks: &mut Vec<Option<Vec<Slot>>>,
                    work: &mut VecDeque<u32>,
                    offset: u32,
                    stack: Vec<Slot>| {
            if (offset as usize) < len && stacks[offset as usize].is_none() {
                stacks[offset as usize] = Some(stack);
                work.push_back(offset);
            }
        };

        seed(&mut stacks, &mut work, 0, vec![]);
        for region in &body.regions {
            seed(&mut stacks, &mut work, region.try_start, vec![]);
            let handler_stack = match &region.kind {
                RegionKind::Catch(ty) => vec![slot_of(ty)],
                RegionKind::Filter => vec![slot_of(&Ty::Object)],
                RegionKind::Finally | RegionKind::Fault => vec![],
            };
            seed(&mut stacks, &mut work, region.handler_start, handler_stack);
            if matches!(region.kind, RegionKind::Finally) {
                // Continuation past a finally starts on an empty stack
                seed(&mut stacks, &mut work, region.handler_end, vec![]);
            }
        }

        while let Some(offset) = work.pop_front() {
            let insn = &body.code[offset as usize];
            let mut stack = stacks[offset as usize]
                .clone()
                .unwrap_or_default();
            transfer(program, args, body, offset, &insn.op, &mut stack)?;
            for succ in insn.successors() {
                if succ as usize >= len {
                    continue;
                }
                // Leaving a protected region abandons the operand stack
                let out = if matches!(insn.op, Op::Leave(_)) { vec![] } else { stack.clone() };
                match &mut stacks[succ as usize] {
                    slot @ None => {
                        *slot = Some(out);
                        work.push_back(succ);
                    }
                    Some(existing) => {
                        if existing.len() != out.len() {
                            return Err(Error::JoinMismatch {
                                offset: succ,
                                left: existing.len(),
                                right: out.len(),
                            });
                        }
                        let mut changed = false;
                        for (old, new) in existing.iter_mut().zip(out.iter()) {
                            let joined = merge(program, old, new);
                            if joined != *old {
                                *old = joined;
                                changed = true;
                            }
                        }
                        if changed {
                            work.push_back(succ);
                        }
                    }
                }
            }
        }

        Ok(SlotMap { stacks })
    }

    /// Stack just before the instruction at `offset`; `None` when the
    /// offset is unreachable.
    pub fn at(&self, offset: u32) -> Option<&[Slot]> {
        self.stacks
            .get(offset as usize)
            .and_then(|s| s.as_deref())
    }

    /// A dirty stack (any unmanaged-pointer slot) disqualifies the offset
    /// as a checkpoint.
    pub fn is_dirty(&self, offset: u32) -> bool {
        match self.at(offset) {
            Some(stack) => stack
                .iter()
                .any(|s| matches!(s, Some(SlotType { ty: Ty::Ptr, .. }))),
            None => false,
        }
    }
}

fn transfer(
    program: &Program,
    args: &[Ty],
    body: &MethodBody,
    offset: u32,
    op: &Op,
    stack: &mut Vec<Slot>,
) -> Result<(), Error> {
    let pop = |stack: &mut Vec<Slot>| -> Result<Slot, Error> {
        stack.pop().ok_or(Error::StackUnderflow { offset })
    };
    let local_ty = |index: u16| -> Result<&Ty, Error> {
        body.locals
            .get(index as usize)
            .ok_or(Error::BadSlot { offset, index })
    };
    let arg_ty = |index: u16| -> Result<&Ty, Error> {
        args.get(index as usize).ok_or(Error::BadSlot { offset, index })
    };

    match op {
        Op::ConstI32(_) => stack.push(slot_of(&Ty::I32)),
        Op::ConstI64(_) => stack.push(slot_of(&Ty::I64)),
        Op::ConstF32(_) => stack.push(slot_of(&Ty::F32)),
        Op::ConstF64(_) => stack.push(slot_of(&Ty::F64)),
        Op::ConstStr(_) => stack.push(slot_of(&Ty::Str)),
        Op::ConstBool(_) => stack.push(slot_of(&Ty::Bool)),
        Op::ConstNull => stack.push(None),

        Op::LoadLocal(i) => stack.push(slot_of(local_ty(*i)?)),
        Op::StoreLocal(i) => {
            local_ty(*i)?;
            pop(stack)?;
        }
        Op::LoadArg(i) => stack.push(slot_of(arg_ty(*i)?)),
        Op::StoreArg(i) => {
            arg_ty(*i)?;
            pop(stack)?;
        }
        Op::LoadLocalRef(i) => {
            local_ty(*i)?;
            stack.push(slot_of(&Ty::Ptr));
        }

        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::Rem
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Shl
        | Op::Shr => {
            pop(stack)?;
            let a = pop(stack)?;
            stack.push(a);
        }
        Op::Neg | Op::Not => {
            let a = pop(stack)?;
            stack.push(a);
        }
        Op::Conv(ty) => {
            pop(stack)?;
            stack.push(slot_of(ty));
        }

        Op::CmpEq | Op::CmpGt | Op::CmpLt => {
            pop(stack)?;
            pop(stack)?;
            stack.push(slot_of(&Ty::I32));
        }

        Op::Br(_) | Op::Nop => {}
        Op::BrTrue(_) | Op::BrFalse(_) | Op::Switch(_) => {
            pop(stack)?;
        }

        Op::Call(id) | Op::CallVirt(id) => {
            let def = program.method_def(*id)?;
            let nargs = def.arg_types(id.owner).len();
            for _ in 0..nargs {
                pop(stack)?;
            }
            if let Some(ret) = &def.ret {
                stack.push(slot_of(ret));
            }
        }
        Op::NewObj(id) => {
            let def = program.method_def(*id)?;
            for _ in 0..def.params.len() {
                pop(stack)?;
            }
            stack.push(slot_of(&Ty::Class(id.owner)));
        }

        Op::Ret | Op::Leave(_) | Op::EndFinally => {}
        Op::Throw => {
            pop(stack)?;
        }

        Op::GetField(id) => {
            pop(stack)?;
            let ty = field_ty(program, *id, offset)?;
            stack.push(slot_of(&ty));
        }
        Op::SetField(_) => {
            pop(stack)?;
            pop(stack)?;
        }
        Op::GetStatic(id) => {
            let ty = field_ty(program, *id, offset)?;
            stack.push(slot_of(&ty));
        }
        Op::SetStatic(_) => {
            pop(stack)?;
        }

        Op::NewArr(elem) => {
            pop(stack)?;
            stack.push(slot_of(&Ty::Array(Box::new(elem.clone()))));
        }
        Op::LoadElem => {
            pop(stack)?; // index
            match pop(stack)? {
                Some(SlotType { ty: Ty::Array(elem), .. }) => stack.push(slot_of(&elem)),
                None => stack.push(slot_of(&Ty::Object)),
                _ => return Err(Error::StackShape { offset, expected: "array" }),
            }
        }
        Op::StoreElem => {
            pop(stack)?;
            pop(stack)?;
            pop(stack)?;
        }
        Op::ArrayLen => {
            pop(stack)?;
            stack.push(slot_of(&Ty::I32));
        }

        Op::Box(ty) => {
            pop(stack)?;
            stack.push(Some(SlotType { ty: ty.clone(), boxed: true }));
        }
        Op::Unbox(ty) => {
            pop(stack)?;
            stack.push(Some(SlotType { ty: ty.clone(), boxed: false }));
        }
        Op::CastClass(ty) | Op::IsInst(ty) => {
            pop(stack)?;
            stack.push(Some(SlotType { ty: ty.clone(), boxed: true }));
        }

        Op::Dup => {
            let a = pop(stack)?;
            stack.push(a.clone());
            stack.push(a);
        }
        Op::Pop | Op::Print => {
            pop(stack)?;
        }

        Op::Mobile(m) => {
            use crate::image::MobileOp::*;
            match m {
                IsRestoring | IsUnwinding | UnwindPending => stack.push(slot_of(&Ty::I32)),
                Lock | Unlock => {}
                Save | RequestMigration => {
                    pop(stack)?;
                }
                Restore => stack.push(Some(SlotType { ty: Ty::Object, boxed: true })),
            }
        }
    }
    Ok(())
}

fn field_ty(program: &Program, id: crate::image::FieldId, offset: u32) -> Result<Ty, Error> {
    let def = program.type_def(id.owner)?;
    def.fields
        .get(id.index as usize)
        .map(|f| f.ty.clone())
        .ok_or(Error::BadSlot { offset, index: id.index as u16 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Asm, MethodFlags, ProgramBuilder, TypeFlags, TypeId};

    fn empty_program() -> Program {
        Program { types: vec![], entry: None }
    }

    fn i32_slot() -> Slot {
        slot_of(&Ty::I32)
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let p = empty_program();
        let a = slot_of(&Ty::I8);
        let b = slot_of(&Ty::U16);
        assert_eq!(merge(&p, &a, &b), merge(&p, &b, &a));
        assert_eq!(merge(&p, &a, &a), a);
        let j = merge(&p, &a, &b);
        assert_eq!(merge(&p, &j, &a), j);
    }

    #[test]
    fn small_integrals_merge_to_i32() {
        let p = empty_program();
        assert_eq!(merge(&p, &slot_of(&Ty::I8), &i32_slot()), i32_slot());
        assert_eq!(merge(&p, &slot_of(&Ty::Bool), &slot_of(&Ty::U16)), i32_slot());
    }

    #[test]
    fn wide_integrals_merge_to_i64() {
        let p = empty_program();
        assert_eq!(merge(&p, &slot_of(&Ty::U64), &slot_of(&Ty::I64)), slot_of(&Ty::I64));
    }

    #[test]
    fn null_placeholder_yields_other_side() {
        let p = empty_program();
        assert_eq!(merge(&p, &None, &slot_of(&Ty::Str)), slot_of(&Ty::Str));
        assert_eq!(merge(&p, &slot_of(&Ty::Str), &None), slot_of(&Ty::Str));
        assert_eq!(merge(&p, &None, &None), None);
    }

    #[test]
    fn classes_merge_to_common_superclass() {
        let mut b = ProgramBuilder::new();
        let base = b.add_type("Base", TypeFlags::empty());
        let left = b.add_type("Left", TypeFlags::empty());
        let right = b.add_type("Right", TypeFlags::empty());
        b.set_super(left, base);
        b.set_super(right, base);
        let p = b.finish();
        assert_eq!(
            merge(&p, &slot_of(&Ty::Class(left)), &slot_of(&Ty::Class(right))),
            slot_of(&Ty::Class(base)),
        );
    }

    #[test]
    fn unrelated_classes_merge_through_common_interface() {
        let mut b = ProgramBuilder::new();
        let itf = b.add_type("ICommon", TypeFlags::INTERFACE);
        let left = b.add_type("Left", TypeFlags::empty());
        let right = b.add_type("Right", TypeFlags::empty());
        b.add_interface(left, itf);
        b.add_interface(right, itf);
        let p = b.finish();
        assert_eq!(
            merge(&p, &slot_of(&Ty::Class(left)), &slot_of(&Ty::Class(right))),
            Some(SlotType { ty: Ty::Class(itf), boxed: true }),
        );
    }

    #[test]
    fn incompatible_slots_merge_to_object() {
        let p = empty_program();
        assert_eq!(
            merge(&p, &slot_of(&Ty::Str), &i32_slot()),
            Some(SlotType { ty: Ty::Object, boxed: true }),
        );
    }

    #[test]
    fn fixpoint_converges_on_a_loop() {
        // i8 seeded on one edge, i32 on the back edge: Scenario from the
        // merge table, the loop-head slot settles on i32.
        let mut asm = Asm::new();
        let head = asm.label();
        let done = asm.label();
        let local = asm.local(Ty::I32);
        asm.op(Op::ConstI32(0));
        asm.op(Op::Conv(Ty::I8));
        asm.place(head);
        asm.op(Op::Dup);
        asm.br_false(done);
        asm.op(Op::Conv(Ty::I32));
        asm.br(head);
        asm.place(done);
        asm.op(Op::StoreLocal(local));
        asm.op(Op::Ret);
        let body = asm.finish();
        let p = empty_program();
        let map = SlotMap::analyze(&p, &[], &body).unwrap();
        assert_eq!(map.at(2), Some(&[i32_slot()][..]));
    }

    #[test]
    fn pointer_slot_marks_stack_dirty() {
        let mut asm = Asm::new();
        let local = asm.local(Ty::I32);
        asm.op(Op::LoadLocalRef(local));
        asm.op(Op::Pop);
        asm.op(Op::Ret);
        let body = asm.finish();
        let p = empty_program();
        let map = SlotMap::analyze(&p, &[], &body).unwrap();
        assert!(!map.is_dirty(0));
        assert!(map.is_dirty(1));
        assert!(!map.is_dirty(2));
    }

    #[test]
    fn handler_entries_are_seeded() {
        let mut b = ProgramBuilder::new();
        let exn = b.add_type("Error", TypeFlags::empty());
        b.add_method(exn, "new", MethodFlags::CTOR, vec![], None, None);
        let p = b.finish();

        let mut asm = Asm::new();
        let (ts, te, hs, he) = (asm.label(), asm.label(), asm.label(), asm.label());
        let out = asm.label();
        asm.place(ts);
        asm.op(Op::Nop);
        asm.leave(out);
        asm.place(te);
        asm.place(hs);
        asm.op(Op::Pop);
        asm.leave(out);
        asm.place(he);
        asm.place(out);
        asm.op(Op::Ret);
        asm.region(crate::image::RegionKind::Catch(Ty::Class(exn)), ts, te, hs, he);
        let body = asm.finish();

        let map = SlotMap::analyze(&p, &[], &body).unwrap();
        assert_eq!(map.at(2), Some(&[slot_of(&Ty::Class(exn))][..]));
        assert_eq!(map.at(4), Some(&[][..]));
    }

    #[test]
    fn depth_mismatch_at_join_is_an_error() {
        let mut asm = Asm::new();
        let merge_pt = asm.label();
        asm.op(Op::ConstI32(1));
        asm.br_true(merge_pt);
        asm.op(Op::ConstI32(2));
        asm.place(merge_pt);
        asm.op(Op::Ret);
        let body = asm.finish();
        let p = empty_program();
        assert!(matches!(
            SlotMap::analyze(&p, &[], &body),
            Err(Error::JoinMismatch { .. })
        ));
    }

    #[test]
    fn underflow_is_an_error() {
        let mut asm = Asm::new();
        asm.op(Op::Pop);
        asm.op(Op::Ret);
        let body = asm.finish();
        let p = empty_program();
        assert!(matches!(
            SlotMap::analyze(&p, &[], &body),
            Err(Error::StackUnderflow { offset: 0 })
        ));
    }

    #[test]
    fn interface_tie_breaks_deterministically() {
        // Both classes implement both interfaces; neither interface is
        // below the other, so the lower id wins every time.
        let mut b = ProgramBuilder::new();
        let ia = b.add_type("IA", TypeFlags::INTERFACE);
        let ib = b.add_type("IB", TypeFlags::INTERFACE);
        let left = b.add_type("Left", TypeFlags::empty());
        let right = b.add_type("Right", TypeFlags::empty());
        for c in [left, right] {
            b.add_interface(c, ia);
            b.add_interface(c, ib);
        }
        let p = b.finish();
        let merged = merge(&p, &slot_of(&Ty::Class(left)), &slot_of(&Ty::Class(right)));
        assert_eq!(merged, Some(SlotType { ty: Ty::Class(TypeId(0)), boxed: true }));
    }
}
