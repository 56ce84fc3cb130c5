//! The execution engine
//!
//! A straightforward recursive interpreter over [`Value`]s: one Rust
//! frame per image method, an operand stack and local/argument slots per
//! frame, structured exception handling driven by the region table, and
//! native dispatch of the `Mobile` intrinsics against a [`CtxHandle`].
//! Rewritten images run on exactly the same engine as plain ones; all
//! checkpoint behavior lives in the instruction stream.

use super::collection::CtxHandle;
use super::value::{ArrData, Instance, Value};
use crate::image::{
    FieldId, ImageError, MethodBody, MethodDef, MethodId, MobileOp, Op, Program, RegionKind, Ty,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum Fault {
    /// An application value raised by `Throw` (or a runtime condition
    /// surfaced as one, like division by zero)
    Thrown(Value),
    /// A symbol the image references but does not define
    Missing(String),
    /// The interpreter met a value of the wrong shape
    Type(String),
    Unsupported(&'static str),
    Image(ImageError),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Fault::Thrown(v) => write!(f, "uncaught exception: {}", v),
            Fault::Missing(what) => write!(f, "missing member: {}", what),
            Fault::Type(what) => write!(f, "type confusion: {}", what),
            Fault::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            Fault::Image(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Fault {}

impl From<ImageError> for Fault {
    fn from(err: ImageError) -> Fault {
        Fault::Image(err)
    }
}

/// Where `Print` output goes; tests capture it
pub enum Console {
    Stdout,
    Capture(Mutex<Vec<String>>),
}

pub struct Engine {
    program: Arc<Program>,
    statics: Mutex<HashMap<FieldId, Value>>,
    console: Console,
}

/// What one instruction did to control flow
enum Step {
    Next,
    Jump(u32),
    Return(Option<Value>),
    Leave(u32),
    EndFinally,
}

/// Work left to do once a finally or fault handler finishes
enum Cont {
    /// A `Leave` still has these finallies (by region index) to run
    /// before landing on its target
    Goto { target: u32, finallies: Vec<usize> },
    /// An exception thrown at `at` resumes its handler search from
    /// region `next_region`
    Rethrow { value: Value, at: u32, next_region: usize },
}

impl Engine {
    pub fn new(program: Arc<Program>) -> Engine {
        Engine {
            program,
            statics: Mutex::new(HashMap::new()),
            console: Console::Stdout,
        }
    }

    pub fn with_capture(program: Arc<Program>) -> Engine {
        Engine {
            program,
            statics: Mutex::new(HashMap::new()),
            console: Console::Capture(Mutex::new(vec![])),
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn captured(&self) -> Vec<String> {
        match &self.console {
            Console::Stdout => vec![],
            Console::Capture(lines) => lines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    fn print(&self, line: String) {
        match &self.console {
            Console::Stdout => println!("{}", line),
            Console::Capture(lines) => lines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(line),
        }
    }

    /// (Re)play the context's entry invocation on the calling thread.
    pub fn run_invocation(&self, ctx: &CtxHandle) -> Result<Option<Value>, Fault> {
        let entry = ctx.entry();
        let mut args = Vec::with_capacity(entry.args.len() + 1);
        if let Some(receiver) = entry.receiver {
            args.push(receiver);
        }
        args.extend(entry.args);
        self.call_method(ctx, entry.method, args)
    }

    pub fn call_method(
        &self,
        ctx: &CtxHandle,
        id: MethodId,
        mut args: Vec<Value>,
    ) -> Result<Option<Value>, Fault> {
        let method = self.program.method_def(id)?;
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| Fault::Missing(format!("body of {}", method.name)))?;
        let mut locals: Vec<Value> = body.locals.iter().map(Value::default_for).collect();
        let mut stack: Vec<Value> = vec![];
        let mut conts: Vec<Cont> = vec![];
        let mut pc: u32 = 0;

        loop {
            let insn = body
                .code
                .get(pc as usize)
                .ok_or_else(|| Fault::Type(format!("pc {} out of range", pc)))?;
            let step = self.exec(ctx, method, &insn.op, &mut stack, &mut locals, &mut args);
            match step {
                Ok(Step::Next) => pc += 1,
                Ok(Step::Jump(t)) => pc = t,
                Ok(Step::Return(v)) => return Ok(v),
                Ok(Step::Leave(target)) => {
                    // Finallies covering here but not the target run first
                    let finallies: Vec<usize> = body
                        .regions
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| {
                            matches!(r.kind, RegionKind::Finally)
                                && r.try_contains(pc)
                                && !r.try_contains(target)
                        })
                        .map(|(i, _)| i)
                        .collect();
                    stack.clear();
                    match finallies.split_first() {
                        None => pc = target,
                        Some((first, rest)) => {
                            conts.push(Cont::Goto { target, finallies: rest.to_vec() });
                            pc = body.regions[*first].handler_start;
                        }
                    }
                }
                Ok(Step::EndFinally) => match conts.pop() {
                    Some(Cont::Goto { target, finallies }) => match finallies.split_first() {
                        None => pc = target,
                        Some((first, rest)) => {
                            conts.push(Cont::Goto { target, finallies: rest.to_vec() });
                            pc = body.regions[*first].handler_start;
                        }
                    },
                    Some(Cont::Rethrow { value, at, next_region }) => {
                        pc = self.route_exception(body, at, next_region, value, &mut stack, &mut conts)?;
                    }
                    None => return Err(Fault::Type("endfinally without continuation".into())),
                },
                Err(Fault::Thrown(value)) => {
                    pc = self.route_exception(body, pc, 0, value, &mut stack, &mut conts)?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Find the handler for `value` thrown at `at`, starting the search
    /// at region `start`. Finally and fault handlers on the way run
    /// before the search continues. An unhandled value propagates.
    fn route_exception(
        &self,
        body: &MethodBody,
        at: u32,
        start: usize,
        value: Value,
        stack: &mut Vec<Value>,
        conts: &mut Vec<Cont>,
    ) -> Result<u32, Fault> {
        for (ri, region) in body.regions.iter().enumerate().skip(start) {
            if !region.try_contains(at) {
                continue;
            }
            match &region.kind {
                RegionKind::Catch(ty) => {
                    if self.value_isa(&value, ty) {
                        stack.clear();
                        stack.push(value);
                        return Ok(region.handler_start);
                    }
                }
                RegionKind::Filter => {
                    stack.clear();
                    stack.push(value);
                    return Ok(region.handler_start);
                }
                RegionKind::Finally | RegionKind::Fault => {
                    conts.push(Cont::Rethrow { value, at, next_region: ri + 1 });
                    stack.clear();
                    return Ok(region.handler_start);
                }
            }
        }
        Err(Fault::Thrown(value))
    }

    fn value_isa(&self, value: &Value, ty: &Ty) -> bool {
        match dynamic_ty(value) {
            None => ty.is_reference(),
            Some(dynamic) => self.program.is_assignable(&dynamic, ty),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec(
        &self,
        ctx: &CtxHandle,
        method: &MethodDef,
        op: &Op,
        stack: &mut Vec<Value>,
        locals: &mut Vec<Value>,
        args: &mut Vec<Value>,
    ) -> Result<Step, Fault> {
        match op {
            Op::ConstI32(n) => stack.push(Value::I32(*n)),
            Op::ConstI64(n) => stack.push(Value::I64(*n)),
            Op::ConstF32(n) => stack.push(Value::F32(*n)),
            Op::ConstF64(n) => stack.push(Value::F64(*n)),
            Op::ConstStr(s) => stack.push(Value::Str(s.clone())),
            Op::ConstBool(b) => stack.push(Value::Bool(*b)),
            Op::ConstNull => stack.push(Value::Null),

            Op::LoadLocal(i) => stack.push(slot(locals, *i)?.clone()),
            Op::StoreLocal(i) => {
                let v = pop(stack)?;
                *slot(locals, *i)? = v;
            }
            Op::LoadArg(i) => stack.push(slot(args, *i)?.clone()),
            Op::StoreArg(i) => {
                let v = pop(stack)?;
                *slot(args, *i)? = v;
            }
            Op::LoadLocalRef(_) => {
                return Err(Fault::Unsupported("local references are analysis-only"))
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::And | Op::Or | Op::Xor
            | Op::Shl | Op::Shr => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(binop(op, a, b)?);
            }
            Op::Neg => {
                let v = match num(&pop(stack)?)? {
                    Num::I32(n) => Value::I32(n.wrapping_neg()),
                    Num::I64(n) => Value::I64(n.wrapping_neg()),
                    Num::F32(n) => Value::F32(-n),
                    Num::F64(n) => Value::F64(-n),
                };
                stack.push(v);
            }
            Op::Not => {
                let v = match pop(stack)? {
                    Value::Bool(b) => Value::Bool(!b),
                    other => match num(&other)? {
                        Num::I32(n) => Value::I32(!n),
                        Num::I64(n) => Value::I64(!n),
                        _ => return Err(Fault::Type("bitwise not on a float".into())),
                    },
                };
                stack.push(v);
            }
            Op::Conv(ty) => {
                let v = pop(stack)?;
                stack.push(convert(&v, ty)?);
            }

            Op::CmpEq => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(Value::I32(values_equal(&a, &b)? as i32));
            }
            Op::CmpGt | Op::CmpLt => {
                let b = num(&pop(stack)?)?;
                let a = num(&pop(stack)?)?;
                let (a, b) = promote(a, b);
                let gt = matches!(op, Op::CmpGt);
                let result = match (a, b) {
                    (Num::I32(x), Num::I32(y)) => if gt { x > y } else { x < y },
                    (Num::I64(x), Num::I64(y)) => if gt { x > y } else { x < y },
                    (Num::F32(x), Num::F32(y)) => if gt { x > y } else { x < y },
                    (Num::F64(x), Num::F64(y)) => if gt { x > y } else { x < y },
                    _ => unreachable!(),
                };
                stack.push(Value::I32(result as i32));
            }

            Op::Br(t) => return Ok(Step::Jump(*t)),
            Op::BrTrue(t) => {
                if pop(stack)?.is_truthy() {
                    return Ok(Step::Jump(*t));
                }
            }
            Op::BrFalse(t) => {
                if !pop(stack)?.is_truthy() {
                    return Ok(Step::Jump(*t));
                }
            }
            Op::Switch(targets) => {
                let v = as_i32(&pop(stack)?)?;
                if v >= 0 && (v as usize) < targets.len() {
                    return Ok(Step::Jump(targets[v as usize]));
                }
            }

            Op::Call(id) => {
                let ret = self.invoke(ctx, *id, stack, false)?;
                if let Some(v) = ret {
                    stack.push(v);
                }
            }
            Op::CallVirt(id) => {
                let ret = self.invoke(ctx, *id, stack, true)?;
                if let Some(v) = ret {
                    stack.push(v);
                }
            }
            Op::NewObj(id) => {
                let ctor = self.program.method_def(*id)?;
                let split = stack
                    .len()
                    .checked_sub(ctor.params.len())
                    .ok_or_else(|| Fault::Type("constructor argument underflow".into()))?;
                let params = stack.split_off(split);
                let receiver = self.allocate(id.owner)?;
                let mut call_args = Vec::with_capacity(params.len() + 1);
                call_args.push(receiver.clone());
                call_args.extend(params);
                self.call_method(ctx, *id, call_args)?;
                stack.push(receiver);
            }
            Op::Ret => {
                let v = if method.ret.is_some() { Some(pop(stack)?) } else { None };
                return Ok(Step::Return(v));
            }
            Op::Throw => {
                let v = pop(stack)?;
                return Err(Fault::Thrown(v));
            }
            Op::Leave(t) => return Ok(Step::Leave(*t)),
            Op::EndFinally => return Ok(Step::EndFinally),

            Op::GetField(id) => {
                let obj = pop(stack)?;
                let v = match obj {
                    Value::Obj(obj) => {
                        let inner = obj.lock().unwrap_or_else(|e| e.into_inner());
                        match inner.fields.get(id) {
                            Some(v) => v.clone(),
                            None => Value::default_for(&self.field_def(*id)?.ty),
                        }
                    }
                    Value::Null => return Err(Fault::Thrown(Value::Str("null reference".into()))),
                    other => return Err(Fault::Type(format!("field load from {}", other))),
                };
                stack.push(v);
            }
            Op::SetField(id) => {
                let v = pop(stack)?;
                match pop(stack)? {
                    Value::Obj(obj) => {
                        obj.lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .fields
                            .insert(*id, v);
                    }
                    Value::Null => return Err(Fault::Thrown(Value::Str("null reference".into()))),
                    other => return Err(Fault::Type(format!("field store to {}", other))),
                }
            }
            Op::GetStatic(id) => {
                let statics = self.statics.lock().unwrap_or_else(|e| e.into_inner());
                let v = match statics.get(id) {
                    Some(v) => v.clone(),
                    None => Value::default_for(&self.field_def(*id)?.ty),
                };
                stack.push(v);
            }
            Op::SetStatic(id) => {
                let v = pop(stack)?;
                self.statics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(*id, v);
            }

            Op::NewArr(elem) => {
                let len = as_i32(&pop(stack)?)?;
                if len < 0 {
                    return Err(Fault::Thrown(Value::Str("negative array length".into())));
                }
                let items = (0..len).map(|_| Value::default_for(elem)).collect();
                stack.push(Value::Arr(Arc::new(Mutex::new(ArrData {
                    elem: elem.clone(),
                    items,
                }))));
            }
            Op::LoadElem => {
                let idx = as_i32(&pop(stack)?)?;
                let arr = expect_arr(pop(stack)?)?;
                let inner = arr.lock().unwrap_or_else(|e| e.into_inner());
                let v = inner
                    .items
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| Fault::Thrown(Value::Str("index out of range".into())))?;
                drop(inner);
                stack.push(v);
            }
            Op::StoreElem => {
                let v = pop(stack)?;
                let idx = as_i32(&pop(stack)?)?;
                let arr = expect_arr(pop(stack)?)?;
                let mut inner = arr.lock().unwrap_or_else(|e| e.into_inner());
                match inner.items.get_mut(idx as usize) {
                    Some(elem) => *elem = v,
                    None => return Err(Fault::Thrown(Value::Str("index out of range".into()))),
                }
            }
            Op::ArrayLen => {
                let arr = expect_arr(pop(stack)?)?;
                let len = arr.lock().unwrap_or_else(|e| e.into_inner()).items.len();
                stack.push(Value::I32(len as i32));
            }

            // Values are dynamically typed here; boxing is identity and
            // unboxing is a checked numeric narrowing
            Op::Box(_) => {}
            Op::Unbox(ty) => {
                let v = pop(stack)?;
                let v = match (&v, ty) {
                    (Value::Null, _) => {
                        return Err(Fault::Thrown(Value::Str("null unbox".into())))
                    }
                    (Value::Str(_), Ty::Str) | (Value::Bool(_), Ty::Bool) => v,
                    _ if ty.is_numeric() => convert(&v, ty)?,
                    _ => return Err(Fault::Type(format!("unbox {} to {}", v, ty))),
                };
                stack.push(v);
            }
            Op::CastClass(ty) => {
                let v = pop(stack)?;
                if matches!(v, Value::Null) || self.value_isa(&v, ty) {
                    stack.push(v);
                } else {
                    return Err(Fault::Thrown(Value::Str("invalid cast".into())));
                }
            }
            Op::IsInst(ty) => {
                let v = pop(stack)?;
                if !matches!(v, Value::Null) && self.value_isa(&v, ty) {
                    stack.push(v);
                } else {
                    stack.push(Value::Null);
                }
            }

            Op::Dup => {
                let v = pop(stack)?;
                stack.push(v.clone());
                stack.push(v);
            }
            Op::Pop => {
                pop(stack)?;
            }
            Op::Nop => {}
            Op::Print => {
                let v = pop(stack)?;
                self.print(v.to_string());
            }

            Op::Mobile(m) => match m {
                MobileOp::IsRestoring => stack.push(Value::I32(ctx.is_restoring() as i32)),
                MobileOp::IsUnwinding => stack.push(Value::I32(ctx.is_unwinding() as i32)),
                MobileOp::UnwindPending => stack.push(Value::I32(ctx.unwind_pending() as i32)),
                MobileOp::Lock => ctx.coll.lock_ctx(ctx.id),
                MobileOp::Unlock => ctx.coll.unlock_ctx(ctx.id),
                MobileOp::Save => {
                    let v = pop(stack)?;
                    ctx.coll.push_saved(ctx.id, v);
                }
                MobileOp::Restore => {
                    let v = ctx
                        .coll
                        .pop_saved(ctx.id)
                        .ok_or_else(|| Fault::Type("restore from an empty save stack".into()))?;
                    stack.push(v);
                }
                MobileOp::RequestMigration => {
                    let target = match pop(stack)? {
                        Value::Str(s) => s,
                        other => return Err(Fault::Type(format!("migration target {}", other))),
                    };
                    ctx.coll.request_migration(&target);
                }
            },
        }
        Ok(Step::Next)
    }

    fn invoke(
        &self,
        ctx: &CtxHandle,
        id: MethodId,
        stack: &mut Vec<Value>,
        virtual_dispatch: bool,
    ) -> Result<Option<Value>, Fault> {
        let declared = self.program.method_def(id)?;
        let nargs = declared.arg_types(id.owner).len();
        let split = stack
            .len()
            .checked_sub(nargs)
            .ok_or_else(|| Fault::Type("call argument underflow".into()))?;
        let call_args = stack.split_off(split);
        let target = if virtual_dispatch {
            match call_args.first() {
                Some(Value::Obj(obj)) => {
                    let dynamic = obj.lock().unwrap_or_else(|e| e.into_inner()).ty;
                    self.resolve_virtual(dynamic, &declared.name).unwrap_or(id)
                }
                Some(Value::Null) | None => {
                    return Err(Fault::Thrown(Value::Str("null reference".into())))
                }
                _ => id,
            }
        } else {
            id
        };
        self.call_method(ctx, target, call_args)
    }

    /// Walk the dynamic type's superclass chain for the first concrete
    /// override by name.
    fn resolve_virtual(&self, dynamic: crate::image::TypeId, name: &str) -> Option<MethodId> {
        for ty in self.program.ancestry(dynamic) {
            if let Some(id) = self.program.method_by_name(ty, name) {
                if let Ok(def) = self.program.method_def(id) {
                    if def.body.is_some() {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    fn allocate(&self, ty: crate::image::TypeId) -> Result<Value, Fault> {
        let mut fields = HashMap::new();
        for t in self.program.ancestry(ty) {
            let def = self.program.type_def(t)?;
            for (fi, field) in def.fields.iter().enumerate() {
                if !field.is_static {
                    fields.insert(
                        FieldId { owner: t, index: fi as u32 },
                        Value::default_for(&field.ty),
                    );
                }
            }
        }
        Ok(Value::Obj(Arc::new(Mutex::new(Instance { ty, fields }))))
    }

    fn field_def(&self, id: FieldId) -> Result<&crate::image::FieldDef, Fault> {
        self.program
            .type_def(id.owner)?
            .fields
            .get(id.index as usize)
            .ok_or_else(|| Fault::Missing(format!("field {}.{}", id.owner.0, id.index)))
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, Fault> {
    stack
        .pop()
        .ok_or_else(|| Fault::Type("operand stack underflow".into()))
}

fn slot<'a>(values: &'a mut [Value], index: u16) -> Result<&'a mut Value, Fault> {
    let len = values.len();
    values
        .get_mut(index as usize)
        .ok_or_else(|| Fault::Type(format!("slot {} out of range ({})", index, len)))
}

fn dynamic_ty(value: &Value) -> Option<Ty> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(_) => Ty::Bool,
        Value::I8(_) => Ty::I8,
        Value::U8(_) => Ty::U8,
        Value::I16(_) => Ty::I16,
        Value::U16(_) => Ty::U16,
        Value::I32(_) => Ty::I32,
        Value::U32(_) => Ty::U32,
        Value::I64(_) => Ty::I64,
        Value::U64(_) => Ty::U64,
        Value::F32(_) => Ty::F32,
        Value::F64(_) => Ty::F64,
        Value::Str(_) => Ty::Str,
        Value::Obj(obj) => Ty::Class(obj.lock().unwrap_or_else(|e| e.into_inner()).ty),
        Value::Arr(arr) => {
            Ty::Array(Box::new(arr.lock().unwrap_or_else(|e| e.into_inner()).elem.clone()))
        }
    })
}

enum Num {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

fn num(value: &Value) -> Result<Num, Fault> {
    Ok(match value {
        Value::Bool(b) => Num::I32(*b as i32),
        Value::I8(n) => Num::I32(*n as i32),
        Value::U8(n) => Num::I32(*n as i32),
        Value::I16(n) => Num::I32(*n as i32),
        Value::U16(n) => Num::I32(*n as i32),
        Value::I32(n) => Num::I32(*n),
        Value::U32(n) => Num::I32(*n as i32),
        Value::I64(n) => Num::I64(*n),
        Value::U64(n) => Num::I64(*n as i64),
        Value::F32(n) => Num::F32(*n),
        Value::F64(n) => Num::F64(*n),
        other => return Err(Fault::Type(format!("{} is not numeric", other))),
    })
}

fn as_i32(value: &Value) -> Result<i32, Fault> {
    match num(value)? {
        Num::I32(n) => Ok(n),
        Num::I64(n) => Ok(n as i32),
        _ => Err(Fault::Type(format!("{} is not an integer", value))),
    }
}

fn promote(a: Num, b: Num) -> (Num, Num) {
    fn rank(n: &Num) -> u8 {
        match n {
            Num::I32(_) => 0,
            Num::I64(_) => 1,
            Num::F32(_) => 2,
            Num::F64(_) => 3,
        }
    }
    fn widen(n: Num, to: u8) -> Num {
        match (n, to) {
            (Num::I32(v), 1) => Num::I64(v as i64),
            (Num::I32(v), 2) => Num::F32(v as f32),
            (Num::I32(v), 3) => Num::F64(v as f64),
            (Num::I64(v), 2) => Num::F32(v as f32),
            (Num::I64(v), 3) => Num::F64(v as f64),
            (Num::F32(v), 3) => Num::F64(v as f64),
            (n, _) => n,
        }
    }
    let to = rank(&a).max(rank(&b));
    (widen(a, to), widen(b, to))
}

fn binop(op: &Op, a: Value, b: Value) -> Result<Value, Fault> {
    let (a, b) = promote(num(&a)?, num(&b)?);
    let div_by_zero = || Fault::Thrown(Value::Str("divide by zero".into()));
    Ok(match (op, a, b) {
        (Op::Add, Num::I32(x), Num::I32(y)) => Value::I32(x.wrapping_add(y)),
        (Op::Add, Num::I64(x), Num::I64(y)) => Value::I64(x.wrapping_add(y)),
        (Op::Add, Num::F32(x), Num::F32(y)) => Value::F32(x + y),
        (Op::Add, Num::F64(x), Num::F64(y)) => Value::F64(x + y),
        (Op::Sub, Num::I32(x), Num::I32(y)) => Value::I32(x.wrapping_sub(y)),
        (Op::Sub, Num::I64(x), Num::I64(y)) => Value::I64(x.wrapping_sub(y)),
        (Op::Sub, Num::F32(x), Num::F32(y)) => Value::F32(x - y),
        (Op::Sub, Num::F64(x), Num::F64(y)) => Value::F64(x - y),
        (Op::Mul, Num::I32(x), Num::I32(y)) => Value::I32(x.wrapping_mul(y)),
        (Op::Mul, Num::I64(x), Num::I64(y)) => Value::I64(x.wrapping_mul(y)),
        (Op::Mul, Num::F32(x), Num::F32(y)) => Value::F32(x * y),
        (Op::Mul, Num::F64(x), Num::F64(y)) => Value::F64(x * y),
        (Op::Div, Num::I32(x), Num::I32(y)) => {
            Value::I32(x.checked_div(y).ok_or_else(div_by_zero)?)
        }
        (Op::Div, Num::I64(x), Num::I64(y)) => {
            Value::I64(x.checked_div(y).ok_or_else(div_by_zero)?)
        }
        (Op::Div, Num::F32(x), Num::F32(y)) => Value::F32(x / y),
        (Op::Div, Num::F64(x), Num::F64(y)) => Value::F64(x / y),
        (Op::Rem, Num::I32(x), Num::I32(y)) => {
            Value::I32(x.checked_rem(y).ok_or_else(div_by_zero)?)
        }
        (Op::Rem, Num::I64(x), Num::I64(y)) => {
            Value::I64(x.checked_rem(y).ok_or_else(div_by_zero)?)
        }
        (Op::Rem, Num::F32(x), Num::F32(y)) => Value::F32(x % y),
        (Op::Rem, Num::F64(x), Num::F64(y)) => Value::F64(x % y),
        (Op::And, Num::I32(x), Num::I32(y)) => Value::I32(x & y),
        (Op::And, Num::I64(x), Num::I64(y)) => Value::I64(x & y),
        (Op::Or, Num::I32(x), Num::I32(y)) => Value::I32(x | y),
        (Op::Or, Num::I64(x), Num::I64(y)) => Value::I64(x | y),
        (Op::Xor, Num::I32(x), Num::I32(y)) => Value::I32(x ^ y),
        (Op::Xor, Num::I64(x), Num::I64(y)) => Value::I64(x ^ y),
        (Op::Shl, Num::I32(x), Num::I32(y)) => Value::I32(x.wrapping_shl(y as u32)),
        (Op::Shl, Num::I64(x), Num::I64(y)) => Value::I64(x.wrapping_shl(y as u32)),
        (Op::Shr, Num::I32(x), Num::I32(y)) => Value::I32(x.wrapping_shr(y as u32)),
        (Op::Shr, Num::I64(x), Num::I64(y)) => Value::I64(x.wrapping_shr(y as u32)),
        (op, _, _) => return Err(Fault::Type(format!("{:?} on non-integral operands", op))),
    })
}

fn convert(value: &Value, ty: &Ty) -> Result<Value, Fault> {
    let n = num(value)?;
    let wide = match n {
        Num::I32(v) => v as f64,
        Num::I64(v) => v as f64,
        Num::F32(v) => v as f64,
        Num::F64(v) => v,
    };
    let int = match n {
        Num::I32(v) => v as i64,
        Num::I64(v) => v,
        Num::F32(v) => v as i64,
        Num::F64(v) => v as i64,
    };
    Ok(match ty {
        Ty::Bool => Value::Bool(int != 0),
        Ty::I8 => Value::I8(int as i8),
        Ty::U8 => Value::U8(int as u8),
        Ty::I16 => Value::I16(int as i16),
        Ty::U16 => Value::U16(int as u16),
        Ty::I32 => Value::I32(int as i32),
        Ty::U32 => Value::U32(int as u32),
        Ty::I64 => Value::I64(int),
        Ty::U64 => Value::U64(int as u64),
        Ty::F32 => Value::F32(wide as f32),
        Ty::F64 => Value::F64(wide),
        other => return Err(Fault::Type(format!("conversion to {}", other))),
    })
}

fn values_equal(a: &Value, b: &Value) -> Result<bool, Fault> {
    if let Some(same) = a.same_ref(b) {
        return Ok(same);
    }
    Ok(match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Obj(_), _) | (_, Value::Obj(_)) | (Value::Arr(_), _) | (_, Value::Arr(_)) => false,
        _ => match promote(num(a)?, num(b)?) {
            (Num::I32(x), Num::I32(y)) => x == y,
            (Num::I64(x), Num::I64(y)) => x == y,
            (Num::F32(x), Num::F32(y)) => x == y,
            (Num::F64(x), Num::F64(y)) => x == y,
            _ => false,
        },
    })
}

fn expect_arr(value: Value) -> Result<super::value::ArrRef, Fault> {
    match value {
        Value::Arr(arr) => Ok(arr),
        Value::Null => Err(Fault::Thrown(Value::Str("null reference".into()))),
        other => Err(Fault::Type(format!("array operation on {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Asm, MethodFlags, ProgramBuilder, TypeFlags};
    use crate::runtime::collection::ContextCollection;
    use crate::runtime::context::{Invocation, MobileContext};

    fn run(program: Program, entry: MethodId) -> (Result<Option<Value>, Fault>, Vec<String>) {
        let engine = Engine::with_capture(Arc::new(program));
        let coll = Arc::new(ContextCollection::new());
        let id = coll.add(MobileContext::new(Invocation {
            method: entry,
            receiver: None,
            args: vec![],
        }));
        let handle = CtxHandle { coll, id };
        let result = engine.run_invocation(&handle);
        (result, engine.captured())
    }

    #[test]
    fn arithmetic_and_branching() {
        // 3 * 4 + 2 == 14, printed and returned
        let mut asm = Asm::new();
        asm.op(Op::ConstI32(3));
        asm.op(Op::ConstI32(4));
        asm.op(Op::Mul);
        asm.op(Op::ConstI32(2));
        asm.op(Op::Add);
        asm.op(Op::Dup);
        asm.op(Op::Print);
        asm.op(Op::Ret);
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(app, "m", MethodFlags::STATIC, vec![], Some(Ty::I32), Some(asm.finish()));
        let (result, output) = run(b.finish(), id);
        assert!(matches!(result, Ok(Some(Value::I32(14)))));
        assert_eq!(output, vec!["14"]);
    }

    #[test]
    fn catch_by_type_and_finally_on_throw() {
        // throw inside try+finally nested in a catch-all; the finally
        // runs before the catch sees the value
        let mut asm = Asm::new();
        let (ts2, te2, hs2, he2) = (asm.label(), asm.label(), asm.label(), asm.label());
        let (ts1, te1, hs1, he1) = (asm.label(), asm.label(), asm.label(), asm.label());
        let out = asm.label();
        asm.place(ts1);
        asm.place(ts2);
        asm.op(Op::ConstStr("boom".into()));
        asm.op(Op::Throw);
        asm.place(te2);
        asm.place(hs2);
        asm.op(Op::ConstStr("finally".into()));
        asm.op(Op::Print);
        asm.op(Op::EndFinally);
        asm.place(he2);
        asm.leave(out);
        asm.place(te1);
        asm.place(hs1);
        asm.op(Op::Print);
        asm.leave(out);
        asm.place(he1);
        asm.place(out);
        asm.op(Op::Ret);
        asm.region(crate::image::RegionKind::Finally, ts2, te2, hs2, he2);
        asm.region(crate::image::RegionKind::Catch(Ty::Str), ts1, te1, hs1, he1);
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(app, "m", MethodFlags::STATIC, vec![], None, Some(asm.finish()));
        let (result, output) = run(b.finish(), id);
        assert!(result.is_ok());
        assert_eq!(output, vec!["finally", "boom"]);
    }

    #[test]
    fn leave_runs_intervening_finallies() {
        let mut asm = Asm::new();
        let (ts, te, hs, he) = (asm.label(), asm.label(), asm.label(), asm.label());
        let out = asm.label();
        asm.place(ts);
        asm.op(Op::ConstStr("body".into()));
        asm.op(Op::Print);
        asm.leave(out);
        asm.place(te);
        asm.place(hs);
        asm.op(Op::ConstStr("finally".into()));
        asm.op(Op::Print);
        asm.op(Op::EndFinally);
        asm.place(he);
        asm.place(out);
        asm.op(Op::Ret);
        asm.region(crate::image::RegionKind::Finally, ts, te, hs, he);
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(app, "m", MethodFlags::STATIC, vec![], None, Some(asm.finish()));
        let (result, output) = run(b.finish(), id);
        assert!(result.is_ok());
        assert_eq!(output, vec!["body", "finally"]);
    }

    #[test]
    fn virtual_dispatch_picks_the_override() {
        let mut b = ProgramBuilder::new();
        let base = b.add_type("Base", TypeFlags::empty());
        let derived = b.add_type("Derived", TypeFlags::empty());
        b.set_super(derived, base);

        let mut base_ctor = Asm::new();
        base_ctor.op(Op::Ret);
        b.add_method(base, "new", MethodFlags::CTOR, vec![], None, Some(base_ctor.finish()));
        let mut base_speak = Asm::new();
        base_speak.op(Op::ConstStr("base".into()));
        base_speak.op(Op::Ret);
        let speak = b.add_method(
            base,
            "speak",
            MethodFlags::empty(),
            vec![],
            Some(Ty::Str),
            Some(base_speak.finish()),
        );

        let mut d_ctor = Asm::new();
        d_ctor.op(Op::Ret);
        let derived_ctor =
            b.add_method(derived, "new", MethodFlags::CTOR, vec![], None, Some(d_ctor.finish()));
        let mut d_speak = Asm::new();
        d_speak.op(Op::ConstStr("derived".into()));
        d_speak.op(Op::Ret);
        b.add_method(
            derived,
            "speak",
            MethodFlags::empty(),
            vec![],
            Some(Ty::Str),
            Some(d_speak.finish()),
        );

        let mut main = Asm::new();
        main.op(Op::NewObj(derived_ctor));
        main.op(Op::CallVirt(speak));
        main.op(Op::Ret);
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(
            app,
            "main",
            MethodFlags::STATIC,
            vec![],
            Some(Ty::Str),
            Some(main.finish()),
        );
        let (result, _) = run(b.finish(), id);
        match result {
            Ok(Some(Value::Str(s))) => assert_eq!(s, "derived"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let mut asm = Asm::new();
        let (ts, te, hs, he) = (asm.label(), asm.label(), asm.label(), asm.label());
        let out = asm.label();
        asm.place(ts);
        asm.op(Op::ConstI32(1));
        asm.op(Op::ConstI32(0));
        asm.op(Op::Div);
        asm.op(Op::Pop);
        asm.leave(out);
        asm.place(te);
        asm.place(hs);
        asm.op(Op::Print);
        asm.leave(out);
        asm.place(he);
        asm.place(out);
        asm.op(Op::Ret);
        asm.region(crate::image::RegionKind::Catch(Ty::Str), ts, te, hs, he);
        let mut b = ProgramBuilder::new();
        let app = b.add_type("App", TypeFlags::empty());
        let id = b.add_method(app, "m", MethodFlags::STATIC, vec![], None, Some(asm.finish()));
        let (result, output) = run(b.finish(), id);
        assert!(result.is_ok());
        assert_eq!(output, vec!["divide by zero"]);
    }
}
