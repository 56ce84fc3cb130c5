use super::{FieldId, MethodId, Ty};
use serde::{Deserialize, Serialize};

/// One bytecode instruction at a fixed offset
///
/// Instructions are immutable once read; rewriting a method produces new
/// instructions rather than mutating these in place. Offsets equal the
/// instruction's index in the method body, so "next" is always `offset + 1`
/// and branch operands are instruction offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub op: Op,
}

/// How an instruction leaves control
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlowControl {
    /// Falls through to the next instruction
    Next,
    /// Unconditional transfer to the branch target
    Branch,
    /// Transfer to the branch target(s) or fall through
    CondBranch,
    /// Invokes a method, then falls through
    Call,
    /// Leaves the method (also `EndFinally`, which leaves the handler)
    Return,
    /// Raises an exception
    Throw,
}

/// Intrinsics the rewriter plants to drive the mobile runtime
///
/// These are the only instructions that touch the executing thread's mobile
/// context. Application code uses just `RequestMigration`; the rest are
/// emitted by the mobile/atomic transforms.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum MobileOp {
    /// Push 1 if this invocation is re-entering saved state, else 0
    IsRestoring,
    /// Push 1 if a migration target is set and frames are being saved
    IsUnwinding,
    /// Push 1 if a migration target is set, no state is saved yet, and the
    /// context's lock depth is zero
    UnwindPending,
    /// Increment the migration-exclusion counter
    Lock,
    /// Decrement the migration-exclusion counter
    Unlock,
    /// Pop a value off the operand stack and push it on the save stack
    Save,
    /// Pop a value off the save stack and push it on the operand stack
    Restore,
    /// Pop a target address (string) and request migration there
    RequestMigration,
}

/// Instruction set of the image's virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    // Constants
    ConstI32(i32),
    ConstI64(i64),
    ConstF32(f32),
    ConstF64(f64),
    ConstStr(String),
    ConstBool(bool),
    ConstNull,

    // Locals and arguments (argument 0 is the receiver for instance methods)
    LoadLocal(u16),
    StoreLocal(u16),
    LoadArg(u16),
    StoreArg(u16),
    /// Address of a local; pushes an unmanaged pointer (dirties the stack)
    LoadLocalRef(u16),

    // Arithmetic and bitwise (operate on two matching numeric operands)
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Not,
    /// Numeric conversion to the given (numeric) type
    Conv(Ty),

    // Comparisons: pop two, push an `I32` of 0 or 1
    CmpEq,
    CmpGt,
    CmpLt,

    // Control flow
    Br(u32),
    BrTrue(u32),
    BrFalse(u32),
    Switch(Vec<u32>),
    Call(MethodId),
    CallVirt(MethodId),
    NewObj(MethodId),
    Ret,
    Throw,
    /// Exit a protected region (running intervening finally handlers)
    Leave(u32),
    /// End a finally or fault handler
    EndFinally,

    // Fields
    GetField(FieldId),
    SetField(FieldId),
    GetStatic(FieldId),
    SetStatic(FieldId),

    // Arrays
    NewArr(Ty),
    LoadElem,
    StoreElem,
    ArrayLen,

    // Objects
    Box(Ty),
    Unbox(Ty),
    CastClass(Ty),
    IsInst(Ty),

    // Stack
    Dup,
    Pop,
    Nop,

    /// Write the top of stack to the console (observable side effect)
    Print,

    /// Mobile-runtime intrinsic
    Mobile(MobileOp),
}

impl Op {
    pub fn flow(&self) -> FlowControl {
        match self {
            Op::Br(_) | Op::Leave(_) => FlowControl::Branch,
            Op::BrTrue(_) | Op::BrFalse(_) | Op::Switch(_) => FlowControl::CondBranch,
            Op::Call(_) | Op::CallVirt(_) | Op::NewObj(_) => FlowControl::Call,
            Op::Ret | Op::EndFinally => FlowControl::Return,
            Op::Throw => FlowControl::Throw,
            _ => FlowControl::Next,
        }
    }

    /// Primary branch target, if this is a single-target branch
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Op::Br(t) | Op::BrTrue(t) | Op::BrFalse(t) | Op::Leave(t) => Some(*t),
            _ => None,
        }
    }

    /// Callee of a call-kind instruction
    pub fn call_target(&self) -> Option<MethodId> {
        match self {
            Op::Call(m) | Op::CallVirt(m) | Op::NewObj(m) => Some(*m),
            _ => None,
        }
    }
}

impl Instruction {
    /// Offsets execution may reach directly after this instruction
    ///
    /// Handler entries are not successors of anything; the analysis seeds
    /// them independently.
    pub fn successors(&self) -> Vec<u32> {
        match self.op.flow() {
            FlowControl::Next | FlowControl::Call => vec![self.offset + 1],
            FlowControl::Branch => vec![self.op.branch_target().unwrap_or(self.offset + 1)],
            FlowControl::CondBranch => match &self.op {
                Op::Switch(targets) => {
                    let mut next: Vec<u32> = targets.clone();
                    next.push(self.offset + 1);
                    next
                }
                op => vec![
                    op.branch_target().unwrap_or(self.offset + 1),
                    self.offset + 1,
                ],
            },
            FlowControl::Return | FlowControl::Throw => vec![],
        }
    }
}

/// Kind of an exception handler
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum RegionKind {
    Catch(Ty),
    Filter,
    Finally,
    Fault,
}

/// A protected region and its handler
///
/// Ranges are half-open offset intervals. Regions may nest but never
/// partially overlap; well-formed input is assumed, with inner regions
/// listed before outer ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

impl ExceptionRegion {
    pub fn try_contains(&self, offset: u32) -> bool {
        self.try_start <= offset && offset < self.try_end
    }

    pub fn handler_contains(&self, offset: u32) -> bool {
        self.handler_start <= offset && offset < self.handler_end
    }
}
