//! Label-based bytecode emission
//!
//! The rewriters never compute offsets by hand. They emit against fresh
//! labels, open and close protected regions as an explicit descriptor
//! stack, and let [`CodeEmitter::finish`] patch every branch operand and
//! materialize the region table once all code is down.

use super::errors::Error;
use crate::image::{ExceptionRegion, Instruction, Op, RegionKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Label(usize);

enum Fixup {
    Branch { at: usize, label: Label },
    SwitchArm { at: usize, arm: usize, label: Label },
}

/// An open protected region; nesting is tracked as data, not emission
/// order, so misuse is a reported error instead of silent corruption.
struct OpenRegion {
    try_start: u32,
    boundary: Option<(RegionKind, u32, u32)>,
}

pub struct CodeEmitter {
    code: Vec<Instruction>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    open: Vec<OpenRegion>,
    closed: Vec<ExceptionRegion>,
}

impl CodeEmitter {
    pub fn new() -> CodeEmitter {
        CodeEmitter {
            code: vec![],
            labels: vec![],
            fixups: vec![],
            open: vec![],
            closed: vec![],
        }
    }

    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn place_label(&mut self, label: Label) -> Result<(), Error> {
        if self.labels[label.0].is_some() {
            return Err(Error::RegionState("label placed twice"));
        }
        self.labels[label.0] = Some(self.here());
        Ok(())
    }

    pub fn emit(&mut self, op: Op) {
        let offset = self.here();
        self.code.push(Instruction { offset, op });
    }

    fn emit_branch(&mut self, op: Op, label: Label) {
        self.fixups.push(Fixup::Branch { at: self.code.len(), label });
        self.emit(op);
    }

    pub fn br(&mut self, label: Label) {
        self.emit_branch(Op::Br(u32::MAX), label);
    }

    pub fn br_true(&mut self, label: Label) {
        self.emit_branch(Op::BrTrue(u32::MAX), label);
    }

    pub fn br_false(&mut self, label: Label) {
        self.emit_branch(Op::BrFalse(u32::MAX), label);
    }

    pub fn leave(&mut self, label: Label) {
        self.emit_branch(Op::Leave(u32::MAX), label);
    }

    pub fn switch(&mut self, arms: &[Label]) {
        let at = self.code.len();
        for (arm, &label) in arms.iter().enumerate() {
            self.fixups.push(Fixup::SwitchArm { at, arm, label });
        }
        self.emit(Op::Switch(vec![u32::MAX; arms.len()]));
    }

    pub fn begin_try(&mut self) {
        self.open.push(OpenRegion { try_start: self.here(), boundary: None });
    }

    pub fn begin_handler(&mut self, kind: RegionKind) -> Result<(), Error> {
        let here = self.here();
        let region = self
            .open
            .last_mut()
            .ok_or(Error::RegionState("handler outside any try"))?;
        if region.boundary.is_some() {
            return Err(Error::RegionState("region already has a handler"));
        }
        region.boundary = Some((kind, here, here));
        Ok(())
    }

    pub fn end_region(&mut self) -> Result<(), Error> {
        let here = self.here();
        let region = self
            .open
            .pop()
            .ok_or(Error::RegionState("end without an open region"))?;
        let (kind, try_end, handler_start) = region
            .boundary
            .ok_or(Error::RegionState("region closed without a handler"))?;
        self.closed.push(ExceptionRegion {
            kind,
            try_start: region.try_start,
            try_end,
            handler_start,
            handler_end: here,
        });
        Ok(())
    }

    /// Patch branches, resolve labels, and return the finished body.
    /// Inner regions close first, so the table comes out innermost-first.
    pub fn finish(mut self) -> Result<(Vec<Instruction>, Vec<ExceptionRegion>), Error> {
        if !self.open.is_empty() {
            return Err(Error::RegionState("region left open"));
        }
        for fixup in self.fixups.drain(..) {
            match fixup {
                Fixup::Branch { at, label } => {
                    let target = self.labels[label.0].ok_or(Error::UnplacedLabel)?;
                    match &mut self.code[at].op {
                        Op::Br(t) | Op::BrTrue(t) | Op::BrFalse(t) | Op::Leave(t) => *t = target,
                        _ => return Err(Error::RegionState("branch fixup on non-branch")),
                    }
                }
                Fixup::SwitchArm { at, arm, label } => {
                    let target = self.labels[label.0].ok_or(Error::UnplacedLabel)?;
                    match &mut self.code[at].op {
                        Op::Switch(arms) => arms[arm] = target,
                        _ => return Err(Error::RegionState("switch fixup on non-switch")),
                    }
                }
            }
        }
        Ok((self.code, self.closed))
    }
}

/// One fresh label per original offset, so original branch operands can
/// be remapped as each instruction is re-emitted.
pub struct LabelMap {
    labels: Vec<Label>,
}

impl LabelMap {
    pub fn new(emitter: &mut CodeEmitter, len: usize) -> LabelMap {
        LabelMap {
            labels: (0..len).map(|_| emitter.fresh_label()).collect(),
        }
    }

    pub fn get(&self, offset: u32) -> Label {
        self.labels[offset as usize]
    }
}
