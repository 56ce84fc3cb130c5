//! Small assembler for constructing images in memory
//!
//! Front ends and tests build programs through this instead of writing
//! `Instruction` vectors by hand; it resolves labels to offsets and keeps
//! region bounds in sync with the code they cover.

use super::{
    ExceptionRegion, FieldDef, FieldId, Instruction, MethodBody, MethodDef, MethodFlags, MethodId,
    Op, Program, RegionKind, Ty, TypeDef, TypeFlags, TypeId,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AsmLabel(usize);

/// Assembles one method body
pub struct Asm {
    locals: Vec<Ty>,
    code: Vec<Instruction>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    regions: Vec<(RegionKind, AsmLabel, AsmLabel, AsmLabel, AsmLabel)>,
}

enum Fixup {
    Branch { at: usize, label: AsmLabel },
    SwitchArm { at: usize, arm: usize, label: AsmLabel },
}

impl Asm {
    pub fn new() -> Asm {
        Asm {
            locals: vec![],
            code: vec![],
            labels: vec![],
            fixups: vec![],
            regions: vec![],
        }
    }

    pub fn local(&mut self, ty: Ty) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    pub fn label(&mut self) -> AsmLabel {
        self.labels.push(None);
        AsmLabel(self.labels.len() - 1)
    }

    pub fn place(&mut self, label: AsmLabel) {
        debug_assert!(self.labels[label.0].is_none(), "label placed twice");
        self.labels[label.0] = Some(self.code.len() as u32);
    }

    pub fn op(&mut self, op: Op) -> &mut Asm {
        let offset = self.code.len() as u32;
        self.code.push(Instruction { offset, op });
        self
    }

    fn branch_to(&mut self, op: Op, label: AsmLabel) -> &mut Asm {
        self.fixups.push(Fixup::Branch { at: self.code.len(), label });
        self.op(op)
    }

    pub fn br(&mut self, label: AsmLabel) -> &mut Asm {
        self.branch_to(Op::Br(u32::MAX), label)
    }

    pub fn br_true(&mut self, label: AsmLabel) -> &mut Asm {
        self.branch_to(Op::BrTrue(u32::MAX), label)
    }

    pub fn br_false(&mut self, label: AsmLabel) -> &mut Asm {
        self.branch_to(Op::BrFalse(u32::MAX), label)
    }

    pub fn leave(&mut self, label: AsmLabel) -> &mut Asm {
        self.branch_to(Op::Leave(u32::MAX), label)
    }

    pub fn switch(&mut self, arms: &[AsmLabel]) -> &mut Asm {
        let at = self.code.len();
        for (arm, &label) in arms.iter().enumerate() {
            self.fixups.push(Fixup::SwitchArm { at, arm, label });
        }
        self.op(Op::Switch(vec![u32::MAX; arms.len()]))
    }

    /// Record a protected region by its boundary labels. Inner regions
    /// must be recorded before outer ones.
    pub fn region(
        &mut self,
        kind: RegionKind,
        try_start: AsmLabel,
        try_end: AsmLabel,
        handler_start: AsmLabel,
        handler_end: AsmLabel,
    ) {
        self.regions.push((kind, try_start, try_end, handler_start, handler_end));
    }

    pub fn finish(mut self) -> MethodBody {
        let resolve = |labels: &[Option<u32>], label: AsmLabel| -> u32 {
            labels[label.0].expect("unplaced label")
        };
        for fixup in self.fixups.drain(..) {
            match fixup {
                Fixup::Branch { at, label } => {
                    let target = resolve(&self.labels, label);
                    match &mut self.code[at].op {
                        Op::Br(t) | Op::BrTrue(t) | Op::BrFalse(t) | Op::Leave(t) => *t = target,
                        op => panic!("branch fixup on non-branch {:?}", op),
                    }
                }
                Fixup::SwitchArm { at, arm, label } => {
                    let target = resolve(&self.labels, label);
                    match &mut self.code[at].op {
                        Op::Switch(arms) => arms[arm] = target,
                        op => panic!("switch fixup on non-switch {:?}", op),
                    }
                }
            }
        }
        let regions = self
            .regions
            .iter()
            .map(|(kind, ts, te, hs, he)| ExceptionRegion {
                kind: kind.clone(),
                try_start: resolve(&self.labels, *ts),
                try_end: resolve(&self.labels, *te),
                handler_start: resolve(&self.labels, *hs),
                handler_end: resolve(&self.labels, *he),
            })
            .collect();
        MethodBody { locals: self.locals, code: self.code, regions }
    }
}

/// Builds a whole program
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder { program: Program { types: vec![], entry: None } }
    }

    pub fn add_type(&mut self, name: &str, flags: TypeFlags) -> TypeId {
        self.program.types.push(TypeDef {
            name: name.to_owned(),
            flags,
            super_ty: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
        });
        TypeId((self.program.types.len() - 1) as u32)
    }

    pub fn set_super(&mut self, ty: TypeId, super_ty: TypeId) {
        self.program.types[ty.0 as usize].super_ty = Some(super_ty);
    }

    pub fn add_interface(&mut self, ty: TypeId, interface: TypeId) {
        self.program.types[ty.0 as usize].interfaces.push(interface);
    }

    pub fn add_field(&mut self, ty: TypeId, name: &str, field_ty: Ty, is_static: bool) -> FieldId {
        let def = &mut self.program.types[ty.0 as usize];
        def.fields.push(FieldDef { name: name.to_owned(), ty: field_ty, is_static });
        FieldId { owner: ty, index: (def.fields.len() - 1) as u32 }
    }

    pub fn add_method(
        &mut self,
        ty: TypeId,
        name: &str,
        flags: MethodFlags,
        params: Vec<Ty>,
        ret: Option<Ty>,
        body: Option<MethodBody>,
    ) -> MethodId {
        let def = &mut self.program.types[ty.0 as usize];
        def.methods.push(MethodDef { name: name.to_owned(), flags, params, ret, body });
        MethodId { owner: ty, index: (def.methods.len() - 1) as u32 }
    }

    pub fn set_entry(&mut self, entry: MethodId) {
        self.program.entry = Some(entry);
    }

    pub fn finish(self) -> Program {
        self.program
    }
}
