//! Label based construction of method bodies.
//!
//! [`BodyEmitter`] records instructions with symbolic branch targets and resolves them into
//! offsets when the body is finished. Labels are attached to the instruction that follows
//! [`BodyEmitter::mark_label`], not to a position in the buffer, so sequences can be moved
//! around (see [`BodyEmitter::prepend`]) without invalidating branches.
//!
//! Short branch forms are never emitted: every branch is widened to its general form so that
//! the final layout cannot overflow an 8 bit displacement.
//!
//! # Examples
//!
//! ```rust
//! use dotbind::metadata::{emitter::BodyEmitter, opcodes::OpCode};
//!
//! let mut emitter = BodyEmitter::new();
//! let done = emitter.define_label();
//! emitter.ldarg(0);
//! emitter.branch(OpCode::Brfalse, done);
//! emitter.ldc_i4(1);
//! emitter.emit(OpCode::Pop);
//! emitter.mark_label(done);
//! emitter.ret();
//!
//! let body = emitter.finish()?;
//! assert_eq!(body.instructions.len(), 5);
//! # Ok::<(), dotbind::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    metadata::{
        body::{encoded_size, ExceptionHandler, HandlerKind, Instruction, LocalVariable, MethodBody, Operand},
        opcodes::{ImpliedOperand, OpCode},
        references::{FieldHandle, MethodHandle},
        typesystem::{MethodSig, TypeSig},
    },
    Error, Result,
};

/// A symbolic branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone)]
enum PendingOperand {
    Ready(Operand),
    Label(Label),
    Labels(Vec<Label>),
}

#[derive(Debug, Clone)]
struct Pending {
    opcode: OpCode,
    operand: PendingOperand,
    marks: Vec<Label>,
}

#[derive(Debug, Clone)]
enum PendingKind {
    Catch(TypeSig),
    Filter(Label),
    Finally,
    Fault,
}

#[derive(Debug, Clone)]
struct PendingHandler {
    kind: PendingKind,
    try_start: Label,
    try_end: Label,
    handler_start: Label,
    handler_end: Label,
}

/// Builds a [`MethodBody`] from instructions with symbolic targets.
#[derive(Debug, Clone, Default)]
pub struct BodyEmitter {
    items: Vec<Pending>,
    next_label: u32,
    pending_marks: Vec<Label>,
    locals: Vec<LocalVariable>,
    handlers: Vec<PendingHandler>,
    init_locals: bool,
}

impl BodyEmitter {
    /// Creates an empty emitter with `init_locals` set.
    #[must_use]
    pub fn new() -> Self {
        BodyEmitter {
            init_locals: true,
            ..BodyEmitter::default()
        }
    }

    /// Creates an emitter that continues an existing body.
    ///
    /// Every instruction of `body` becomes a pending instruction whose branch operands refer to
    /// labels, so the result can be extended, prefixed and finished again.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a branch target or handler boundary of `body` does not
    /// start an instruction.
    pub fn from_body(body: &MethodBody) -> Result<Self> {
        let mut emitter = BodyEmitter {
            init_locals: body.init_locals,
            locals: body.locals.clone(),
            ..BodyEmitter::default()
        };

        let mut labels: HashMap<u32, Label> = HashMap::new();
        for instr in &body.instructions {
            let label = emitter.define_label();
            labels.insert(instr.offset, label);
        }
        let end = emitter.define_label();
        labels.insert(body.code_size(), end);

        let lookup = |offset: u32| {
            labels
                .get(&offset)
                .copied()
                .ok_or_else(|| malformed_error!("Offset IL_{:04x} does not start an instruction", offset))
        };

        for instr in &body.instructions {
            emitter.mark_label(lookup(instr.offset)?);
            let operand = match &instr.operand {
                Operand::Target(target) => PendingOperand::Label(lookup(*target)?),
                Operand::Switch(targets) => PendingOperand::Labels(
                    targets
                        .iter()
                        .map(|target| lookup(*target))
                        .collect::<Result<Vec<_>>>()?,
                ),
                other => PendingOperand::Ready(other.clone()),
            };
            emitter.push(instr.opcode, operand);
        }
        emitter.mark_label(end);

        for handler in &body.exception_handlers {
            let kind = match &handler.kind {
                HandlerKind::Catch(sig) => PendingKind::Catch(sig.clone()),
                HandlerKind::Filter(offset) => PendingKind::Filter(lookup(*offset)?),
                HandlerKind::Finally => PendingKind::Finally,
                HandlerKind::Fault => PendingKind::Fault,
            };
            emitter.handlers.push(PendingHandler {
                kind,
                try_start: lookup(handler.try_start)?,
                try_end: lookup(handler.try_end)?,
                handler_start: lookup(handler.handler_start)?,
                handler_end: lookup(handler.handler_end)?,
            });
        }
        Ok(emitter)
    }

    /// Number of instructions recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if no instruction has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Declares a local and returns its index.
    pub fn declare_local(&mut self, local_type: TypeSig) -> u16 {
        self.locals.push(LocalVariable::new(local_type));
        u16::try_from(self.locals.len() - 1).unwrap_or(u16::MAX)
    }

    /// Declares a local, preserving its pinning, and returns its index.
    pub fn declare_local_variable(&mut self, local: LocalVariable) -> u16 {
        self.locals.push(local);
        u16::try_from(self.locals.len() - 1).unwrap_or(u16::MAX)
    }

    /// Number of locals declared so far.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Creates a new, unmarked label.
    pub fn define_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label - 1)
    }

    /// Binds `label` to the next recorded instruction, or to the end of the body.
    pub fn mark_label(&mut self, label: Label) {
        self.pending_marks.push(label);
    }

    fn push(&mut self, opcode: OpCode, operand: PendingOperand) {
        let marks = std::mem::take(&mut self.pending_marks);
        self.items.push(Pending {
            opcode,
            operand,
            marks,
        });
    }

    /// Records an instruction without operand.
    pub fn emit(&mut self, opcode: OpCode) {
        self.push(opcode, PendingOperand::Ready(Operand::None));
    }

    /// Records an instruction with a resolved operand.
    pub fn emit_operand(&mut self, opcode: OpCode, operand: Operand) {
        self.push(opcode, PendingOperand::Ready(operand));
    }

    /// Records a branch to `target`; short forms are widened.
    pub fn branch(&mut self, opcode: OpCode, target: Label) {
        let (opcode, _) = opcode.expand_macro();
        self.push(opcode, PendingOperand::Label(target));
    }

    /// Records a `switch` over `targets`.
    pub fn switch(&mut self, targets: Vec<Label>) {
        self.push(OpCode::Switch, PendingOperand::Labels(targets));
    }

    /// `ldarg`, using the macro forms where possible.
    pub fn ldarg(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Ldarg0),
            1 => self.emit(OpCode::Ldarg1),
            2 => self.emit(OpCode::Ldarg2),
            3 => self.emit(OpCode::Ldarg3),
            _ => self.emit_operand(OpCode::Ldarg, Operand::Arg(index)),
        }
    }

    /// `ldarga`
    pub fn ldarga(&mut self, index: u16) {
        self.emit_operand(OpCode::Ldarga, Operand::Arg(index));
    }

    /// `ldloc`, using the macro forms where possible.
    pub fn ldloc(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Ldloc0),
            1 => self.emit(OpCode::Ldloc1),
            2 => self.emit(OpCode::Ldloc2),
            3 => self.emit(OpCode::Ldloc3),
            _ => self.emit_operand(OpCode::Ldloc, Operand::Local(index)),
        }
    }

    /// `stloc`, using the macro forms where possible.
    pub fn stloc(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Stloc0),
            1 => self.emit(OpCode::Stloc1),
            2 => self.emit(OpCode::Stloc2),
            3 => self.emit(OpCode::Stloc3),
            _ => self.emit_operand(OpCode::Stloc, Operand::Local(index)),
        }
    }

    /// `ldloca`
    pub fn ldloca(&mut self, index: u16) {
        self.emit_operand(OpCode::Ldloca, Operand::Local(index));
    }

    /// `ldc.i4`, using the macro forms where possible.
    pub fn ldc_i4(&mut self, value: i32) {
        match value {
            -1 => self.emit(OpCode::LdcI4M1),
            0 => self.emit(OpCode::LdcI40),
            1 => self.emit(OpCode::LdcI41),
            2 => self.emit(OpCode::LdcI42),
            3 => self.emit(OpCode::LdcI43),
            4 => self.emit(OpCode::LdcI44),
            5 => self.emit(OpCode::LdcI45),
            6 => self.emit(OpCode::LdcI46),
            7 => self.emit(OpCode::LdcI47),
            8 => self.emit(OpCode::LdcI48),
            -128..=127 => self.emit_operand(OpCode::LdcI4S, Operand::I4(value)),
            _ => self.emit_operand(OpCode::LdcI4, Operand::I4(value)),
        }
    }

    /// `ldstr`
    pub fn ldstr(&mut self, value: &str) {
        self.emit_operand(OpCode::Ldstr, Operand::String(value.to_string()));
    }

    /// `call`
    pub fn call(&mut self, method: MethodHandle) {
        self.emit_operand(OpCode::Call, Operand::Method(method));
    }

    /// `callvirt`
    pub fn callvirt(&mut self, method: MethodHandle) {
        self.emit_operand(OpCode::Callvirt, Operand::Method(method));
    }

    /// `newobj`
    pub fn newobj(&mut self, constructor: MethodHandle) {
        self.emit_operand(OpCode::Newobj, Operand::Method(constructor));
    }

    /// `ldftn`
    pub fn ldftn(&mut self, method: MethodHandle) {
        self.emit_operand(OpCode::Ldftn, Operand::Method(method));
    }

    /// `calli` with the given call site signature.
    pub fn calli(&mut self, site: MethodSig) {
        self.emit_operand(OpCode::Calli, Operand::Sig(site));
    }

    /// `ldsfld`
    pub fn ldsfld(&mut self, field: FieldHandle) {
        self.emit_operand(OpCode::Ldsfld, Operand::Field(field));
    }

    /// `stsfld`
    pub fn stsfld(&mut self, field: FieldHandle) {
        self.emit_operand(OpCode::Stsfld, Operand::Field(field));
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit(OpCode::Ret);
    }

    /// `ldnull`
    pub fn ldnull(&mut self) {
        self.emit(OpCode::Ldnull);
    }

    /// `dup`
    pub fn dup(&mut self) {
        self.emit(OpCode::Dup);
    }

    /// `throw`
    pub fn throw(&mut self) {
        self.emit(OpCode::Throw);
    }

    /// `leave` to `target`.
    pub fn leave(&mut self, target: Label) {
        self.branch(OpCode::Leave, target);
    }

    /// Registers a `try`/`finally` clause over already defined labels.
    pub fn finally_handler(&mut self, try_start: Label, try_end: Label, handler_start: Label, handler_end: Label) {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Finally,
            try_start,
            try_end,
            handler_start,
            handler_end,
        });
    }

    /// Registers a typed `catch` clause over already defined labels.
    pub fn catch_handler(
        &mut self,
        catch_type: TypeSig,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Catch(catch_type),
            try_start,
            try_end,
            handler_start,
            handler_end,
        });
    }

    /// Moves the instructions recorded by `build` in front of everything recorded so far.
    ///
    /// Labels keep pointing at the instructions they were marked on.
    pub fn prepend<F>(&mut self, build: F)
    where
        F: FnOnce(&mut BodyEmitter),
    {
        let trailing = std::mem::take(&mut self.pending_marks);
        let start = self.items.len();
        build(self);
        let inserted = self.items.len() - start;
        self.items.rotate_right(inserted);
        if !self.pending_marks.is_empty() && start > 0 {
            // a label marked at the end of the prefix belongs to the old first instruction
            let marks = std::mem::take(&mut self.pending_marks);
            self.items[inserted].marks.extend(marks);
        }
        self.pending_marks.extend(trailing);
    }

    /// Resolves labels, assigns offsets and produces the body.
    ///
    /// `max_stack` is left at 8; callers that need the exact depth run
    /// [`crate::verify::finalize_body`].
    ///
    /// # Errors
    /// Returns [`Error::Error`] if a referenced label was never marked.
    pub fn finish(self) -> Result<MethodBody> {
        let mut offsets: HashMap<Label, u32> = HashMap::new();
        let mut offset = 0u32;
        let mut sizes = Vec::with_capacity(self.items.len());
        for item in &self.items {
            for mark in &item.marks {
                offsets.insert(*mark, offset);
            }
            let size = match &item.operand {
                PendingOperand::Ready(operand) => encoded_size(item.opcode, operand),
                PendingOperand::Label(_) => encoded_size(item.opcode, &Operand::Target(0)),
                PendingOperand::Labels(labels) => {
                    encoded_size(item.opcode, &Operand::Switch(vec![0; labels.len()]))
                }
            };
            sizes.push(offset);
            offset += size;
        }
        for mark in &self.pending_marks {
            offsets.insert(*mark, offset);
        }

        let resolve = |label: Label| {
            offsets
                .get(&label)
                .copied()
                .ok_or_else(|| Error::Error(format!("Label {} was never marked", label.0)))
        };

        let mut instructions = Vec::with_capacity(self.items.len());
        for (item, offset) in self.items.into_iter().zip(sizes) {
            let operand = match item.operand {
                PendingOperand::Ready(operand) => operand,
                PendingOperand::Label(label) => Operand::Target(resolve(label)?),
                PendingOperand::Labels(labels) => Operand::Switch(
                    labels
                        .into_iter()
                        .map(resolve)
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            instructions.push(Instruction {
                offset,
                opcode: item.opcode,
                operand,
            });
        }

        let mut exception_handlers = Vec::with_capacity(self.handlers.len());
        for handler in self.handlers {
            let kind = match handler.kind {
                PendingKind::Catch(sig) => HandlerKind::Catch(sig),
                PendingKind::Filter(label) => HandlerKind::Filter(resolve(label)?),
                PendingKind::Finally => HandlerKind::Finally,
                PendingKind::Fault => HandlerKind::Fault,
            };
            exception_handlers.push(ExceptionHandler {
                kind,
                try_start: resolve(handler.try_start)?,
                try_end: resolve(handler.try_end)?,
                handler_start: resolve(handler.handler_start)?,
                handler_end: resolve(handler.handler_end)?,
            });
        }

        Ok(MethodBody {
            max_stack: 8,
            init_locals: self.init_locals,
            locals: self.locals,
            instructions,
            exception_handlers,
        })
    }
}

/// Rewrites macro forms into their general forms in place.
///
/// `ldarg.1` becomes `ldarg 1`, `ldc.i4.s 5` becomes `ldc.i4 5`, `br.s` becomes `br` and so on.
/// Offsets are not recomputed; callers re-layout the body through [`BodyEmitter::from_body`].
pub fn simplify_macros(body: &mut MethodBody) {
    for instr in &mut body.instructions {
        let (general, implied) = instr.opcode.expand_macro();
        if general == instr.opcode {
            continue;
        }
        instr.operand = match implied {
            ImpliedOperand::Index(index) if general == OpCode::Ldarg => Operand::Arg(index),
            ImpliedOperand::Index(index) => Operand::Local(index),
            ImpliedOperand::Constant(value) => Operand::I4(value),
            ImpliedOperand::Explicit => std::mem::replace(&mut instr.operand, Operand::None),
        };
        instr.opcode = general;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_branch_resolves_to_loop_head() -> Result<()> {
        let mut emitter = BodyEmitter::new();
        let counter = emitter.declare_local(TypeSig::I4);
        let head = emitter.define_label();
        emitter.ldc_i4(10);
        emitter.stloc(counter);
        emitter.mark_label(head);
        emitter.ldloc(counter);
        emitter.ldc_i4(1);
        emitter.emit(OpCode::Sub);
        emitter.emit(OpCode::Dup);
        emitter.stloc(counter);
        emitter.branch(OpCode::BrtrueS, head);
        emitter.ret();

        let body = emitter.finish()?;
        let branch = &body.instructions[7];
        assert_eq!(branch.opcode, OpCode::Brtrue);
        assert_eq!(branch.operand, Operand::Target(body.instructions[2].offset));
        Ok(())
    }

    #[test]
    fn prepend_keeps_labels_on_their_instructions() -> Result<()> {
        let mut emitter = BodyEmitter::new();
        let end = emitter.define_label();
        emitter.branch(OpCode::Br, end);
        emitter.emit(OpCode::Nop);
        emitter.mark_label(end);
        emitter.ret();
        emitter.prepend(|e| {
            e.ldnull();
            e.emit(OpCode::Pop);
        });

        let body = emitter.finish()?;
        let opcodes: Vec<OpCode> = body.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::Ldnull, OpCode::Pop, OpCode::Br, OpCode::Nop, OpCode::Ret]
        );
        assert_eq!(body.instructions[2].operand, Operand::Target(body.instructions[4].offset));
        Ok(())
    }

    #[test]
    fn unmarked_label_is_an_error() {
        let mut emitter = BodyEmitter::new();
        let nowhere = emitter.define_label();
        emitter.branch(OpCode::Br, nowhere);
        assert!(emitter.finish().is_err());
    }

    #[test]
    fn simplify_expands_implied_operands() -> Result<()> {
        let mut emitter = BodyEmitter::new();
        emitter.ldarg(1);
        emitter.ldc_i4(3);
        emitter.emit(OpCode::Add);
        emitter.stloc(0);
        emitter.ret();
        let mut body = emitter.finish()?;
        simplify_macros(&mut body);
        assert_eq!(body.instructions[0].opcode, OpCode::Ldarg);
        assert_eq!(body.instructions[0].operand, Operand::Arg(1));
        assert_eq!(body.instructions[1].operand, Operand::I4(3));
        assert_eq!(body.instructions[3].operand, Operand::Local(0));
        Ok(())
    }

    #[test]
    fn from_body_round_trips_layout() -> Result<()> {
        let mut emitter = BodyEmitter::new();
        let skip = emitter.define_label();
        emitter.ldarg(0);
        emitter.branch(OpCode::Brfalse, skip);
        emitter.emit(OpCode::Nop);
        emitter.mark_label(skip);
        emitter.ret();
        let body = emitter.finish()?;
        let again = BodyEmitter::from_body(&body)?.finish()?;
        assert_eq!(body.instructions, again.instructions);
        Ok(())
    }
}

