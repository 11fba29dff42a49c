//! Cloning of method bodies.
//!
//! Every instruction of the source body is translated exactly once and in order, memoized by
//! its source offset. Branch targets and exception handling boundaries are then mapped
//! through that memo, so a target that does not start an instruction is rejected before
//! anything is emitted. The body is laid out again through [`BodyEmitter`], which recomputes
//! every offset.

use crossbeam_skiplist::SkipMap;

use crate::{
    cloner::Cloner,
    metadata::{
        body::{ExceptionHandler, HandlerKind, Instruction, LocalVariable, MethodBody, Operand},
        emitter::BodyEmitter,
        module::Module,
    },
    Result,
};

impl Cloner<'_> {
    /// Clones a body of the source module, translating every token it uses.
    ///
    /// # Errors
    /// Returns an error if an operand cannot be translated, or [`crate::Error::Malformed`] if
    /// the body branches into the middle of an instruction.
    pub fn clone_body(&mut self, dest: &mut Module, body: &MethodBody) -> Result<MethodBody> {
        let cloned = self.copy_body(dest, body)?;
        self.drain(dest)?;
        Ok(cloned)
    }

    pub(super) fn copy_body(&mut self, dest: &mut Module, body: &MethodBody) -> Result<MethodBody> {
        let memo: SkipMap<u32, Instruction> = SkipMap::new();
        for instr in &body.instructions {
            memo.insert(
                instr.offset,
                Instruction {
                    offset: instr.offset,
                    opcode: instr.opcode,
                    operand: self.clone_operand(dest, &instr.operand)?,
                },
            );
        }

        let code_size = body.code_size();
        let mapped = |offset: u32| -> Result<u32> {
            if offset == code_size || memo.contains_key(&offset) {
                Ok(offset)
            } else {
                Err(malformed_error!("Offset IL_{:04x} does not start an instruction", offset))
            }
        };
        for entry in memo.iter() {
            for target in entry.value().targets() {
                mapped(target)?;
            }
        }

        let mut exception_handlers = Vec::with_capacity(body.exception_handlers.len());
        for handler in &body.exception_handlers {
            let kind = match &handler.kind {
                HandlerKind::Catch(sig) => HandlerKind::Catch(self.import_sig(dest, sig)?),
                HandlerKind::Filter(offset) => HandlerKind::Filter(mapped(*offset)?),
                other => other.clone(),
            };
            exception_handlers.push(ExceptionHandler {
                kind,
                try_start: mapped(handler.try_start)?,
                try_end: mapped(handler.try_end)?,
                handler_start: mapped(handler.handler_start)?,
                handler_end: mapped(handler.handler_end)?,
            });
        }

        let mut locals = Vec::with_capacity(body.locals.len());
        for local in &body.locals {
            locals.push(LocalVariable {
                local_type: self.import_sig(dest, &local.local_type)?,
                pinned: local.pinned,
            });
        }

        let staged = MethodBody {
            max_stack: body.max_stack,
            init_locals: body.init_locals,
            locals,
            instructions: memo.iter().map(|entry| entry.value().clone()).collect(),
            exception_handlers,
        };
        let mut cloned = BodyEmitter::from_body(&staged)?.finish()?;
        cloned.max_stack = body.max_stack;
        Ok(cloned)
    }

    pub(crate) fn clone_operand(&mut self, dest: &mut Module, operand: &Operand) -> Result<Operand> {
        Ok(match operand {
            Operand::Type(sig) => Operand::Type(self.import_sig(dest, sig)?),
            Operand::Field(handle) => Operand::Field(self.import_field(dest, *handle)?),
            Operand::Method(handle) => Operand::Method(self.import_method(dest, handle)?),
            Operand::Sig(sig) => Operand::Sig(self.import_method_sig(dest, sig)?),
            other => other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::opcodes::OpCode;

    #[test]
    fn loops_are_cloned_once() -> Result<()> {
        let mut e = BodyEmitter::new();
        let head = e.define_label();
        let exit = e.define_label();
        e.mark_label(head);
        e.ldarg(0);
        e.branch(OpCode::Brfalse, exit);
        e.branch(OpCode::Br, head);
        e.mark_label(exit);
        e.ret();
        let body = e.finish()?;

        let source = Module::new("Lib.dll", "Lib");
        let mut dest = Module::new("App.dll", "App");
        let mut cloner = Cloner::new(&source);
        let cloned = cloner.clone_body(&mut dest, &body)?;
        assert_eq!(cloned.instructions.len(), body.instructions.len());
        assert_eq!(cloned.instructions[2].operand, Operand::Target(0));
        Ok(())
    }

    #[test]
    fn unreachable_code_is_kept() -> Result<()> {
        let mut e = BodyEmitter::new();
        e.ret();
        e.ldc_i4(7);
        e.emit(OpCode::Pop);
        e.ret();
        let body = e.finish()?;

        let source = Module::new("Lib.dll", "Lib");
        let mut dest = Module::new("App.dll", "App");
        let cloned = Cloner::new(&source).clone_body(&mut dest, &body)?;
        assert_eq!(cloned.instructions.len(), body.instructions.len());
        let opcodes = |body: &MethodBody| body.instructions.iter().map(|i| i.opcode).collect::<Vec<_>>();
        assert_eq!(opcodes(&cloned), opcodes(&body));
        Ok(())
    }

    #[test]
    fn branches_into_an_instruction_are_rejected() {
        let body = MethodBody {
            max_stack: 1,
            init_locals: false,
            locals: Vec::new(),
            instructions: vec![
                Instruction {
                    offset: 0,
                    opcode: OpCode::LdcI4,
                    operand: Operand::I4(1000),
                },
                Instruction {
                    offset: 5,
                    opcode: OpCode::Br,
                    operand: Operand::Target(2),
                },
            ],
            exception_handlers: Vec::new(),
        };
        let source = Module::new("Lib.dll", "Lib");
        let mut dest = Module::new("App.dll", "App");
        let cloned = Cloner::new(&source).clone_body(&mut dest, &body);
        assert!(matches!(cloned, Err(crate::Error::Malformed { .. })));
    }

    #[test]
    fn protected_regions_survive() -> Result<()> {
        let mut e = BodyEmitter::new();
        let try_start = e.define_label();
        let handler = e.define_label();
        let done = e.define_label();
        e.mark_label(try_start);
        e.ldc_i4(1);
        e.emit(OpCode::Pop);
        e.leave(done);
        e.mark_label(handler);
        e.emit(OpCode::Endfinally);
        e.mark_label(done);
        e.ret();
        e.finally_handler(try_start, handler, handler, done);
        let body = e.finish()?;

        let source = Module::new("Lib.dll", "Lib");
        let mut dest = Module::new("App.dll", "App");
        let cloned = Cloner::new(&source).clone_body(&mut dest, &body)?;
        assert_eq!(cloned.instructions.len(), body.instructions.len());
        assert_eq!(cloned.exception_handlers, body.exception_handlers);
        Ok(())
    }
}
