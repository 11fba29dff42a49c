//! Evaluation stack verification of method bodies.
//!
//! The verifier performs the structural checks of ECMA-335 III.1.7: every instruction is
//! reached with one consistent stack depth, no instruction pops more than is on the stack,
//! `ret` leaves exactly the return value, control never falls off the end of the body, and
//! local and argument operands are in range. It does not track types.
//!
//! The rewriter runs it over every body it synthesizes or modifies; the computed maximum
//! depth becomes the body's `max_stack`.

use crate::{
    metadata::{
        body::{HandlerKind, MethodBody, Operand},
        members::MethodDef,
        module::Module,
        opcodes::{FlowControl, OpCode, StackCount},
        token::MethodId,
    },
    Error, Result,
};

struct Verifier<'a> {
    module: &'a Module,
    method: &'a MethodDef,
    name: String,
    body: &'a MethodBody,
}

impl Verifier<'_> {
    fn error(&self, offset: u32, reason: impl Into<String>) -> Error {
        Error::InvalidBody {
            method: self.name.clone(),
            offset,
            reason: reason.into(),
        }
    }

    fn target_index(&self, from: u32, target: u32) -> Result<usize> {
        self.body
            .index_of(target)
            .ok_or_else(|| self.error(from, format!("branch target IL_{target:04x} is not an instruction")))
    }

    fn stack_effect(&self, index: usize, depth: u32) -> Result<(u32, u32)> {
        let instr = &self.body.instructions[index];
        let signature = |instr: &crate::metadata::body::Instruction| match &instr.operand {
            Operand::Method(handle) => self
                .module
                .method_sig(handle)
                .ok_or_else(|| self.error(instr.offset, "call target has no method signature")),
            Operand::Sig(sig) => Ok(sig.clone()),
            _ => Err(self.error(instr.offset, "call without method operand")),
        };

        let pops = match instr.opcode.pops() {
            StackCount::Fixed(n) => u32::from(n),
            StackCount::Variable => match instr.opcode {
                OpCode::Ret => u32::from(!self.method.signature.ret.is_void()),
                OpCode::Newobj => {
                    u32::try_from(signature(instr)?.params.len()).unwrap_or(u32::MAX)
                }
                OpCode::Calli => {
                    u32::try_from(signature(instr)?.arg_slots() + 1).unwrap_or(u32::MAX)
                }
                _ => u32::try_from(signature(instr)?.arg_slots()).unwrap_or(u32::MAX),
            },
        };
        let pushes = match instr.opcode.pushes() {
            StackCount::Fixed(n) => u32::from(n),
            StackCount::Variable => u32::from(!signature(instr)?.ret.is_void()),
        };

        if pops > depth {
            return Err(self.error(
                instr.offset,
                format!("{} pops {} with {} on the stack", instr.opcode, pops, depth),
            ));
        }
        if instr.opcode == OpCode::Ret && depth != pops {
            return Err(self.error(
                instr.offset,
                format!("ret with {depth} values on the stack, expected {pops}"),
            ));
        }
        Ok((pops, pushes))
    }

    fn check_operand(&self, index: usize) -> Result<()> {
        let instr = &self.body.instructions[index];
        let arg_count = self.method.signature.arg_slots();
        let explicit = match instr.opcode.expand_macro().1 {
            crate::metadata::opcodes::ImpliedOperand::Index(n) => Some(usize::from(n)),
            _ => None,
        };
        let slot = match (&instr.operand, explicit) {
            (_, Some(n)) => Some(n),
            (Operand::Local(n) | Operand::Arg(n), None) => Some(usize::from(*n)),
            _ => None,
        };
        if let Some(slot) = slot {
            if instr.opcode.addresses_local() && slot >= self.body.locals.len() {
                return Err(self.error(instr.offset, format!("local {slot} is not declared")));
            }
            if instr.opcode.addresses_argument() && slot >= arg_count {
                return Err(self.error(instr.offset, format!("argument {slot} does not exist")));
            }
        }
        Ok(())
    }

    fn run(&self) -> Result<u16> {
        let count = self.body.instructions.len();
        if count == 0 {
            return Err(self.error(0, "empty body"));
        }

        let mut depths: Vec<Option<u32>> = vec![None; count];
        let mut worklist: Vec<(usize, u32)> = vec![(0, 0)];
        for handler in &self.body.exception_handlers {
            let entry = u32::from(matches!(handler.kind, HandlerKind::Catch(_) | HandlerKind::Filter(_)));
            let start = self.target_index(handler.try_start, handler.handler_start)?;
            worklist.push((start, entry));
            if let HandlerKind::Filter(filter) = handler.kind {
                worklist.push((self.target_index(handler.try_start, filter)?, 1));
            }
        }

        let mut max_depth = 0u32;
        while let Some((index, depth)) = worklist.pop() {
            let instr = &self.body.instructions[index];
            match depths[index] {
                Some(seen) if seen == depth => continue,
                Some(seen) => {
                    return Err(self.error(
                        instr.offset,
                        format!("reached with stack depth {depth} and {seen}"),
                    ))
                }
                None => depths[index] = Some(depth),
            }

            self.check_operand(index)?;
            let (pops, pushes) = self.stack_effect(index, depth)?;
            let after = depth - pops + pushes;
            max_depth = max_depth.max(after).max(depth);

            let mut successors: Vec<(usize, u32)> = Vec::new();
            let fall_through = |successors: &mut Vec<(usize, u32)>, after: u32| {
                if index + 1 >= count {
                    return Err(self.error(instr.offset, "control falls off the end of the body"));
                }
                successors.push((index + 1, after));
                Ok(())
            };
            match instr.opcode.flow() {
                FlowControl::Next | FlowControl::Call | FlowControl::Meta | FlowControl::Break => {
                    fall_through(&mut successors, after)?;
                }
                FlowControl::Branch => {
                    let after = if instr.opcode == OpCode::Leave || instr.opcode == OpCode::LeaveS {
                        0
                    } else {
                        after
                    };
                    for target in instr.targets() {
                        successors.push((self.target_index(instr.offset, target)?, after));
                    }
                }
                FlowControl::CondBranch => {
                    for target in instr.targets() {
                        successors.push((self.target_index(instr.offset, target)?, after));
                    }
                    fall_through(&mut successors, after)?;
                }
                FlowControl::Return | FlowControl::Throw => {}
            }
            worklist.extend(successors);
        }

        Ok(u16::try_from(max_depth).unwrap_or(u16::MAX))
    }
}

/// Verifies `body` as the body of `method` and returns its maximum stack depth.
///
/// # Errors
/// Returns [`Error::InvalidBody`] describing the first violation found.
pub fn verify_body(module: &Module, method: &MethodDef, body: &MethodBody) -> Result<u16> {
    let name = format!("{}::{}", module.type_full_name(method.owner), method.name);
    Verifier {
        module,
        method,
        name,
        body,
    }
    .run()
}

/// Verifies the body of `method` and stores the computed maximum stack depth.
///
/// Methods without body are accepted unchanged.
///
/// # Errors
/// Returns [`Error::InvalidBody`] if the body does not verify.
pub fn finalize_body(module: &mut Module, method: MethodId) -> Result<()> {
    let def = module.method(method);
    let Some(body) = def.body.as_ref() else {
        return Ok(());
    };
    let max_stack = verify_body(module, def, body)?;
    if let Some(body) = module.method_mut(method).body.as_mut() {
        body.max_stack = max_stack;
    }
    Ok(())
}
