//! Method bodies: instructions keyed by offset, locals and exception handlers.
//!
//! Branch operands hold the offset of their target instruction rather than a relative
//! displacement, which turns a body into an explicit control-flow graph: forward and backward
//! edges are both plain offset lookups. Offsets are assigned by
//! [`crate::metadata::emitter::BodyEmitter::finish`] from the encoded instruction sizes.

use crate::metadata::{
    opcodes::{OpCode, OperandType},
    references::{FieldHandle, MethodHandle},
    typesystem::{MethodSig, TypeSig},
};

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// 32 bit integer, also used for `ldc.i4.s` and `unaligned.`
    I4(i32),
    /// 64 bit integer
    I8(i64),
    /// 32 bit float
    R4(f32),
    /// 64 bit float
    R8(f64),
    /// User string
    String(String),
    /// Type token
    Type(TypeSig),
    /// Field token
    Field(FieldHandle),
    /// Method token
    Method(MethodHandle),
    /// Local variable index
    Local(u16),
    /// Argument index, counting `this` as argument 0 for instance methods
    Arg(u16),
    /// Branch target offset
    Target(u32),
    /// Jump table target offsets
    Switch(Vec<u32>),
    /// Call site signature of `calli`
    Sig(MethodSig),
}

/// One instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset from the start of the body
    pub offset: u32,
    /// The opcode
    pub opcode: OpCode,
    /// The operand
    pub operand: Operand,
}

impl Instruction {
    /// Encoded size of the instruction in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        encoded_size(self.opcode, &self.operand)
    }

    /// Branch targets of this instruction, empty for non-branching instructions.
    #[must_use]
    pub fn targets(&self) -> Vec<u32> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }
}

/// Encoded size of an opcode with the given operand.
#[must_use]
pub fn encoded_size(opcode: OpCode, operand: &Operand) -> u32 {
    let operand_size = match (opcode.operand_type(), operand) {
        (OperandType::InlineSwitch, Operand::Switch(targets)) => {
            4 + 4 * u32::try_from(targets.len()).unwrap_or(u32::MAX / 4 - 1)
        }
        (kind, _) => kind.size(),
    };
    opcode.size() + operand_size
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVariable {
    /// Slot type
    pub local_type: TypeSig,
    /// The referenced object is pinned while the slot is live
    pub pinned: bool,
}

impl LocalVariable {
    /// Creates an unpinned local.
    #[must_use]
    pub fn new(local_type: TypeSig) -> Self {
        LocalVariable {
            local_type,
            pinned: false,
        }
    }
}

/// Kind of an exception handling clause.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    /// Typed catch clause
    Catch(TypeSig),
    /// Filter clause, with the offset of the filter block
    Filter(u32),
    /// Finally clause
    Finally,
    /// Fault clause
    Fault,
}

/// An exception handling clause, expressed as offset ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub kind: HandlerKind,
    /// First instruction of the protected block
    pub try_start: u32,
    /// Offset just past the protected block
    pub try_end: u32,
    /// First instruction of the handler
    pub handler_start: u32,
    /// Offset just past the handler
    pub handler_end: u32,
}

/// A method body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Locals are zero-initialised on entry
    pub init_locals: bool,
    /// Local variable table
    pub locals: Vec<LocalVariable>,
    /// Instructions ordered by offset
    pub instructions: Vec<Instruction>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Returns the index of the instruction starting at `offset`.
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |instr| instr.offset)
            .ok()
    }

    /// Returns the instruction starting at `offset`.
    #[must_use]
    pub fn instruction_at(&self, offset: u32) -> Option<&Instruction> {
        self.index_of(offset).map(|index| &self.instructions[index])
    }

    /// Total encoded size of the instruction stream.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.instructions
            .last()
            .map_or(0, |last| last.offset + last.size())
    }

    /// Returns `true` if any instruction uses `opcode`.
    #[must_use]
    pub fn contains(&self, opcode: OpCode) -> bool {
        self.instructions.iter().any(|instr| instr.opcode == opcode)
    }

    /// Counts the instructions using `opcode`.
    #[must_use]
    pub fn count(&self, opcode: OpCode) -> usize {
        self.instructions
            .iter()
            .filter(|instr| instr.opcode == opcode)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_operand_kinds() {
        assert_eq!(encoded_size(OpCode::Ret, &Operand::None), 1);
        assert_eq!(encoded_size(OpCode::Br, &Operand::Target(0)), 5);
        assert_eq!(encoded_size(OpCode::Ldloc, &Operand::Local(4)), 4);
        assert_eq!(encoded_size(OpCode::LdcI8, &Operand::I8(1)), 9);
        assert_eq!(
            encoded_size(OpCode::Switch, &Operand::Switch(vec![1, 2, 3])),
            17
        );
    }

    #[test]
    fn lookup_by_offset() {
        let body = MethodBody {
            instructions: vec![
                Instruction {
                    offset: 0,
                    opcode: OpCode::LdcI4,
                    operand: Operand::I4(7),
                },
                Instruction {
                    offset: 5,
                    opcode: OpCode::Ret,
                    operand: Operand::None,
                },
            ],
            ..MethodBody::default()
        };
        assert_eq!(body.index_of(5), Some(1));
        assert_eq!(body.index_of(3), None);
        assert_eq!(body.code_size(), 6);
    }
}
