//! The CIL instruction set of ECMA-335 Partition III.
//!
//! Every opcode carries its encoding, mnemonic, operand kind, stack behaviour and flow kind in
//! one table, so the emitter, the verifier, the image codec and the cloner all agree on how an
//! instruction behaves. Two byte opcodes are encoded as `0xFE00 | second_byte`.

use strum::Display;

/// Kind of inline operand an opcode takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperandType {
    /// No operand
    InlineNone,
    /// 8 bit argument or local index
    ShortInlineVar,
    /// 16 bit argument or local index
    InlineVar,
    /// 8 bit integer
    ShortInlineI,
    /// 32 bit integer
    InlineI,
    /// 64 bit integer
    InlineI8,
    /// 32 bit float
    ShortInlineR,
    /// 64 bit float
    InlineR,
    /// String token
    InlineString,
    /// Type token
    InlineType,
    /// Field token
    InlineField,
    /// Method token
    InlineMethod,
    /// Type, field or method token
    InlineTok,
    /// Stand alone signature token
    InlineSig,
    /// 8 bit relative branch target
    ShortInlineBrTarget,
    /// 32 bit relative branch target
    InlineBrTarget,
    /// Jump table
    InlineSwitch,
}

impl OperandType {
    /// Encoded size of the operand in bytes; switch tables add four bytes per target.
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            OperandType::InlineNone => 0,
            OperandType::ShortInlineVar
            | OperandType::ShortInlineI
            | OperandType::ShortInlineBrTarget => 1,
            OperandType::InlineVar => 2,
            OperandType::InlineI8 | OperandType::InlineR => 8,
            _ => 4,
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlowControl {
    /// Falls through to the next instruction
    Next,
    /// Debugger break
    Break,
    /// Unconditional branch
    Branch,
    /// Conditional branch, falls through otherwise
    CondBranch,
    /// Method call, falls through
    Call,
    /// Leaves the method or a handler
    Return,
    /// Throws
    Throw,
    /// Prefix of the next instruction
    Meta,
}

/// Number of stack slots an instruction pops or pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCount {
    /// A fixed number of slots
    Fixed(u8),
    /// Depends on the operand signature
    Variable,
}

const V: i8 = -1;

const fn count(n: i8) -> StackCount {
    if n < 0 {
        StackCount::Variable
    } else {
        StackCount::Fixed(n as u8)
    }
}

macro_rules! opcodes {
    ($($variant:ident = $code:literal, $mnemonic:literal, $operand:ident, $pop:expr, $push:expr, $flow:ident;)*) => {
        /// A CIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpCode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $variant,
            )*
        }

        impl OpCode {
            /// All opcodes in encoding order.
            pub const ALL: &'static [OpCode] = &[$(OpCode::$variant),*];

            /// Encoded value; two byte opcodes carry the `0xFE` prefix in the high byte.
            #[must_use]
            pub fn code(self) -> u16 {
                match self {
                    $(OpCode::$variant => $code,)*
                }
            }

            /// Looks up an opcode by its encoded value.
            #[must_use]
            pub fn from_code(code: u16) -> Option<OpCode> {
                match code {
                    $($code => Some(OpCode::$variant),)*
                    _ => None,
                }
            }

            /// Assembler mnemonic.
            #[must_use]
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $mnemonic,)*
                }
            }

            /// Operand kind.
            #[must_use]
            pub fn operand_type(self) -> OperandType {
                match self {
                    $(OpCode::$variant => OperandType::$operand,)*
                }
            }

            /// Stack slots consumed.
            #[must_use]
            pub fn pops(self) -> StackCount {
                match self {
                    $(OpCode::$variant => count($pop),)*
                }
            }

            /// Stack slots produced.
            #[must_use]
            pub fn pushes(self) -> StackCount {
                match self {
                    $(OpCode::$variant => count($push),)*
                }
            }

            /// Control flow kind.
            #[must_use]
            pub fn flow(self) -> FlowControl {
                match self {
                    $(OpCode::$variant => FlowControl::$flow,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", InlineNone, 0, 0, Next;
    Break = 0x01, "break", InlineNone, 0, 0, Break;
    Ldarg0 = 0x02, "ldarg.0", InlineNone, 0, 1, Next;
    Ldarg1 = 0x03, "ldarg.1", InlineNone, 0, 1, Next;
    Ldarg2 = 0x04, "ldarg.2", InlineNone, 0, 1, Next;
    Ldarg3 = 0x05, "ldarg.3", InlineNone, 0, 1, Next;
    Ldloc0 = 0x06, "ldloc.0", InlineNone, 0, 1, Next;
    Ldloc1 = 0x07, "ldloc.1", InlineNone, 0, 1, Next;
    Ldloc2 = 0x08, "ldloc.2", InlineNone, 0, 1, Next;
    Ldloc3 = 0x09, "ldloc.3", InlineNone, 0, 1, Next;
    Stloc0 = 0x0a, "stloc.0", InlineNone, 1, 0, Next;
    Stloc1 = 0x0b, "stloc.1", InlineNone, 1, 0, Next;
    Stloc2 = 0x0c, "stloc.2", InlineNone, 1, 0, Next;
    Stloc3 = 0x0d, "stloc.3", InlineNone, 1, 0, Next;
    LdargS = 0x0e, "ldarg.s", ShortInlineVar, 0, 1, Next;
    LdargaS = 0x0f, "ldarga.s", ShortInlineVar, 0, 1, Next;
    StargS = 0x10, "starg.s", ShortInlineVar, 1, 0, Next;
    LdlocS = 0x11, "ldloc.s", ShortInlineVar, 0, 1, Next;
    LdlocaS = 0x12, "ldloca.s", ShortInlineVar, 0, 1, Next;
    StlocS = 0x13, "stloc.s", ShortInlineVar, 1, 0, Next;
    Ldnull = 0x14, "ldnull", InlineNone, 0, 1, Next;
    LdcI4M1 = 0x15, "ldc.i4.m1", InlineNone, 0, 1, Next;
    LdcI40 = 0x16, "ldc.i4.0", InlineNone, 0, 1, Next;
    LdcI41 = 0x17, "ldc.i4.1", InlineNone, 0, 1, Next;
    LdcI42 = 0x18, "ldc.i4.2", InlineNone, 0, 1, Next;
    LdcI43 = 0x19, "ldc.i4.3", InlineNone, 0, 1, Next;
    LdcI44 = 0x1a, "ldc.i4.4", InlineNone, 0, 1, Next;
    LdcI45 = 0x1b, "ldc.i4.5", InlineNone, 0, 1, Next;
    LdcI46 = 0x1c, "ldc.i4.6", InlineNone, 0, 1, Next;
    LdcI47 = 0x1d, "ldc.i4.7", InlineNone, 0, 1, Next;
    LdcI48 = 0x1e, "ldc.i4.8", InlineNone, 0, 1, Next;
    LdcI4S = 0x1f, "ldc.i4.s", ShortInlineI, 0, 1, Next;
    LdcI4 = 0x20, "ldc.i4", InlineI, 0, 1, Next;
    LdcI8 = 0x21, "ldc.i8", InlineI8, 0, 1, Next;
    LdcR4 = 0x22, "ldc.r4", ShortInlineR, 0, 1, Next;
    LdcR8 = 0x23, "ldc.r8", InlineR, 0, 1, Next;
    Dup = 0x25, "dup", InlineNone, 1, 2, Next;
    Pop = 0x26, "pop", InlineNone, 1, 0, Next;
    Jmp = 0x27, "jmp", InlineMethod, 0, 0, Call;
    Call = 0x28, "call", InlineMethod, V, V, Call;
    Calli = 0x29, "calli", InlineSig, V, V, Call;
    Ret = 0x2a, "ret", InlineNone, V, 0, Return;
    BrS = 0x2b, "br.s", ShortInlineBrTarget, 0, 0, Branch;
    BrfalseS = 0x2c, "brfalse.s", ShortInlineBrTarget, 1, 0, CondBranch;
    BrtrueS = 0x2d, "brtrue.s", ShortInlineBrTarget, 1, 0, CondBranch;
    BeqS = 0x2e, "beq.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BgeS = 0x2f, "bge.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BgtS = 0x30, "bgt.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BleS = 0x31, "ble.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BltS = 0x32, "blt.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BneUnS = 0x33, "bne.un.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BgeUnS = 0x34, "bge.un.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BleUnS = 0x36, "ble.un.s", ShortInlineBrTarget, 2, 0, CondBranch;
    BltUnS = 0x37, "blt.un.s", ShortInlineBrTarget, 2, 0, CondBranch;
    Br = 0x38, "br", InlineBrTarget, 0, 0, Branch;
    Brfalse = 0x39, "brfalse", InlineBrTarget, 1, 0, CondBranch;
    Brtrue = 0x3a, "brtrue", InlineBrTarget, 1, 0, CondBranch;
    Beq = 0x3b, "beq", InlineBrTarget, 2, 0, CondBranch;
    Bge = 0x3c, "bge", InlineBrTarget, 2, 0, CondBranch;
    Bgt = 0x3d, "bgt", InlineBrTarget, 2, 0, CondBranch;
    Ble = 0x3e, "ble", InlineBrTarget, 2, 0, CondBranch;
    Blt = 0x3f, "blt", InlineBrTarget, 2, 0, CondBranch;
    BneUn = 0x40, "bne.un", InlineBrTarget, 2, 0, CondBranch;
    BgeUn = 0x41, "bge.un", InlineBrTarget, 2, 0, CondBranch;
    BgtUn = 0x42, "bgt.un", InlineBrTarget, 2, 0, CondBranch;
    BleUn = 0x43, "ble.un", InlineBrTarget, 2, 0, CondBranch;
    BltUn = 0x44, "blt.un", InlineBrTarget, 2, 0, CondBranch;
    Switch = 0x45, "switch", InlineSwitch, 1, 0, CondBranch;
    LdindI1 = 0x46, "ldind.i1", InlineNone, 1, 1, Next;
    LdindU1 = 0x47, "ldind.u1", InlineNone, 1, 1, Next;
    LdindI2 = 0x48, "ldind.i2", InlineNone, 1, 1, Next;
    LdindU2 = 0x49, "ldind.u2", InlineNone, 1, 1, Next;
    LdindI4 = 0x4a, "ldind.i4", InlineNone, 1, 1, Next;
    LdindU4 = 0x4b, "ldind.u4", InlineNone, 1, 1, Next;
    LdindI8 = 0x4c, "ldind.i8", InlineNone, 1, 1, Next;
    LdindI = 0x4d, "ldind.i", InlineNone, 1, 1, Next;
    LdindR4 = 0x4e, "ldind.r4", InlineNone, 1, 1, Next;
    LdindR8 = 0x4f, "ldind.r8", InlineNone, 1, 1, Next;
    LdindRef = 0x50, "ldind.ref", InlineNone, 1, 1, Next;
    StindRef = 0x51, "stind.ref", InlineNone, 2, 0, Next;
    StindI1 = 0x52, "stind.i1", InlineNone, 2, 0, Next;
    StindI2 = 0x53, "stind.i2", InlineNone, 2, 0, Next;
    StindI4 = 0x54, "stind.i4", InlineNone, 2, 0, Next;
    StindI8 = 0x55, "stind.i8", InlineNone, 2, 0, Next;
    StindR4 = 0x56, "stind.r4", InlineNone, 2, 0, Next;
    StindR8 = 0x57, "stind.r8", InlineNone, 2, 0, Next;
    Add = 0x58, "add", InlineNone, 2, 1, Next;
    Sub = 0x59, "sub", InlineNone, 2, 1, Next;
    Mul = 0x5a, "mul", InlineNone, 2, 1, Next;
    Div = 0x5b, "div", InlineNone, 2, 1, Next;
    DivUn = 0x5c, "div.un", InlineNone, 2, 1, Next;
    Rem = 0x5d, "rem", InlineNone, 2, 1, Next;
    RemUn = 0x5e, "rem.un", InlineNone, 2, 1, Next;
    And = 0x5f, "and", InlineNone, 2, 1, Next;
    Or = 0x60, "or", InlineNone, 2, 1, Next;
    Xor = 0x61, "xor", InlineNone, 2, 1, Next;
    Shl = 0x62, "shl", InlineNone, 2, 1, Next;
    Shr = 0x63, "shr", InlineNone, 2, 1, Next;
    ShrUn = 0x64, "shr.un", InlineNone, 2, 1, Next;
    Neg = 0x65, "neg", InlineNone, 1, 1, Next;
    Not = 0x66, "not", InlineNone, 1, 1, Next;
    ConvI1 = 0x67, "conv.i1", InlineNone, 1, 1, Next;
    ConvI2 = 0x68, "conv.i2", InlineNone, 1, 1, Next;
    ConvI4 = 0x69, "conv.i4", InlineNone, 1, 1, Next;
    ConvI8 = 0x6a, "conv.i8", InlineNone, 1, 1, Next;
    ConvR4 = 0x6b, "conv.r4", InlineNone, 1, 1, Next;
    ConvR8 = 0x6c, "conv.r8", InlineNone, 1, 1, Next;
    ConvU4 = 0x6d, "conv.u4", InlineNone, 1, 1, Next;
    ConvU8 = 0x6e, "conv.u8", InlineNone, 1, 1, Next;
    Callvirt = 0x6f, "callvirt", InlineMethod, V, V, Call;
    Cpobj = 0x70, "cpobj", InlineType, 2, 0, Next;
    Ldobj = 0x71, "ldobj", InlineType, 1, 1, Next;
    Ldstr = 0x72, "ldstr", InlineString, 0, 1, Next;
    Newobj = 0x73, "newobj", InlineMethod, V, 1, Call;
    Castclass = 0x74, "castclass", InlineType, 1, 1, Next;
    Isinst = 0x75, "isinst", InlineType, 1, 1, Next;
    ConvRUn = 0x76, "conv.r.un", InlineNone, 1, 1, Next;
    Unbox = 0x79, "unbox", InlineType, 1, 1, Next;
    Throw = 0x7a, "throw", InlineNone, 1, 0, Throw;
    Ldfld = 0x7b, "ldfld", InlineField, 1, 1, Next;
    Ldflda = 0x7c, "ldflda", InlineField, 1, 1, Next;
    Stfld = 0x7d, "stfld", InlineField, 2, 0, Next;
    Ldsfld = 0x7e, "ldsfld", InlineField, 0, 1, Next;
    Ldsflda = 0x7f, "ldsflda", InlineField, 0, 1, Next;
    Stsfld = 0x80, "stsfld", InlineField, 1, 0, Next;
    Stobj = 0x81, "stobj", InlineType, 2, 0, Next;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", InlineNone, 1, 1, Next;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", InlineNone, 1, 1, Next;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", InlineNone, 1, 1, Next;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", InlineNone, 1, 1, Next;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", InlineNone, 1, 1, Next;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", InlineNone, 1, 1, Next;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", InlineNone, 1, 1, Next;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", InlineNone, 1, 1, Next;
    ConvOvfIUn = 0x8a, "conv.ovf.i.un", InlineNone, 1, 1, Next;
    ConvOvfUUn = 0x8b, "conv.ovf.u.un", InlineNone, 1, 1, Next;
    Box = 0x8c, "box", InlineType, 1, 1, Next;
    Newarr = 0x8d, "newarr", InlineType, 1, 1, Next;
    Ldlen = 0x8e, "ldlen", InlineNone, 1, 1, Next;
    Ldelema = 0x8f, "ldelema", InlineType, 2, 1, Next;
    LdelemI1 = 0x90, "ldelem.i1", InlineNone, 2, 1, Next;
    LdelemU1 = 0x91, "ldelem.u1", InlineNone, 2, 1, Next;
    LdelemI2 = 0x92, "ldelem.i2", InlineNone, 2, 1, Next;
    LdelemU2 = 0x93, "ldelem.u2", InlineNone, 2, 1, Next;
    LdelemI4 = 0x94, "ldelem.i4", InlineNone, 2, 1, Next;
    LdelemU4 = 0x95, "ldelem.u4", InlineNone, 2, 1, Next;
    LdelemI8 = 0x96, "ldelem.i8", InlineNone, 2, 1, Next;
    LdelemI = 0x97, "ldelem.i", InlineNone, 2, 1, Next;
    LdelemR4 = 0x98, "ldelem.r4", InlineNone, 2, 1, Next;
    LdelemR8 = 0x99, "ldelem.r8", InlineNone, 2, 1, Next;
    LdelemRef = 0x9a, "ldelem.ref", InlineNone, 2, 1, Next;
    StelemI = 0x9b, "stelem.i", InlineNone, 3, 0, Next;
    StelemI1 = 0x9c, "stelem.i1", InlineNone, 3, 0, Next;
    StelemI2 = 0x9d, "stelem.i2", InlineNone, 3, 0, Next;
    StelemI4 = 0x9e, "stelem.i4", InlineNone, 3, 0, Next;
    StelemI8 = 0x9f, "stelem.i8", InlineNone, 3, 0, Next;
    StelemR4 = 0xa0, "stelem.r4", InlineNone, 3, 0, Next;
    StelemR8 = 0xa1, "stelem.r8", InlineNone, 3, 0, Next;
    StelemRef = 0xa2, "stelem.ref", InlineNone, 3, 0, Next;
    Ldelem = 0xa3, "ldelem", InlineType, 2, 1, Next;
    Stelem = 0xa4, "stelem", InlineType, 3, 0, Next;
    UnboxAny = 0xa5, "unbox.any", InlineType, 1, 1, Next;
    ConvOvfI1 = 0xb3, "conv.ovf.i1", InlineNone, 1, 1, Next;
    ConvOvfU1 = 0xb4, "conv.ovf.u1", InlineNone, 1, 1, Next;
    ConvOvfI2 = 0xb5, "conv.ovf.i2", InlineNone, 1, 1, Next;
    ConvOvfU2 = 0xb6, "conv.ovf.u2", InlineNone, 1, 1, Next;
    ConvOvfI4 = 0xb7, "conv.ovf.i4", InlineNone, 1, 1, Next;
    ConvOvfU4 = 0xb8, "conv.ovf.u4", InlineNone, 1, 1, Next;
    ConvOvfI8 = 0xb9, "conv.ovf.i8", InlineNone, 1, 1, Next;
    ConvOvfU8 = 0xba, "conv.ovf.u8", InlineNone, 1, 1, Next;
    Refanyval = 0xc2, "refanyval", InlineType, 1, 1, Next;
    Ckfinite = 0xc3, "ckfinite", InlineNone, 1, 1, Next;
    Mkrefany = 0xc6, "mkrefany", InlineType, 1, 1, Next;
    Ldtoken = 0xd0, "ldtoken", InlineTok, 0, 1, Next;
    ConvU2 = 0xd1, "conv.u2", InlineNone, 1, 1, Next;
    ConvU1 = 0xd2, "conv.u1", InlineNone, 1, 1, Next;
    ConvI = 0xd3, "conv.i", InlineNone, 1, 1, Next;
    ConvOvfI = 0xd4, "conv.ovf.i", InlineNone, 1, 1, Next;
    ConvOvfU = 0xd5, "conv.ovf.u", InlineNone, 1, 1, Next;
    AddOvf = 0xd6, "add.ovf", InlineNone, 2, 1, Next;
    AddOvfUn = 0xd7, "add.ovf.un", InlineNone, 2, 1, Next;
    MulOvf = 0xd8, "mul.ovf", InlineNone, 2, 1, Next;
    MulOvfUn = 0xd9, "mul.ovf.un", InlineNone, 2, 1, Next;
    SubOvf = 0xda, "sub.ovf", InlineNone, 2, 1, Next;
    SubOvfUn = 0xdb, "sub.ovf.un", InlineNone, 2, 1, Next;
    Endfinally = 0xdc, "endfinally", InlineNone, 0, 0, Return;
    Leave = 0xdd, "leave", InlineBrTarget, 0, 0, Branch;
    LeaveS = 0xde, "leave.s", ShortInlineBrTarget, 0, 0, Branch;
    StindI = 0xdf, "stind.i", InlineNone, 2, 0, Next;
    ConvU = 0xe0, "conv.u", InlineNone, 1, 1, Next;
    Arglist = 0xfe00, "arglist", InlineNone, 0, 1, Next;
    Ceq = 0xfe01, "ceq", InlineNone, 2, 1, Next;
    Cgt = 0xfe02, "cgt", InlineNone, 2, 1, Next;
    CgtUn = 0xfe03, "cgt.un", InlineNone, 2, 1, Next;
    Clt = 0xfe04, "clt", InlineNone, 2, 1, Next;
    CltUn = 0xfe05, "clt.un", InlineNone, 2, 1, Next;
    Ldftn = 0xfe06, "ldftn", InlineMethod, 0, 1, Next;
    Ldvirtftn = 0xfe07, "ldvirtftn", InlineMethod, 1, 1, Next;
    Ldarg = 0xfe09, "ldarg", InlineVar, 0, 1, Next;
    Ldarga = 0xfe0a, "ldarga", InlineVar, 0, 1, Next;
    Starg = 0xfe0b, "starg", InlineVar, 1, 0, Next;
    Ldloc = 0xfe0c, "ldloc", InlineVar, 0, 1, Next;
    Ldloca = 0xfe0d, "ldloca", InlineVar, 0, 1, Next;
    Stloc = 0xfe0e, "stloc", InlineVar, 1, 0, Next;
    Localloc = 0xfe0f, "localloc", InlineNone, 1, 1, Next;
    Endfilter = 0xfe11, "endfilter", InlineNone, 1, 0, Return;
    Unaligned = 0xfe12, "unaligned.", ShortInlineI, 0, 0, Meta;
    Volatile = 0xfe13, "volatile.", InlineNone, 0, 0, Meta;
    Tail = 0xfe14, "tail.", InlineNone, 0, 0, Meta;
    Initobj = 0xfe15, "initobj", InlineType, 1, 0, Next;
    Constrained = 0xfe16, "constrained.", InlineType, 0, 0, Meta;
    Cpblk = 0xfe17, "cpblk", InlineNone, 3, 0, Next;
    Initblk = 0xfe18, "initblk", InlineNone, 3, 0, Next;
    Rethrow = 0xfe1a, "rethrow", InlineNone, 0, 0, Throw;
    Sizeof = 0xfe1c, "sizeof", InlineType, 0, 1, Next;
    Refanytype = 0xfe1d, "refanytype", InlineNone, 1, 1, Next;
    Readonly = 0xfe1e, "readonly.", InlineNone, 0, 0, Meta;
}

/// Operand implied by a macro form, see [`OpCode::expand_macro`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpliedOperand {
    /// The operand is carried explicitly by the instruction
    Explicit,
    /// An argument or local index encoded in the opcode
    Index(u16),
    /// An integer constant encoded in the opcode
    Constant(i32),
}

impl OpCode {
    /// Size of the opcode itself, excluding the operand.
    #[must_use]
    pub fn size(self) -> u32 {
        if self.code() > 0xff {
            2
        } else {
            1
        }
    }

    /// Returns `true` for opcodes whose variable operand addresses an argument.
    #[must_use]
    pub fn addresses_argument(self) -> bool {
        matches!(
            self,
            OpCode::Ldarg0
                | OpCode::Ldarg1
                | OpCode::Ldarg2
                | OpCode::Ldarg3
                | OpCode::LdargS
                | OpCode::LdargaS
                | OpCode::StargS
                | OpCode::Ldarg
                | OpCode::Ldarga
                | OpCode::Starg
        )
    }

    /// Returns `true` for opcodes whose variable operand addresses a local.
    #[must_use]
    pub fn addresses_local(self) -> bool {
        matches!(
            self,
            OpCode::Ldloc0
                | OpCode::Ldloc1
                | OpCode::Ldloc2
                | OpCode::Ldloc3
                | OpCode::Stloc0
                | OpCode::Stloc1
                | OpCode::Stloc2
                | OpCode::Stloc3
                | OpCode::LdlocS
                | OpCode::LdlocaS
                | OpCode::StlocS
                | OpCode::Ldloc
                | OpCode::Ldloca
                | OpCode::Stloc
        )
    }

    /// Maps a macro form onto its general form.
    ///
    /// Short forms and forms with an operand encoded in the opcode are replaced with the long
    /// form that carries the operand explicitly, e.g. `ldarg.1` becomes `ldarg` with the
    /// implied index 1 and `br.s` becomes `br`. Opcodes that are already general are returned
    /// unchanged with [`ImpliedOperand::Explicit`].
    #[must_use]
    pub fn expand_macro(self) -> (OpCode, ImpliedOperand) {
        use ImpliedOperand::{Constant, Explicit, Index};
        match self {
            OpCode::Ldarg0 => (OpCode::Ldarg, Index(0)),
            OpCode::Ldarg1 => (OpCode::Ldarg, Index(1)),
            OpCode::Ldarg2 => (OpCode::Ldarg, Index(2)),
            OpCode::Ldarg3 => (OpCode::Ldarg, Index(3)),
            OpCode::Ldloc0 => (OpCode::Ldloc, Index(0)),
            OpCode::Ldloc1 => (OpCode::Ldloc, Index(1)),
            OpCode::Ldloc2 => (OpCode::Ldloc, Index(2)),
            OpCode::Ldloc3 => (OpCode::Ldloc, Index(3)),
            OpCode::Stloc0 => (OpCode::Stloc, Index(0)),
            OpCode::Stloc1 => (OpCode::Stloc, Index(1)),
            OpCode::Stloc2 => (OpCode::Stloc, Index(2)),
            OpCode::Stloc3 => (OpCode::Stloc, Index(3)),
            OpCode::LdargS => (OpCode::Ldarg, Explicit),
            OpCode::LdargaS => (OpCode::Ldarga, Explicit),
            OpCode::StargS => (OpCode::Starg, Explicit),
            OpCode::LdlocS => (OpCode::Ldloc, Explicit),
            OpCode::LdlocaS => (OpCode::Ldloca, Explicit),
            OpCode::StlocS => (OpCode::Stloc, Explicit),
            OpCode::LdcI4M1 => (OpCode::LdcI4, Constant(-1)),
            OpCode::LdcI40 => (OpCode::LdcI4, Constant(0)),
            OpCode::LdcI41 => (OpCode::LdcI4, Constant(1)),
            OpCode::LdcI42 => (OpCode::LdcI4, Constant(2)),
            OpCode::LdcI43 => (OpCode::LdcI4, Constant(3)),
            OpCode::LdcI44 => (OpCode::LdcI4, Constant(4)),
            OpCode::LdcI45 => (OpCode::LdcI4, Constant(5)),
            OpCode::LdcI46 => (OpCode::LdcI4, Constant(6)),
            OpCode::LdcI47 => (OpCode::LdcI4, Constant(7)),
            OpCode::LdcI48 => (OpCode::LdcI4, Constant(8)),
            OpCode::LdcI4S => (OpCode::LdcI4, Explicit),
            OpCode::BrS => (OpCode::Br, Explicit),
            OpCode::BrfalseS => (OpCode::Brfalse, Explicit),
            OpCode::BrtrueS => (OpCode::Brtrue, Explicit),
            OpCode::BeqS => (OpCode::Beq, Explicit),
            OpCode::BgeS => (OpCode::Bge, Explicit),
            OpCode::BgtS => (OpCode::Bgt, Explicit),
            OpCode::BleS => (OpCode::Ble, Explicit),
            OpCode::BltS => (OpCode::Blt, Explicit),
            OpCode::BneUnS => (OpCode::BneUn, Explicit),
            OpCode::BgeUnS => (OpCode::BgeUn, Explicit),
            OpCode::BgtUnS => (OpCode::BgtUn, Explicit),
            OpCode::BleUnS => (OpCode::BleUn, Explicit),
            OpCode::BltUnS => (OpCode::BltUn, Explicit),
            OpCode::LeaveS => (OpCode::Leave, Explicit),
            other => (other, Explicit),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
