//! Section layout of a metadata image.
//!
//! A metadata image is the serialized metadata graph of one module. It is not the PE/CLI
//! file a compiler produces: it carries the tables and method bodies the rewriter works on
//! and nothing else, so resources, native headers and strong-name signatures have to be
//! carried over by whatever exports and re-imports the module. PE/CLI input is recognized by
//! its DOS header and rejected with [`Error::PortableExecutable`].
//!
//! ```text
//! magic "DBMI" | version u16
//! identity      name, mvid, assembly name + version
//! assembly refs | module refs | type refs | member refs
//! types | fields | methods | properties | module attributes
//! ```
//!
//! Tables are written as a compressed row count followed by the rows, in table order, so row
//! ids survive a round trip unchanged. Instruction offsets are not stored; they are recomputed
//! from the encoded sizes on load, and branch targets are checked against them. After decoding,
//! every row id held anywhere in the module is checked against its table, so code working on a
//! loaded module can index tables directly.

use std::path::Path;

use uguid::Guid;

use crate::{
    file::{
        codec::{Decode, Encode},
        parser::Parser,
        writer::Writer,
        File,
    },
    metadata::{
        attributes::MethodAttributes,
        body::{
            encoded_size, ExceptionHandler, HandlerKind, Instruction, LocalVariable, MethodBody,
            Operand,
        },
        members::{
            FieldDef, GenericParam, MethodDef, ParamDef, PropertyDef, ReturnParam, TypeDef,
        },
        module::{AssemblyIdentity, Module},
        opcodes::{OpCode, OperandType},
        pinvoke::PInvokeInfo,
        references::{
            AssemblyRef, FieldHandle, MemberRef, MemberSig, MethodHandle, ModuleRef,
            ResolutionScope, TypeRef, Version,
        },
        token::{ModuleRefId, TypeId},
        typesystem::{MethodSig, TypeSig},
        walk::{walk_module, RefVisitor},
    },
    Error, Result,
};

/// Leading bytes of every metadata image.
pub const IMAGE_MAGIC: &[u8; 4] = b"DBMI";

/// Leading bytes of a PE file's DOS header.
const DOS_MAGIC: &[u8; 2] = b"MZ";

/// Current image format version.
pub const IMAGE_VERSION: u16 = 1;

impl Encode for AssemblyRef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.name.encode(w)?;
        self.version.encode(w)?;
        self.culture.encode(w)?;
        match &self.public_key_token {
            Some(token) => {
                w.write_bool(true);
                w.write_bytes(token);
            }
            None => w.write_bool(false),
        }
        Ok(())
    }
}

impl Decode for AssemblyRef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let name = String::decode(p)?;
        let version = Version::decode(p)?;
        let culture = Option::<String>::decode(p)?;
        let public_key_token = if p.read_bool()? {
            let mut token = [0u8; 8];
            token.copy_from_slice(p.read_bytes(8)?);
            Some(token)
        } else {
            None
        };
        Ok(AssemblyRef {
            name,
            version,
            culture,
            public_key_token,
        })
    }
}

impl Encode for ResolutionScope {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            ResolutionScope::Assembly(id) => {
                w.write_le(0u8);
                id.encode(w)
            }
            ResolutionScope::Module(id) => {
                w.write_le(1u8);
                id.encode(w)
            }
            ResolutionScope::Nested(id) => {
                w.write_le(2u8);
                id.encode(w)
            }
            ResolutionScope::CurrentModule => {
                w.write_le(3u8);
                Ok(())
            }
        }
    }
}

impl Decode for ResolutionScope {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(match p.read_le::<u8>()? {
            0 => ResolutionScope::Assembly(Decode::decode(p)?),
            1 => ResolutionScope::Module(Decode::decode(p)?),
            2 => ResolutionScope::Nested(Decode::decode(p)?),
            3 => ResolutionScope::CurrentModule,
            other => return Err(malformed_error!("Unknown resolution scope {}", other)),
        })
    }
}

impl Encode for TypeRef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.scope.encode(w)?;
        self.namespace.encode(w)?;
        self.name.encode(w)?;
        self.is_value_type.encode(w)
    }
}

impl Decode for TypeRef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(TypeRef {
            scope: Decode::decode(p)?,
            namespace: Decode::decode(p)?,
            name: Decode::decode(p)?,
            is_value_type: Decode::decode(p)?,
        })
    }
}

impl Encode for MemberRef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.parent.encode(w)?;
        self.name.encode(w)?;
        self.signature.encode(w)
    }
}

impl Decode for MemberRef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(MemberRef {
            parent: Decode::decode(p)?,
            name: Decode::decode(p)?,
            signature: MemberSig::decode(p)?,
        })
    }
}

impl Encode for GenericParam {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.number.encode(w)?;
        self.flags.encode(w)?;
        self.name.encode(w)?;
        self.constraints.encode(w)
    }
}

impl Decode for GenericParam {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(GenericParam {
            number: Decode::decode(p)?,
            flags: Decode::decode(p)?,
            name: Decode::decode(p)?,
            constraints: Decode::decode(p)?,
        })
    }
}

impl Encode for TypeDef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.flags.encode(w)?;
        self.namespace.encode(w)?;
        self.name.encode(w)?;
        self.extends.encode(w)?;
        self.interfaces.encode(w)?;
        self.enclosing.encode(w)?;
        self.nested.encode(w)?;
        self.fields.encode(w)?;
        self.methods.encode(w)?;
        self.properties.encode(w)?;
        self.generic_params.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for TypeDef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(TypeDef {
            flags: Decode::decode(p)?,
            namespace: Decode::decode(p)?,
            name: Decode::decode(p)?,
            extends: Decode::decode(p)?,
            interfaces: Decode::decode(p)?,
            enclosing: Decode::decode(p)?,
            nested: Decode::decode(p)?,
            fields: Decode::decode(p)?,
            methods: Decode::decode(p)?,
            properties: Decode::decode(p)?,
            generic_params: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        })
    }
}

impl Encode for FieldDef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.owner.encode(w)?;
        self.flags.encode(w)?;
        self.name.encode(w)?;
        self.field_type.encode(w)?;
        self.marshal.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for FieldDef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(FieldDef {
            owner: Decode::decode(p)?,
            flags: Decode::decode(p)?,
            name: Decode::decode(p)?,
            field_type: Decode::decode(p)?,
            marshal: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        })
    }
}

impl Encode for PropertyDef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.owner.encode(w)?;
        self.flags.encode(w)?;
        self.name.encode(w)?;
        self.property_type.encode(w)?;
        self.getter.encode(w)?;
        self.setter.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for PropertyDef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(PropertyDef {
            owner: Decode::decode(p)?,
            flags: Decode::decode(p)?,
            name: Decode::decode(p)?,
            property_type: Decode::decode(p)?,
            getter: Decode::decode(p)?,
            setter: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        })
    }
}

impl Encode for ParamDef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.flags.encode(w)?;
        self.name.encode(w)?;
        self.marshal.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for ParamDef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(ParamDef {
            flags: Decode::decode(p)?,
            name: Decode::decode(p)?,
            marshal: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        })
    }
}

impl Encode for ReturnParam {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.marshal.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for ReturnParam {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(ReturnParam {
            marshal: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        })
    }
}

impl Encode for PInvokeInfo {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(self.flags);
        self.entry_point.encode(w)?;
        self.module.encode(w)
    }
}

impl Decode for PInvokeInfo {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(PInvokeInfo {
            flags: p.read_le()?,
            entry_point: Decode::decode(p)?,
            module: ModuleRefId::decode(p)?,
        })
    }
}

fn encode_operand(instr: &Instruction, w: &mut Writer) -> Result<()> {
    let mismatch = || {
        malformed_error!(
            "Operand {:?} does not fit {} at IL_{:04x}",
            instr.operand,
            instr.opcode,
            instr.offset
        )
    };
    match (instr.opcode.operand_type(), &instr.operand) {
        (OperandType::InlineNone, Operand::None) => Ok(()),
        (OperandType::ShortInlineVar | OperandType::InlineVar, Operand::Local(n) | Operand::Arg(n)) => {
            n.encode(w)
        }
        (OperandType::ShortInlineI | OperandType::InlineI, Operand::I4(v)) => {
            w.write_le(*v);
            Ok(())
        }
        (OperandType::InlineI8, Operand::I8(v)) => {
            w.write_le(*v);
            Ok(())
        }
        (OperandType::ShortInlineR, Operand::R4(v)) => {
            w.write_le(*v);
            Ok(())
        }
        (OperandType::InlineR, Operand::R8(v)) => {
            w.write_le(*v);
            Ok(())
        }
        (OperandType::InlineString, Operand::String(s)) => s.encode(w),
        (OperandType::InlineType, Operand::Type(sig)) => sig.encode(w),
        (OperandType::InlineField, Operand::Field(handle)) => handle.encode(w),
        (OperandType::InlineMethod, Operand::Method(handle)) => handle.encode(w),
        (OperandType::InlineTok, operand) => match operand {
            Operand::Type(sig) => {
                w.write_le(0u8);
                sig.encode(w)
            }
            Operand::Field(handle) => {
                w.write_le(1u8);
                handle.encode(w)
            }
            Operand::Method(handle) => {
                w.write_le(2u8);
                handle.encode(w)
            }
            _ => Err(mismatch()),
        },
        (OperandType::InlineSig, Operand::Sig(sig)) => sig.encode(w),
        (OperandType::ShortInlineBrTarget | OperandType::InlineBrTarget, Operand::Target(target)) => {
            w.write_compressed_uint(*target)
        }
        (OperandType::InlineSwitch, Operand::Switch(targets)) => {
            w.write_count(targets.len())?;
            for target in targets {
                w.write_compressed_uint(*target)?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

fn decode_operand(opcode: OpCode, p: &mut Parser<'_>) -> Result<Operand> {
    Ok(match opcode.operand_type() {
        OperandType::InlineNone => Operand::None,
        OperandType::ShortInlineVar | OperandType::InlineVar => {
            let index = u16::decode(p)?;
            if opcode.addresses_local() {
                Operand::Local(index)
            } else {
                Operand::Arg(index)
            }
        }
        OperandType::ShortInlineI | OperandType::InlineI => Operand::I4(p.read_le()?),
        OperandType::InlineI8 => Operand::I8(p.read_le()?),
        OperandType::ShortInlineR => Operand::R4(p.read_le()?),
        OperandType::InlineR => Operand::R8(p.read_le()?),
        OperandType::InlineString => Operand::String(String::decode(p)?),
        OperandType::InlineType => Operand::Type(TypeSig::decode(p)?),
        OperandType::InlineField => Operand::Field(FieldHandle::decode(p)?),
        OperandType::InlineMethod => Operand::Method(MethodHandle::decode(p)?),
        OperandType::InlineTok => match p.read_le::<u8>()? {
            0 => Operand::Type(TypeSig::decode(p)?),
            1 => Operand::Field(FieldHandle::decode(p)?),
            2 => Operand::Method(MethodHandle::decode(p)?),
            other => return Err(malformed_error!("Unknown token operand kind {}", other)),
        },
        OperandType::InlineSig => Operand::Sig(MethodSig::decode(p)?),
        OperandType::ShortInlineBrTarget | OperandType::InlineBrTarget => {
            Operand::Target(p.read_compressed_uint()?)
        }
        OperandType::InlineSwitch => {
            let count = p.read_count()?;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(p.read_compressed_uint()?);
            }
            Operand::Switch(targets)
        }
    })
}

impl Encode for HandlerKind {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            HandlerKind::Catch(sig) => {
                w.write_le(0u8);
                sig.encode(w)
            }
            HandlerKind::Filter(offset) => {
                w.write_le(1u8);
                w.write_compressed_uint(*offset)
            }
            HandlerKind::Finally => {
                w.write_le(2u8);
                Ok(())
            }
            HandlerKind::Fault => {
                w.write_le(4u8);
                Ok(())
            }
        }
    }
}

impl Decode for HandlerKind {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(match p.read_le::<u8>()? {
            0 => HandlerKind::Catch(TypeSig::decode(p)?),
            1 => HandlerKind::Filter(p.read_compressed_uint()?),
            2 => HandlerKind::Finally,
            4 => HandlerKind::Fault,
            other => return Err(malformed_error!("Unknown handler kind {}", other)),
        })
    }
}

impl Encode for MethodBody {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(self.max_stack);
        w.write_bool(self.init_locals);
        w.write_count(self.locals.len())?;
        for local in &self.locals {
            local.local_type.encode(w)?;
            w.write_bool(local.pinned);
        }
        w.write_count(self.instructions.len())?;
        for instr in &self.instructions {
            let code = instr.opcode.code();
            if code > 0xff {
                w.write_le(0xFEu8);
            }
            w.write_le((code & 0xff) as u8);
            encode_operand(instr, w)?;
        }
        w.write_count(self.exception_handlers.len())?;
        for handler in &self.exception_handlers {
            handler.kind.encode(w)?;
            w.write_compressed_uint(handler.try_start)?;
            w.write_compressed_uint(handler.try_end)?;
            w.write_compressed_uint(handler.handler_start)?;
            w.write_compressed_uint(handler.handler_end)?;
        }
        Ok(())
    }
}

impl Decode for MethodBody {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let max_stack = p.read_le()?;
        let init_locals = p.read_bool()?;
        let local_count = p.read_count()?;
        let mut locals = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            locals.push(LocalVariable {
                local_type: TypeSig::decode(p)?,
                pinned: p.read_bool()?,
            });
        }

        let count = p.read_count()?;
        let mut instructions = Vec::with_capacity(count);
        let mut offset = 0u32;
        for _ in 0..count {
            let first = p.read_le::<u8>()?;
            let code = if first == 0xFE {
                0xFE00 | u16::from(p.read_le::<u8>()?)
            } else {
                u16::from(first)
            };
            let opcode = OpCode::from_code(code)
                .ok_or_else(|| malformed_error!("Unknown opcode 0x{:04x} at IL_{:04x}", code, offset))?;
            let operand = decode_operand(opcode, p)?;
            let size = encoded_size(opcode, &operand);
            instructions.push(Instruction {
                offset,
                opcode,
                operand,
            });
            offset = offset
                .checked_add(size)
                .ok_or_else(|| malformed_error!("Method body exceeds 4 GiB"))?;
        }

        let handler_count = p.read_count()?;
        let mut exception_handlers = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            exception_handlers.push(ExceptionHandler {
                kind: HandlerKind::decode(p)?,
                try_start: p.read_compressed_uint()?,
                try_end: p.read_compressed_uint()?,
                handler_start: p.read_compressed_uint()?,
                handler_end: p.read_compressed_uint()?,
            });
        }

        let body = MethodBody {
            max_stack,
            init_locals,
            locals,
            instructions,
            exception_handlers,
        };
        check_body_offsets(&body)?;
        Ok(body)
    }
}

fn check_body_offsets(body: &MethodBody) -> Result<()> {
    let end = body.code_size();
    let starts = |offset: u32| body.index_of(offset).is_some();
    let bound = |offset: u32| offset == end || starts(offset);
    for instr in &body.instructions {
        for target in instr.targets() {
            if !starts(target) {
                return Err(malformed_error!(
                    "Branch at IL_{:04x} targets IL_{:04x}, which is not an instruction",
                    instr.offset,
                    target
                ));
            }
        }
    }
    for handler in &body.exception_handlers {
        let filter_ok = match handler.kind {
            HandlerKind::Filter(filter) => starts(filter),
            _ => true,
        };
        if !(starts(handler.try_start)
            && bound(handler.try_end)
            && starts(handler.handler_start)
            && bound(handler.handler_end)
            && filter_ok)
        {
            return Err(malformed_error!(
                "Exception handler IL_{:04x}-IL_{:04x} does not align with instructions",
                handler.try_start,
                handler.try_end
            ));
        }
    }
    Ok(())
}

impl Encode for MethodDef {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.owner.encode(w)?;
        self.flags.encode(w)?;
        self.impl_flags.encode(w)?;
        self.name.encode(w)?;
        self.signature.encode(w)?;
        self.params.encode(w)?;
        self.return_param.encode(w)?;
        self.generic_params.encode(w)?;
        self.pinvoke.encode(w)?;
        self.body.encode(w)?;
        self.custom_attributes.encode(w)
    }
}

impl Decode for MethodDef {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let method = MethodDef {
            owner: Decode::decode(p)?,
            flags: MethodAttributes::decode(p)?,
            impl_flags: Decode::decode(p)?,
            name: Decode::decode(p)?,
            signature: Decode::decode(p)?,
            params: Decode::decode(p)?,
            return_param: Decode::decode(p)?,
            generic_params: Decode::decode(p)?,
            pinvoke: Decode::decode(p)?,
            body: Decode::decode(p)?,
            custom_attributes: Decode::decode(p)?,
        };
        if method.params.len() != method.signature.params.len() {
            return Err(malformed_error!(
                "Method {} has {} parameter rows for {} parameters",
                method.name,
                method.params.len(),
                method.signature.params.len()
            ));
        }
        Ok(method)
    }
}

#[derive(Default)]
struct RangeCheck {
    types: usize,
    methods: usize,
    fields: usize,
    type_refs: usize,
    member_refs: usize,
    module_refs: usize,
    violation: Option<String>,
}

impl RangeCheck {
    fn check(&mut self, what: &str, index: usize, len: usize) {
        if index >= len && self.violation.is_none() {
            self.violation = Some(format!("{what} #{index} is out of range (table has {len} rows)"));
        }
    }
}

impl RefVisitor for RangeCheck {
    fn type_sig(&mut self, sig: &mut TypeSig) {
        match sig {
            TypeSig::Def(id) => self.check("TypeDef", id.index(), self.types),
            TypeSig::Ref(id) => self.check("TypeRef", id.index(), self.type_refs),
            _ => {}
        }
    }

    fn method(&mut self, handle: &mut MethodHandle) {
        match handle {
            MethodHandle::Def(id) => self.check("MethodDef", id.index(), self.methods),
            MethodHandle::Ref(id) => self.check("MemberRef", id.index(), self.member_refs),
            MethodHandle::Spec { .. } => {}
        }
    }

    fn field(&mut self, handle: &mut FieldHandle) {
        match handle {
            FieldHandle::Def(id) => self.check("Field", id.index(), self.fields),
            FieldHandle::Ref(id) => self.check("MemberRef", id.index(), self.member_refs),
        }
    }

    fn module_ref(&mut self, id: &mut ModuleRefId) {
        self.check("ModuleRef", id.index(), self.module_refs);
    }
}

fn check_ranges(module: &mut Module) -> Result<()> {
    let mut check = RangeCheck {
        types: module.types.len(),
        methods: module.methods.len(),
        fields: module.fields.len(),
        type_refs: module.type_refs.len(),
        member_refs: module.member_refs.len(),
        module_refs: module.module_refs.len(),
        violation: None,
    };
    walk_module(module, &mut check);

    let properties = module.properties.len();
    let assembly_refs = module.assembly_refs.len();
    for def in &module.types {
        if let Some(enclosing) = def.enclosing {
            check.check("TypeDef", enclosing.index(), check.types);
        }
        for id in &def.nested {
            check.check("TypeDef", id.index(), check.types);
        }
        for id in &def.methods {
            check.check("MethodDef", id.index(), check.methods);
        }
        for id in &def.fields {
            check.check("Field", id.index(), check.fields);
        }
        for id in &def.properties {
            check.check("Property", id.index(), properties);
        }
    }
    let owners = module
        .methods
        .iter()
        .map(|m| m.owner)
        .chain(module.fields.iter().map(|f| f.owner))
        .chain(module.properties.iter().map(|p| p.owner))
        .collect::<Vec<TypeId>>();
    for owner in owners {
        check.check("TypeDef", owner.index(), check.types);
    }
    for property in &module.properties {
        for accessor in property.getter.iter().chain(property.setter.iter()) {
            check.check("MethodDef", accessor.index(), check.methods);
        }
    }
    for reference in &module.type_refs {
        match reference.scope {
            ResolutionScope::Assembly(id) => check.check("AssemblyRef", id.index(), assembly_refs),
            ResolutionScope::Module(id) => check.check("ModuleRef", id.index(), check.module_refs),
            ResolutionScope::Nested(id) => check.check("TypeRef", id.index(), check.type_refs),
            ResolutionScope::CurrentModule => {}
        }
    }

    match check.violation {
        Some(violation) => Err(malformed_error!("{}", violation)),
        None => Ok(()),
    }
}

impl Module {
    /// Loads a module image from disk.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be read,
    /// [`Error::PortableExecutable`] for a compiled PE/CLI file, [`Error::NotSupported`] for
    /// any other foreign file, and [`Error::Malformed`] / [`Error::OutOfBounds`] for damaged
    /// images.
    pub fn from_file(path: &Path) -> Result<Module> {
        let file = File::from_file(path)?;
        Module::from_bytes(file.data())
    }

    /// Decodes a module image.
    ///
    /// # Errors
    /// See [`Module::from_file`].
    pub fn from_bytes(data: &[u8]) -> Result<Module> {
        if data.starts_with(DOS_MAGIC) {
            return Err(Error::PortableExecutable);
        }
        let mut p = Parser::new(data);
        if p.remaining() < IMAGE_MAGIC.len() + 2 || p.read_bytes(4)? != IMAGE_MAGIC {
            return Err(Error::NotSupported);
        }
        let version = p.read_le::<u16>()?;
        if version != IMAGE_VERSION {
            return Err(Error::NotSupported);
        }

        let name = String::decode(&mut p)?;
        let mut mvid = [0u8; 16];
        mvid.copy_from_slice(p.read_bytes(16)?);
        let assembly = if p.read_bool()? {
            Some(AssemblyIdentity {
                name: String::decode(&mut p)?,
                version: Version::decode(&mut p)?,
            })
        } else {
            None
        };

        let mut module = Module {
            name,
            mvid: Guid::from_bytes(mvid),
            assembly,
            assembly_refs: Decode::decode(&mut p)?,
            module_refs: Vec::<String>::decode(&mut p)?
                .into_iter()
                .map(|name| ModuleRef { name })
                .collect(),
            type_refs: Decode::decode(&mut p)?,
            member_refs: Decode::decode(&mut p)?,
            types: Decode::decode(&mut p)?,
            fields: Decode::decode(&mut p)?,
            methods: Decode::decode(&mut p)?,
            properties: Decode::decode(&mut p)?,
            custom_attributes: Decode::decode(&mut p)?,
        };
        if p.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes after the last section",
                p.remaining()
            ));
        }
        check_ranges(&mut module)?;
        Ok(module)
    }

    /// Encodes the module as an image.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a value cannot be represented, for example an operand
    /// that does not match its opcode.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_bytes(IMAGE_MAGIC);
        w.write_le(IMAGE_VERSION);

        self.name.encode(&mut w)?;
        w.write_bytes(&self.mvid.to_bytes());
        match &self.assembly {
            Some(identity) => {
                w.write_bool(true);
                identity.name.encode(&mut w)?;
                identity.version.encode(&mut w)?;
            }
            None => w.write_bool(false),
        }

        self.assembly_refs.encode(&mut w)?;
        w.write_count(self.module_refs.len())?;
        for module_ref in &self.module_refs {
            module_ref.name.encode(&mut w)?;
        }
        self.type_refs.encode(&mut w)?;
        self.member_refs.encode(&mut w)?;
        self.types.encode(&mut w)?;
        self.fields.encode(&mut w)?;
        self.methods.encode(&mut w)?;
        self.properties.encode(&mut w)?;
        self.custom_attributes.encode(&mut w)?;
        Ok(w.into_inner())
    }

    /// Encodes the module and writes it to `path`.
    ///
    /// The image is fully encoded before the file is touched, so an encoding failure leaves an
    /// existing file untouched.
    ///
    /// # Errors
    /// See [`Module::to_bytes`]; I/O failures are reported as [`Error::FileError`].
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        attributes::{FieldAttributes, TypeAttributes},
        emitter::BodyEmitter,
        marshalling::{MarshalInfo, NATIVE_TYPE},
        pinvoke::PInvokeAttributes,
        references::FieldHandle,
    };

    fn sample() -> Result<Module> {
        let mut module = Module::new("Sample.dll", "Sample");
        module.mvid = Guid::from_bytes([7; 16]);
        let object = module.core_type("System", "Object", false);
        let owner = module.add_type(TypeDef::new("Sample", "Native", TypeAttributes::PUBLIC, Some(object)));
        let counter = module.add_field(FieldDef::new(owner, "counter", FieldAttributes::STATIC, TypeSig::I4));
        let libc = module.add_module_ref("libc");

        let mut puts = MethodDef::new(
            owner,
            "puts",
            MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::String]),
        );
        puts.params[0] = ParamDef::new("s").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR));
        puts.pinvoke = Some(PInvokeInfo {
            flags: PInvokeAttributes::CALL_CONV_CDECL,
            entry_point: None,
            module: libc,
        });
        module.add_method(puts);

        let mut bump = MethodDef::new(owner, "Bump", MethodAttributes::STATIC, MethodSig::new_static(TypeSig::Void, vec![]));
        let mut e = BodyEmitter::new();
        let head = e.define_label();
        let done = e.define_label();
        e.mark_label(head);
        e.ldsfld(FieldHandle::Def(counter));
        e.ldc_i4(100);
        e.branch(OpCode::Bge, done);
        e.ldsfld(FieldHandle::Def(counter));
        e.ldc_i4(1);
        e.emit(OpCode::Add);
        e.stsfld(FieldHandle::Def(counter));
        e.branch(OpCode::Br, head);
        e.mark_label(done);
        e.ret();
        bump.body = Some(e.finish()?);
        module.add_method(bump);
        Ok(module)
    }

    #[test]
    fn image_preserves_module() -> Result<()> {
        let module = sample()?;
        let bytes = module.to_bytes()?;
        assert_eq!(&bytes[..4], IMAGE_MAGIC);
        let decoded = Module::from_bytes(&bytes)?;
        assert_eq!(decoded.mvid, module.mvid);
        assert_eq!(decoded.types, module.types);
        assert_eq!(decoded.methods, module.methods);
        assert_eq!(decoded.type_refs, module.type_refs);
        assert_eq!(decoded.module_refs, module.module_refs);
        Ok(())
    }

    #[test]
    fn foreign_and_truncated_images() -> Result<()> {
        assert!(matches!(Module::from_bytes(b"ELF\x02\x01\x01"), Err(Error::NotSupported)));
        let bytes = sample()?.to_bytes()?;
        let truncated = &bytes[..bytes.len() - 3];
        assert!(Module::from_bytes(truncated).is_err());

        let mut newer = bytes.clone();
        newer[4] = 2;
        assert!(matches!(Module::from_bytes(&newer), Err(Error::NotSupported)));
        Ok(())
    }

    #[test]
    fn compiled_executables_are_named_as_such() {
        let mut dos = vec![0u8; 0x80];
        dos[..2].copy_from_slice(b"MZ");
        dos[0x3c] = 0x40;
        assert!(matches!(Module::from_bytes(&dos), Err(Error::PortableExecutable)));
        let message = Error::PortableExecutable.to_string();
        assert!(message.contains("metadata image"));
    }

    #[test]
    fn dangling_ids_are_rejected() -> Result<()> {
        let mut module = sample()?;
        module.fields[0].field_type = TypeSig::Def(TypeId(42));
        let bytes = module.to_bytes()?;
        assert!(matches!(Module::from_bytes(&bytes), Err(Error::Malformed { .. })));
        Ok(())
    }

    #[test]
    fn write_then_read_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sample.dbm");
        let module = sample()?;
        module.write_to(&path)?;
        let loaded = Module::from_file(&path)?;
        assert_eq!(loaded.name, "Sample.dll");
        assert_eq!(loaded.methods.len(), 2);
        Ok(())
    }
}
