//! Binary encoding of metadata values.
//!
//! [`Encode`] and [`Decode`] are implemented for every value that appears in a module image:
//! primitives, strings, row ids, attribute words, signatures, handles, marshal descriptors and
//! custom attributes. Signatures follow the element type layout of ECMA-335 II.23.2 with two
//! private tags, [`ELEMENT_TYPE::DEF_HANDLE`] and [`ELEMENT_TYPE::REF_HANDLE`], standing in for
//! the `TypeDefOrRef` coded index.

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{
        attributes::{
            FieldAttributes, GenericParamAttributes, MethodAttributes, MethodImplAttributes,
            ParamAttributes, PropertyAttributes, TypeAttributes,
        },
        customattributes::{AttributeArgument, CustomAttribute, NamedArgument},
        marshalling::{CustomMarshalerSpec, MarshalInfo},
        references::{FieldHandle, MemberSig, MethodHandle, Version},
        token::{
            AssemblyRefId, FieldId, MemberRefId, MethodId, ModuleRefId, PropertyId, TypeId,
            TypeRefId,
        },
        typesystem::{CallingConvention, MethodSig, TypeSig, ELEMENT_TYPE},
    },
    Result,
};

/// Signature nesting deeper than this is rejected as malformed.
const MAX_SIG_DEPTH: usize = 64;

/// Writes a value into a module image.
pub trait Encode {
    /// Appends the encoding of `self`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the value cannot be represented.
    fn encode(&self, w: &mut Writer) -> Result<()>;
}

/// Reads a value from a module image.
pub trait Decode: Sized {
    /// Reads one value.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] for damaged input.
    fn decode(p: &mut Parser<'_>) -> Result<Self>;
}

impl Encode for bool {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_bool(*self);
        Ok(())
    }
}

impl Decode for bool {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        p.read_bool()
    }
}

impl Encode for u8 {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(*self);
        Ok(())
    }
}

impl Decode for u8 {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        p.read_le()
    }
}

impl Encode for u16 {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_compressed_uint(u32::from(*self))
    }
}

impl Decode for u16 {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let value = p.read_compressed_uint()?;
        u16::try_from(value).map_err(|_| malformed_error!("Value {} exceeds 16 bits", value))
    }
}

impl Encode for u32 {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(*self);
        Ok(())
    }
}

impl Decode for u32 {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        p.read_le()
    }
}

impl Encode for String {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_string(self)
    }
}

impl Decode for String {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        p.read_string()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            Some(value) => {
                w.write_bool(true);
                value.encode(w)
            }
            None => {
                w.write_bool(false);
                Ok(())
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        if p.read_bool()? {
            Ok(Some(T::decode(p)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_count(self.len())?;
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let count = p.read_count()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(p)?);
        }
        Ok(items)
    }
}

macro_rules! id_codec {
    ($($id:ident),*) => {
        $(
            impl Encode for $id {
                fn encode(&self, w: &mut Writer) -> Result<()> {
                    w.write_compressed_uint(self.0)
                }
            }

            impl Decode for $id {
                fn decode(p: &mut Parser<'_>) -> Result<Self> {
                    Ok($id(p.read_compressed_uint()?))
                }
            }
        )*
    };
}

id_codec!(TypeId, MethodId, FieldId, PropertyId, TypeRefId, MemberRefId, ModuleRefId, AssemblyRefId);

macro_rules! flags_codec {
    ($($flags:ident: $bits:ty),*) => {
        $(
            impl Encode for $flags {
                fn encode(&self, w: &mut Writer) -> Result<()> {
                    w.write_le::<$bits>(self.bits());
                    Ok(())
                }
            }

            impl Decode for $flags {
                fn decode(p: &mut Parser<'_>) -> Result<Self> {
                    Ok($flags::from_bits_retain(p.read_le::<$bits>()?))
                }
            }
        )*
    };
}

flags_codec!(
    TypeAttributes: u32,
    MethodAttributes: u16,
    MethodImplAttributes: u16,
    FieldAttributes: u16,
    ParamAttributes: u16,
    GenericParamAttributes: u16,
    PropertyAttributes: u16
);

impl Encode for Version {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(self.major);
        w.write_le(self.minor);
        w.write_le(self.build);
        w.write_le(self.revision);
        Ok(())
    }
}

impl Decode for Version {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(Version::new(
            p.read_le()?,
            p.read_le()?,
            p.read_le()?,
            p.read_le()?,
        ))
    }
}

fn encode_sig(sig: &TypeSig, w: &mut Writer) -> Result<()> {
    if let Some(code) = sig.primitive_code() {
        w.write_le(code);
        return Ok(());
    }
    match sig {
        TypeSig::Def(id) => {
            w.write_le(ELEMENT_TYPE::DEF_HANDLE);
            id.encode(w)
        }
        TypeSig::Ref(id) => {
            w.write_le(ELEMENT_TYPE::REF_HANDLE);
            id.encode(w)
        }
        TypeSig::Ptr(inner) => {
            w.write_le(ELEMENT_TYPE::PTR);
            encode_sig(inner, w)
        }
        TypeSig::ByRef(inner) => {
            w.write_le(ELEMENT_TYPE::BYREF);
            encode_sig(inner, w)
        }
        TypeSig::Pinned(inner) => {
            w.write_le(ELEMENT_TYPE::PINNED);
            encode_sig(inner, w)
        }
        TypeSig::SzArray(inner) => {
            w.write_le(ELEMENT_TYPE::SZARRAY);
            encode_sig(inner, w)
        }
        TypeSig::ModOpt { modifier, inner } | TypeSig::ModReq { modifier, inner } => {
            let tag = if matches!(sig, TypeSig::ModOpt { .. }) {
                ELEMENT_TYPE::CMOD_OPT
            } else {
                ELEMENT_TYPE::CMOD_REQD
            };
            w.write_le(tag);
            encode_sig(modifier, w)?;
            encode_sig(inner, w)
        }
        TypeSig::GenericInst {
            generic,
            args,
            value_type,
        } => {
            w.write_le(ELEMENT_TYPE::GENERICINST);
            w.write_bool(*value_type);
            encode_sig(generic, w)?;
            w.write_count(args.len())?;
            for arg in args {
                encode_sig(arg, w)?;
            }
            Ok(())
        }
        TypeSig::Var(n) => {
            w.write_le(ELEMENT_TYPE::VAR);
            n.encode(w)
        }
        TypeSig::MVar(n) => {
            w.write_le(ELEMENT_TYPE::MVAR);
            n.encode(w)
        }
        TypeSig::FnPtr(method) => {
            w.write_le(ELEMENT_TYPE::FNPTR);
            method.encode(w)
        }
        primitive => Err(malformed_error!("Unencodable signature {:?}", primitive)),
    }
}

fn decode_sig(p: &mut Parser<'_>, depth: usize) -> Result<TypeSig> {
    if depth > MAX_SIG_DEPTH {
        return Err(malformed_error!("Signature nesting exceeds {} levels", MAX_SIG_DEPTH));
    }
    let offset = p.pos();
    let code = p.read_le::<u8>()?;
    if let Some(primitive) = TypeSig::from_primitive_code(code) {
        return Ok(primitive);
    }
    let next = depth + 1;
    Ok(match code {
        ELEMENT_TYPE::DEF_HANDLE => TypeSig::Def(TypeId::decode(p)?),
        ELEMENT_TYPE::REF_HANDLE => TypeSig::Ref(TypeRefId::decode(p)?),
        ELEMENT_TYPE::PTR => TypeSig::Ptr(Box::new(decode_sig(p, next)?)),
        ELEMENT_TYPE::BYREF => TypeSig::ByRef(Box::new(decode_sig(p, next)?)),
        ELEMENT_TYPE::PINNED => TypeSig::Pinned(Box::new(decode_sig(p, next)?)),
        ELEMENT_TYPE::SZARRAY => TypeSig::SzArray(Box::new(decode_sig(p, next)?)),
        ELEMENT_TYPE::CMOD_OPT => TypeSig::ModOpt {
            modifier: Box::new(decode_sig(p, next)?),
            inner: Box::new(decode_sig(p, next)?),
        },
        ELEMENT_TYPE::CMOD_REQD => TypeSig::ModReq {
            modifier: Box::new(decode_sig(p, next)?),
            inner: Box::new(decode_sig(p, next)?),
        },
        ELEMENT_TYPE::GENERICINST => {
            let value_type = p.read_bool()?;
            let generic = Box::new(decode_sig(p, next)?);
            let count = p.read_count()?;
            let mut args = Vec::with_capacity(count);
            for _ in 0..count {
                args.push(decode_sig(p, next)?);
            }
            TypeSig::GenericInst {
                generic,
                args,
                value_type,
            }
        }
        ELEMENT_TYPE::VAR => TypeSig::Var(u16::decode(p)?),
        ELEMENT_TYPE::MVAR => TypeSig::MVar(u16::decode(p)?),
        ELEMENT_TYPE::FNPTR => TypeSig::FnPtr(Box::new(decode_method_sig(p, next)?)),
        other => {
            return Err(malformed_error!(
                "Unknown element type 0x{:02x} at offset {}",
                other,
                offset
            ))
        }
    })
}

impl Encode for TypeSig {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        encode_sig(self, w)
    }
}

impl Decode for TypeSig {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        decode_sig(p, 0)
    }
}

const HAS_THIS: u8 = 0x20;
const EXPLICIT_THIS: u8 = 0x40;
const GENERIC: u8 = 0x10;

impl Encode for MethodSig {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        let mut header = self.call_conv.code();
        if self.has_this {
            header |= HAS_THIS;
        }
        if self.explicit_this {
            header |= EXPLICIT_THIS;
        }
        if self.generic_param_count > 0 {
            header |= GENERIC;
        }
        w.write_le(header);
        if self.generic_param_count > 0 {
            self.generic_param_count.encode(w)?;
        }
        w.write_count(self.params.len())?;
        encode_sig(&self.ret, w)?;
        for param in &self.params {
            encode_sig(param, w)?;
        }
        Ok(())
    }
}

fn decode_method_sig(p: &mut Parser<'_>, depth: usize) -> Result<MethodSig> {
    let header = p.read_le::<u8>()?;
    let call_conv = CallingConvention::from_code(header)
        .ok_or_else(|| malformed_error!("Unknown calling convention 0x{:02x}", header))?;
    let generic_param_count = if header & GENERIC != 0 {
        u16::decode(p)?
    } else {
        0
    };
    let count = p.read_count()?;
    let ret = decode_sig(p, depth)?;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        params.push(decode_sig(p, depth)?);
    }
    Ok(MethodSig {
        has_this: header & HAS_THIS != 0,
        explicit_this: header & EXPLICIT_THIS != 0,
        call_conv,
        generic_param_count,
        ret,
        params,
    })
}

impl Decode for MethodSig {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        decode_method_sig(p, 0)
    }
}

impl Encode for MemberSig {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            MemberSig::Method(sig) => {
                w.write_le(0u8);
                sig.encode(w)
            }
            MemberSig::Field(sig) => {
                w.write_le(1u8);
                sig.encode(w)
            }
        }
    }
}

impl Decode for MemberSig {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        match p.read_le::<u8>()? {
            0 => Ok(MemberSig::Method(MethodSig::decode(p)?)),
            1 => Ok(MemberSig::Field(TypeSig::decode(p)?)),
            other => Err(malformed_error!("Unknown member signature kind {}", other)),
        }
    }
}

impl Encode for MethodHandle {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            MethodHandle::Def(id) => {
                w.write_le(0u8);
                id.encode(w)
            }
            MethodHandle::Ref(id) => {
                w.write_le(1u8);
                id.encode(w)
            }
            MethodHandle::Spec { method, args } => {
                w.write_le(2u8);
                method.encode(w)?;
                args.encode(w)
            }
        }
    }
}

impl Decode for MethodHandle {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        match p.read_le::<u8>()? {
            0 => Ok(MethodHandle::Def(MethodId::decode(p)?)),
            1 => Ok(MethodHandle::Ref(MemberRefId::decode(p)?)),
            2 => {
                let method = MethodHandle::decode(p)?;
                if matches!(method, MethodHandle::Spec { .. }) {
                    return Err(malformed_error!("Nested method instantiation"));
                }
                Ok(MethodHandle::Spec {
                    method: Box::new(method),
                    args: Vec::decode(p)?,
                })
            }
            other => Err(malformed_error!("Unknown method handle kind {}", other)),
        }
    }
}

impl Encode for FieldHandle {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            FieldHandle::Def(id) => {
                w.write_le(0u8);
                id.encode(w)
            }
            FieldHandle::Ref(id) => {
                w.write_le(1u8);
                id.encode(w)
            }
        }
    }
}

impl Decode for FieldHandle {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        match p.read_le::<u8>()? {
            0 => Ok(FieldHandle::Def(FieldId::decode(p)?)),
            1 => Ok(FieldHandle::Ref(MemberRefId::decode(p)?)),
            other => Err(malformed_error!("Unknown field handle kind {}", other)),
        }
    }
}

impl Encode for MarshalInfo {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_le(self.native_type);
        self.element_type.encode(w)?;
        match &self.custom {
            Some(custom) => {
                w.write_bool(true);
                custom.marshaler.encode(w)?;
                custom.cookie.encode(w)
            }
            None => {
                w.write_bool(false);
                Ok(())
            }
        }
    }
}

impl Decode for MarshalInfo {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        let native_type = p.read_le()?;
        let element_type = Option::<u8>::decode(p)?;
        let custom = if p.read_bool()? {
            Some(CustomMarshalerSpec {
                marshaler: TypeSig::decode(p)?,
                cookie: String::decode(p)?,
            })
        } else {
            None
        };
        Ok(MarshalInfo {
            native_type,
            element_type,
            custom,
        })
    }
}

mod arg_tag {
    pub const BOOL: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const ARRAY: u8 = 0x1d;
    pub const TYPE: u8 = 0x50;
    pub const ENUM: u8 = 0x55;
}

impl Encode for AttributeArgument {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        match self {
            AttributeArgument::Bool(v) => {
                w.write_le(arg_tag::BOOL);
                w.write_bool(*v);
            }
            AttributeArgument::Char(v) => {
                w.write_le(arg_tag::CHAR);
                w.write_le(*v);
            }
            AttributeArgument::I1(v) => {
                w.write_le(arg_tag::I1);
                w.write_le(*v);
            }
            AttributeArgument::U1(v) => {
                w.write_le(arg_tag::U1);
                w.write_le(*v);
            }
            AttributeArgument::I2(v) => {
                w.write_le(arg_tag::I2);
                w.write_le(*v);
            }
            AttributeArgument::U2(v) => {
                w.write_le(arg_tag::U2);
                w.write_le(*v);
            }
            AttributeArgument::I4(v) => {
                w.write_le(arg_tag::I4);
                w.write_le(*v);
            }
            AttributeArgument::U4(v) => {
                w.write_le(arg_tag::U4);
                w.write_le(*v);
            }
            AttributeArgument::I8(v) => {
                w.write_le(arg_tag::I8);
                w.write_le(*v);
            }
            AttributeArgument::U8(v) => {
                w.write_le(arg_tag::U8);
                w.write_le(*v);
            }
            AttributeArgument::R4(v) => {
                w.write_le(arg_tag::R4);
                w.write_le(*v);
            }
            AttributeArgument::R8(v) => {
                w.write_le(arg_tag::R8);
                w.write_le(*v);
            }
            AttributeArgument::String(v) => {
                w.write_le(arg_tag::STRING);
                v.encode(w)?;
            }
            AttributeArgument::Type(v) => {
                w.write_le(arg_tag::TYPE);
                v.encode(w)?;
            }
            AttributeArgument::Enum { enum_type, value } => {
                w.write_le(arg_tag::ENUM);
                enum_type.encode(w)?;
                w.write_le(*value);
            }
            AttributeArgument::Array(v) => {
                w.write_le(arg_tag::ARRAY);
                v.encode(w)?;
            }
        }
        Ok(())
    }
}

impl Decode for AttributeArgument {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(match p.read_le::<u8>()? {
            arg_tag::BOOL => AttributeArgument::Bool(p.read_bool()?),
            arg_tag::CHAR => AttributeArgument::Char(p.read_le()?),
            arg_tag::I1 => AttributeArgument::I1(p.read_le()?),
            arg_tag::U1 => AttributeArgument::U1(p.read_le()?),
            arg_tag::I2 => AttributeArgument::I2(p.read_le()?),
            arg_tag::U2 => AttributeArgument::U2(p.read_le()?),
            arg_tag::I4 => AttributeArgument::I4(p.read_le()?),
            arg_tag::U4 => AttributeArgument::U4(p.read_le()?),
            arg_tag::I8 => AttributeArgument::I8(p.read_le()?),
            arg_tag::U8 => AttributeArgument::U8(p.read_le()?),
            arg_tag::R4 => AttributeArgument::R4(p.read_le()?),
            arg_tag::R8 => AttributeArgument::R8(p.read_le()?),
            arg_tag::STRING => AttributeArgument::String(Option::decode(p)?),
            arg_tag::TYPE => AttributeArgument::Type(Option::decode(p)?),
            arg_tag::ENUM => AttributeArgument::Enum {
                enum_type: TypeSig::decode(p)?,
                value: p.read_le()?,
            },
            arg_tag::ARRAY => AttributeArgument::Array(Option::decode(p)?),
            other => return Err(malformed_error!("Unknown attribute argument tag 0x{:02x}", other)),
        })
    }
}

impl Encode for NamedArgument {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.write_bool(self.is_field);
        self.name.encode(w)?;
        self.value.encode(w)
    }
}

impl Decode for NamedArgument {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(NamedArgument {
            is_field: p.read_bool()?,
            name: String::decode(p)?,
            value: AttributeArgument::decode(p)?,
        })
    }
}

impl Encode for CustomAttribute {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.constructor.encode(w)?;
        self.fixed_args.encode(w)?;
        self.named_args.encode(w)
    }
}

impl Decode for CustomAttribute {
    fn decode(p: &mut Parser<'_>) -> Result<Self> {
        Ok(CustomAttribute {
            constructor: MethodHandle::decode(p)?,
            fixed_args: Vec::decode(p)?,
            named_args: Vec::decode(p)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn round_trip<T: Encode + Decode>(value: &T) -> Result<T> {
        let mut w = Writer::new();
        value.encode(&mut w)?;
        let bytes = w.into_inner();
        let mut p = Parser::new(&bytes);
        let decoded = T::decode(&mut p)?;
        assert!(!p.has_more_data());
        Ok(decoded)
    }

    #[test]
    fn nested_generic_signature() -> Result<()> {
        let sig = TypeSig::ModOpt {
            modifier: Box::new(TypeSig::Ref(TypeRefId(2))),
            inner: Box::new(
                TypeSig::generic_class(TypeSig::Def(TypeId(1)), vec![TypeSig::Var(0), TypeSig::String])
                    .sz_array()
                    .by_ref(),
            ),
        };
        assert_eq!(round_trip(&sig)?, sig);
        Ok(())
    }

    #[test]
    fn unmanaged_call_site() -> Result<()> {
        let sig = MethodSig {
            call_conv: CallingConvention::Unmanaged,
            ..MethodSig::new_static(TypeSig::I4, vec![TypeSig::I.ptr(), TypeSig::U4])
        };
        assert_eq!(round_trip(&sig)?, sig);
        Ok(())
    }

    #[test]
    fn unknown_element_type_is_malformed() {
        let mut p = Parser::new(&[0x7f]);
        assert!(matches!(TypeSig::decode(&mut p), Err(Error::Malformed { .. })));
    }

    #[test]
    fn runaway_nesting_is_rejected() {
        let bytes = vec![ELEMENT_TYPE::PTR; MAX_SIG_DEPTH + 8];
        let mut p = Parser::new(&bytes);
        assert!(TypeSig::decode(&mut p).is_err());
    }

    #[test]
    fn attribute_arguments() -> Result<()> {
        let attribute = CustomAttribute {
            constructor: MethodHandle::Ref(MemberRefId(4)),
            fixed_args: vec![
                AttributeArgument::Type(Some(TypeSig::Ref(TypeRefId(0)))),
                AttributeArgument::String(None),
                AttributeArgument::Enum {
                    enum_type: TypeSig::Ref(TypeRefId(1)),
                    value: 20,
                },
            ],
            named_args: vec![NamedArgument {
                is_field: true,
                name: "SetLastError".into(),
                value: AttributeArgument::Bool(true),
            }],
        };
        assert_eq!(round_trip(&attribute)?, attribute);
        Ok(())
    }
}
