//! Type and method signatures.
//!
//! [`TypeSig`] is the structural description of a type as it appears in member signatures,
//! local variable tables, instruction operands and custom attribute arguments. Types declared
//! in the current module are addressed with [`TypeSig::Def`], everything else goes through a
//! [`TypeSig::Ref`] row, which keeps the boundary between "mine" and "imported" explicit for
//! the cloner.
//!
//! Generic parameters are positional: `Var(n)` is the n-th parameter of the enclosing generic
//! type, `MVar(n)` the n-th parameter of the enclosing generic method. Binding them to concrete
//! arguments is done with [`TypeSig::substitute`].

use strum::{Display, EnumString};

use crate::metadata::token::{TypeId, TypeRefId};

/// A type as it appears inside a signature.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSig {
    /// `void`
    Void,
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// `int8`
    I1,
    /// `unsigned int8`
    U1,
    /// `int16`
    I2,
    /// `unsigned int16`
    U2,
    /// `int32`
    I4,
    /// `unsigned int32`
    U4,
    /// `int64`
    I8,
    /// `unsigned int64`
    U8,
    /// `float32`
    R4,
    /// `float64`
    R8,
    /// `native int`
    I,
    /// `native unsigned int`
    U,
    /// `string`
    String,
    /// `object`
    Object,
    /// `typedref`
    TypedByRef,
    /// A type defined in this module
    Def(TypeId),
    /// A type defined in another module or assembly
    Ref(TypeRefId),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Managed reference
    ByRef(Box<TypeSig>),
    /// Pinned local
    Pinned(Box<TypeSig>),
    /// Single dimensional, zero based array
    SzArray(Box<TypeSig>),
    /// Optional custom modifier
    ModOpt {
        /// The modifier type
        modifier: Box<TypeSig>,
        /// The modified type
        inner: Box<TypeSig>,
    },
    /// Required custom modifier
    ModReq {
        /// The modifier type
        modifier: Box<TypeSig>,
        /// The modified type
        inner: Box<TypeSig>,
    },
    /// Instantiation of a generic type
    GenericInst {
        /// The open generic type
        generic: Box<TypeSig>,
        /// Type arguments in declaration order
        args: Vec<TypeSig>,
        /// `true` if the instantiation is a value type
        value_type: bool,
    },
    /// Generic parameter of the enclosing type
    Var(u16),
    /// Generic parameter of the enclosing method
    MVar(u16),
    /// Function pointer
    FnPtr(Box<MethodSig>),
}

impl TypeSig {
    /// Wraps `self` in a managed reference.
    #[must_use]
    pub fn by_ref(self) -> TypeSig {
        TypeSig::ByRef(Box::new(self))
    }

    /// Wraps `self` in an unmanaged pointer.
    #[must_use]
    pub fn ptr(self) -> TypeSig {
        TypeSig::Ptr(Box::new(self))
    }

    /// Wraps `self` in a single dimensional array.
    #[must_use]
    pub fn sz_array(self) -> TypeSig {
        TypeSig::SzArray(Box::new(self))
    }

    /// Creates an instantiation of a generic class.
    #[must_use]
    pub fn generic_class(generic: TypeSig, args: Vec<TypeSig>) -> TypeSig {
        TypeSig::GenericInst {
            generic: Box::new(generic),
            args,
            value_type: false,
        }
    }

    /// Returns `true` for `void`, with or without custom modifiers.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self.unmodified(), TypeSig::Void)
    }

    /// Strips custom modifiers and the pinned marker.
    #[must_use]
    pub fn unmodified(&self) -> &TypeSig {
        match self {
            TypeSig::ModOpt { inner, .. } | TypeSig::ModReq { inner, .. } => inner.unmodified(),
            TypeSig::Pinned(inner) => inner.unmodified(),
            other => other,
        }
    }

    /// Returns `true` if the signature mentions a generic parameter anywhere.
    #[must_use]
    pub fn is_open(&self) -> bool {
        match self {
            TypeSig::Var(_) | TypeSig::MVar(_) => true,
            TypeSig::Ptr(inner)
            | TypeSig::ByRef(inner)
            | TypeSig::Pinned(inner)
            | TypeSig::SzArray(inner) => inner.is_open(),
            TypeSig::ModOpt { modifier, inner } | TypeSig::ModReq { modifier, inner } => {
                modifier.is_open() || inner.is_open()
            }
            TypeSig::GenericInst { generic, args, .. } => {
                generic.is_open() || args.iter().any(TypeSig::is_open)
            }
            TypeSig::FnPtr(sig) => sig.ret.is_open() || sig.params.iter().any(TypeSig::is_open),
            _ => false,
        }
    }

    /// Binds generic parameters to concrete arguments.
    ///
    /// Parameters without a matching argument are left in place, which allows partial
    /// substitution of only the type level or only the method level parameters.
    ///
    /// # Arguments
    /// * `type_args` - Arguments for `Var(n)`
    /// * `method_args` - Arguments for `MVar(n)`
    #[must_use]
    pub fn substitute(&self, type_args: &[TypeSig], method_args: &[TypeSig]) -> TypeSig {
        let sub = |sig: &TypeSig| Box::new(sig.substitute(type_args, method_args));
        match self {
            TypeSig::Var(n) => type_args
                .get(usize::from(*n))
                .cloned()
                .unwrap_or(TypeSig::Var(*n)),
            TypeSig::MVar(n) => method_args
                .get(usize::from(*n))
                .cloned()
                .unwrap_or(TypeSig::MVar(*n)),
            TypeSig::Ptr(inner) => TypeSig::Ptr(sub(inner)),
            TypeSig::ByRef(inner) => TypeSig::ByRef(sub(inner)),
            TypeSig::Pinned(inner) => TypeSig::Pinned(sub(inner)),
            TypeSig::SzArray(inner) => TypeSig::SzArray(sub(inner)),
            TypeSig::ModOpt { modifier, inner } => TypeSig::ModOpt {
                modifier: sub(modifier),
                inner: sub(inner),
            },
            TypeSig::ModReq { modifier, inner } => TypeSig::ModReq {
                modifier: sub(modifier),
                inner: sub(inner),
            },
            TypeSig::GenericInst {
                generic,
                args,
                value_type,
            } => TypeSig::GenericInst {
                generic: sub(generic),
                args: args
                    .iter()
                    .map(|arg| arg.substitute(type_args, method_args))
                    .collect(),
                value_type: *value_type,
            },
            TypeSig::FnPtr(sig) => TypeSig::FnPtr(Box::new(sig.substitute(type_args, method_args))),
            other => other.clone(),
        }
    }

    /// Returns the ECMA-335 element type of a primitive, if `self` is one.
    #[must_use]
    pub fn primitive_code(&self) -> Option<u8> {
        Some(match self {
            TypeSig::Void => ELEMENT_TYPE::VOID,
            TypeSig::Boolean => ELEMENT_TYPE::BOOLEAN,
            TypeSig::Char => ELEMENT_TYPE::CHAR,
            TypeSig::I1 => ELEMENT_TYPE::I1,
            TypeSig::U1 => ELEMENT_TYPE::U1,
            TypeSig::I2 => ELEMENT_TYPE::I2,
            TypeSig::U2 => ELEMENT_TYPE::U2,
            TypeSig::I4 => ELEMENT_TYPE::I4,
            TypeSig::U4 => ELEMENT_TYPE::U4,
            TypeSig::I8 => ELEMENT_TYPE::I8,
            TypeSig::U8 => ELEMENT_TYPE::U8,
            TypeSig::R4 => ELEMENT_TYPE::R4,
            TypeSig::R8 => ELEMENT_TYPE::R8,
            TypeSig::I => ELEMENT_TYPE::I,
            TypeSig::U => ELEMENT_TYPE::U,
            TypeSig::String => ELEMENT_TYPE::STRING,
            TypeSig::Object => ELEMENT_TYPE::OBJECT,
            TypeSig::TypedByRef => ELEMENT_TYPE::TYPEDBYREF,
            _ => return None,
        })
    }

    /// Inverse of [`TypeSig::primitive_code`].
    #[must_use]
    pub fn from_primitive_code(code: u8) -> Option<TypeSig> {
        Some(match code {
            ELEMENT_TYPE::VOID => TypeSig::Void,
            ELEMENT_TYPE::BOOLEAN => TypeSig::Boolean,
            ELEMENT_TYPE::CHAR => TypeSig::Char,
            ELEMENT_TYPE::I1 => TypeSig::I1,
            ELEMENT_TYPE::U1 => TypeSig::U1,
            ELEMENT_TYPE::I2 => TypeSig::I2,
            ELEMENT_TYPE::U2 => TypeSig::U2,
            ELEMENT_TYPE::I4 => TypeSig::I4,
            ELEMENT_TYPE::U4 => TypeSig::U4,
            ELEMENT_TYPE::I8 => TypeSig::I8,
            ELEMENT_TYPE::U8 => TypeSig::U8,
            ELEMENT_TYPE::R4 => TypeSig::R4,
            ELEMENT_TYPE::R8 => TypeSig::R8,
            ELEMENT_TYPE::I => TypeSig::I,
            ELEMENT_TYPE::U => TypeSig::U,
            ELEMENT_TYPE::STRING => TypeSig::String,
            ELEMENT_TYPE::OBJECT => TypeSig::Object,
            ELEMENT_TYPE::TYPEDBYREF => TypeSig::TypedByRef,
            _ => return None,
        })
    }
}

#[allow(non_snake_case)]
/// Element type codes of ECMA-335 II.23.1.16, plus the private handle tags of the image format.
pub mod ELEMENT_TYPE {
    /// Marks end of a list
    pub const END: u8 = 0x00;
    /// `void`
    pub const VOID: u8 = 0x01;
    /// `bool`
    pub const BOOLEAN: u8 = 0x02;
    /// `char`
    pub const CHAR: u8 = 0x03;
    /// `int8`
    pub const I1: u8 = 0x04;
    /// `unsigned int8`
    pub const U1: u8 = 0x05;
    /// `int16`
    pub const I2: u8 = 0x06;
    /// `unsigned int16`
    pub const U2: u8 = 0x07;
    /// `int32`
    pub const I4: u8 = 0x08;
    /// `unsigned int32`
    pub const U4: u8 = 0x09;
    /// `int64`
    pub const I8: u8 = 0x0a;
    /// `unsigned int64`
    pub const U8: u8 = 0x0b;
    /// `float32`
    pub const R4: u8 = 0x0c;
    /// `float64`
    pub const R8: u8 = 0x0d;
    /// `string`
    pub const STRING: u8 = 0x0e;
    /// Unmanaged pointer, followed by type
    pub const PTR: u8 = 0x0f;
    /// Managed reference, followed by type
    pub const BYREF: u8 = 0x10;
    /// Generic parameter of a type
    pub const VAR: u8 = 0x13;
    /// Generic instantiation
    pub const GENERICINST: u8 = 0x15;
    /// `typedref`
    pub const TYPEDBYREF: u8 = 0x16;
    /// `native int`
    pub const I: u8 = 0x18;
    /// `native unsigned int`
    pub const U: u8 = 0x19;
    /// Function pointer, followed by full method signature
    pub const FNPTR: u8 = 0x1b;
    /// `object`
    pub const OBJECT: u8 = 0x1c;
    /// Single dimensional, zero based array
    pub const SZARRAY: u8 = 0x1d;
    /// Generic parameter of a method
    pub const MVAR: u8 = 0x1e;
    /// Required modifier
    pub const CMOD_REQD: u8 = 0x1f;
    /// Optional modifier
    pub const CMOD_OPT: u8 = 0x20;
    /// Pinned local
    pub const PINNED: u8 = 0x45;
    /// Image format: type defined in this module, followed by the row index
    pub const DEF_HANDLE: u8 = 0x60;
    /// Image format: type reference, followed by the row index
    pub const REF_HANDLE: u8 = 0x61;
}

/// Calling convention of a method signature or call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Default)]
pub enum CallingConvention {
    /// Managed calling convention
    #[default]
    Default,
    /// Unmanaged `cdecl`
    C,
    /// Unmanaged `stdcall`
    StdCall,
    /// Unmanaged `thiscall`
    ThisCall,
    /// Unmanaged `fastcall`
    FastCall,
    /// Managed variable argument list
    VarArg,
    /// Unmanaged platform default
    Unmanaged,
}

impl CallingConvention {
    /// Low nibble of the signature header byte.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            CallingConvention::Default => 0x0,
            CallingConvention::C => 0x1,
            CallingConvention::StdCall => 0x2,
            CallingConvention::ThisCall => 0x3,
            CallingConvention::FastCall => 0x4,
            CallingConvention::VarArg => 0x5,
            CallingConvention::Unmanaged => 0x9,
        }
    }

    /// Decodes the low nibble of a signature header byte.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code & 0x0f {
            0x0 => CallingConvention::Default,
            0x1 => CallingConvention::C,
            0x2 => CallingConvention::StdCall,
            0x3 => CallingConvention::ThisCall,
            0x4 => CallingConvention::FastCall,
            0x5 => CallingConvention::VarArg,
            0x9 => CallingConvention::Unmanaged,
            _ => return None,
        })
    }

    /// Returns `true` for the unmanaged conventions usable at an indirect native call site.
    #[must_use]
    pub fn is_unmanaged(self) -> bool {
        !matches!(self, CallingConvention::Default | CallingConvention::VarArg)
    }
}

/// A method signature, shared by definitions, member references and call sites.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodSig {
    /// Instance method taking `this` as hidden first argument
    pub has_this: bool,
    /// `this` is spelled out as the first parameter
    pub explicit_this: bool,
    /// Calling convention
    pub call_conv: CallingConvention,
    /// Number of method level generic parameters
    pub generic_param_count: u16,
    /// Return type
    pub ret: TypeSig,
    /// Parameter types in order, excluding `this`
    pub params: Vec<TypeSig>,
}

impl Default for TypeSig {
    fn default() -> Self {
        TypeSig::Void
    }
}

impl MethodSig {
    /// Creates a static, managed signature.
    #[must_use]
    pub fn new_static(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            ret,
            params,
            ..MethodSig::default()
        }
    }

    /// Creates an instance, managed signature.
    #[must_use]
    pub fn new_instance(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: true,
            ret,
            params,
            ..MethodSig::default()
        }
    }

    /// Number of stack slots taken by the arguments, including `this`.
    #[must_use]
    pub fn arg_slots(&self) -> usize {
        self.params.len() + usize::from(self.has_this && !self.explicit_this)
    }

    /// Binds generic parameters, see [`TypeSig::substitute`].
    #[must_use]
    pub fn substitute(&self, type_args: &[TypeSig], method_args: &[TypeSig]) -> MethodSig {
        MethodSig {
            ret: self.ret.substitute(type_args, method_args),
            params: self
                .params
                .iter()
                .map(|p| p.substitute(type_args, method_args))
                .collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_binds_both_levels() {
        let open = TypeSig::generic_class(
            TypeSig::Def(TypeId(2)),
            vec![TypeSig::Var(1), TypeSig::MVar(0).by_ref()],
        );
        let closed = open.substitute(&[TypeSig::I4, TypeSig::String], &[TypeSig::I]);
        assert_eq!(
            closed,
            TypeSig::generic_class(
                TypeSig::Def(TypeId(2)),
                vec![TypeSig::String, TypeSig::I.by_ref()]
            )
        );
        assert!(open.is_open());
        assert!(!closed.is_open());
    }

    #[test]
    fn partial_substitution_keeps_unbound_parameters() {
        let sig = TypeSig::Var(3);
        assert_eq!(sig.substitute(&[TypeSig::I4], &[]), TypeSig::Var(3));
    }

    #[test]
    fn calling_convention_codes() {
        for conv in [
            CallingConvention::Default,
            CallingConvention::C,
            CallingConvention::StdCall,
            CallingConvention::ThisCall,
            CallingConvention::FastCall,
            CallingConvention::Unmanaged,
        ] {
            assert_eq!(CallingConvention::from_code(conv.code()), Some(conv));
        }
        assert!(CallingConvention::C.is_unmanaged());
        assert!(!CallingConvention::Default.is_unmanaged());
    }

    #[test]
    fn modifiers_are_stripped() {
        let sig = TypeSig::ModOpt {
            modifier: Box::new(TypeSig::Ref(TypeRefId(0))),
            inner: Box::new(TypeSig::I),
        };
        assert_eq!(sig.unmodified(), &TypeSig::I);
    }
}
