//! Attribute words of types, methods, fields, parameters and generic parameters.
//!
//! Values follow ECMA-335 II.23.1. Several of the access values are multi-bit patterns, so
//! visibility must always be compared after masking, never with `contains`.

use bitflags::bitflags;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// TypeDef attributes
    pub struct TypeAttributes: u32 {
        /// Visibility bits
        const VISIBILITY_MASK = 0x0000_0007;
        /// Not visible outside the assembly
        const NOT_PUBLIC = 0x0000_0000;
        /// Visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Nested with public visibility
        const NESTED_PUBLIC = 0x0000_0002;
        /// Nested with private visibility
        const NESTED_PRIVATE = 0x0000_0003;
        /// Nested with assembly visibility
        const NESTED_ASSEMBLY = 0x0000_0005;
        /// Fields are laid out sequentially
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type cannot be instantiated
        const ABSTRACT = 0x0000_0080;
        /// Type cannot be extended
        const SEALED = 0x0000_0100;
        /// Name is special
        const SPECIAL_NAME = 0x0000_0400;
        /// Type initializer may run before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

impl TypeAttributes {
    /// Returns `true` if the visibility bits describe a nested type.
    #[must_use]
    pub fn is_nested(self) -> bool {
        (self & Self::VISIBILITY_MASK).bits() > Self::PUBLIC.bits()
    }
}

/// Member accessibility shared by methods and fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MemberAccess {
    /// Accessible only by the compiler
    CompilerControlled = 0,
    /// Accessible only by the parent type
    Private = 1,
    /// Accessible by sub-types in the same assembly
    FamilyAndAssembly = 2,
    /// Accessible by anyone in the assembly
    Assembly = 3,
    /// Accessible by sub-types
    Family = 4,
    /// Accessible by sub-types anywhere or anyone in the assembly
    FamilyOrAssembly = 5,
    /// Accessible by anyone
    Public = 6,
}

impl MemberAccess {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x7 {
            1 => MemberAccess::Private,
            2 => MemberAccess::FamilyAndAssembly,
            3 => MemberAccess::Assembly,
            4 => MemberAccess::Family,
            5 => MemberAccess::FamilyOrAssembly,
            6 => MemberAccess::Public,
            _ => MemberAccess::CompilerControlled,
        }
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// MethodDef attributes
    pub struct MethodAttributes: u16 {
        /// Accessibility bits, see [`MemberAccess`]
        const MEMBER_ACCESS_MASK = 0x0007;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method may not be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name+sig, else just by name
        const HIDE_BY_SIG = 0x0080;
        /// Method always gets a new slot in the vtable
        const NEW_SLOT = 0x0100;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// Runtime should check name encoding
        const RTSPECIAL_NAME = 0x1000;
        /// Implementation is forwarded through PInvoke
        const PINVOKE_IMPL = 0x2000;
    }
}

impl MethodAttributes {
    /// Returns the accessibility encoded in the attribute word.
    #[must_use]
    pub fn access(self) -> MemberAccess {
        MemberAccess::from_bits(self.bits())
    }

    /// Returns a copy with the accessibility replaced.
    #[must_use]
    pub fn with_access(self, access: MemberAccess) -> Self {
        Self::from_bits_retain((self.bits() & !0x7) | access as u16)
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// MethodImpl attributes
    pub struct MethodImplAttributes: u16 {
        /// Method implementation is native
        const NATIVE = 0x0001;
        /// Method implementation is provided by the runtime
        const RUNTIME = 0x0003;
        /// Method implementation is unmanaged
        const UNMANAGED = 0x0004;
        /// Method may not be inlined
        const NO_INLINING = 0x0008;
        /// Method is single threaded through the body
        const SYNCHRONIZED = 0x0020;
        /// Method signature is not to be mangled to do HRESULT conversion
        const PRESERVE_SIG = 0x0080;
        /// Method should be inlined if possible
        const AGGRESSIVE_INLINING = 0x0100;
        /// Reserved for internal use
        const INTERNAL_CALL = 0x1000;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// Field attributes
    pub struct FieldAttributes: u16 {
        /// Accessibility bits, see [`MemberAccess`]
        const FIELD_ACCESS_MASK = 0x0007;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialized
        const INIT_ONLY = 0x0020;
        /// Value is a compile time constant
        const LITERAL = 0x0040;
        /// Field is special
        const SPECIAL_NAME = 0x0200;
        /// Runtime should check name encoding
        const RTSPECIAL_NAME = 0x0400;
        /// Field has marshalling information
        const HAS_FIELD_MARSHAL = 0x1000;
    }
}

impl FieldAttributes {
    /// Returns the accessibility encoded in the attribute word.
    #[must_use]
    pub fn access(self) -> MemberAccess {
        MemberAccess::from_bits(self.bits())
    }

    /// Returns a copy with the accessibility replaced.
    #[must_use]
    pub fn with_access(self, access: MemberAccess) -> Self {
        Self::from_bits_retain((self.bits() & !0x7) | access as u16)
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// Param attributes
    pub struct ParamAttributes: u16 {
        /// Param is \[In\]
        const IN = 0x0001;
        /// Param is \[out\]
        const OUT = 0x0002;
        /// Param is optional
        const OPTIONAL = 0x0010;
        /// Param has a default value
        const HAS_DEFAULT = 0x1000;
        /// Param has marshalling information
        const HAS_FIELD_MARSHAL = 0x2000;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// GenericParam attributes
    pub struct GenericParamAttributes: u16 {
        /// Covariant type parameter
        const COVARIANT = 0x0001;
        /// Contravariant type parameter
        const CONTRAVARIANT = 0x0002;
        /// Argument must be a reference type
        const REFERENCE_TYPE_CONSTRAINT = 0x0004;
        /// Argument must be a non nullable value type
        const NOT_NULLABLE_VALUE_TYPE_CONSTRAINT = 0x0008;
        /// Argument must have a public default constructor
        const DEFAULT_CONSTRUCTOR_CONSTRAINT = 0x0010;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
    /// Property attributes
    pub struct PropertyAttributes: u16 {
        /// Property is special
        const SPECIAL_NAME = 0x0200;
        /// Runtime should check name encoding
        const RTSPECIAL_NAME = 0x0400;
        /// Property has a default value
        const HAS_DEFAULT = 0x1000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_is_masked() {
        let flags = MethodAttributes::STATIC
            | MethodAttributes::PINVOKE_IMPL
            | MethodAttributes::from_bits_retain(MemberAccess::Assembly as u16);
        assert_eq!(flags.access(), MemberAccess::Assembly);

        let public = flags.with_access(MemberAccess::Public);
        assert_eq!(public.access(), MemberAccess::Public);
        assert!(public.contains(MethodAttributes::STATIC));
    }

    #[test]
    fn nested_visibility() {
        assert!(!TypeAttributes::PUBLIC.is_nested());
        assert!(TypeAttributes::NESTED_PRIVATE.is_nested());
    }
}
