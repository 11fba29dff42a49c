//! References to entities outside the current module, and handles that address either kind.

use crate::metadata::{
    token::{AssemblyRefId, FieldId, MemberRefId, MethodId, ModuleRefId, TypeRefId},
    typesystem::{MethodSig, TypeSig},
};

/// Four part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl Version {
    /// Creates a version from its four parts.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Version {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// A referenced assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    /// Simple name
    pub name: String,
    /// Version
    pub version: Version,
    /// Culture, `None` for neutral
    pub culture: Option<String>,
    /// Public key token
    pub public_key_token: Option<[u8; 8]>,
}

impl AssemblyRef {
    /// Creates a culture neutral reference without a public key token.
    #[must_use]
    pub fn new(name: &str, version: Version) -> Self {
        AssemblyRef {
            name: name.to_string(),
            version,
            culture: None,
            public_key_token: None,
        }
    }
}

/// An external module. Native declarations use it to name their library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// Module or library name
    pub name: String,
}

/// Where a [`TypeRef`] is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionScope {
    /// Defined in a referenced assembly
    Assembly(AssemblyRefId),
    /// Defined in another module of the current assembly
    Module(ModuleRefId),
    /// Nested inside another referenced type
    Nested(TypeRefId),
    /// Defined in the current module
    CurrentModule,
}

/// A reference to a type defined outside this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// Resolution scope
    pub scope: ResolutionScope,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name, including the generic arity suffix
    pub name: String,
    /// `true` if the referenced type is a value type
    pub is_value_type: bool,
}

/// Signature of a [`MemberRef`].
#[derive(Debug, Clone, PartialEq)]
pub enum MemberSig {
    /// Method reference
    Method(MethodSig),
    /// Field reference
    Field(TypeSig),
}

/// A reference to a method or field by owner, name and signature.
///
/// Members of generic instantiations are always addressed this way, even if the open type is
/// defined in the current module.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRef {
    /// Owning type
    pub parent: TypeSig,
    /// Member name
    pub name: String,
    /// Member signature, in terms of the open owner
    pub signature: MemberSig,
}

impl MemberRef {
    /// Returns the method signature, if this references a method.
    #[must_use]
    pub fn method_sig(&self) -> Option<&MethodSig> {
        match &self.signature {
            MemberSig::Method(sig) => Some(sig),
            MemberSig::Field(_) => None,
        }
    }
}

/// Addresses a method, whether defined locally, referenced, or instantiated.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodHandle {
    /// Method defined in this module
    Def(MethodId),
    /// Referenced method
    Ref(MemberRefId),
    /// Instantiation of a generic method
    Spec {
        /// The open generic method
        method: Box<MethodHandle>,
        /// Method type arguments
        args: Vec<TypeSig>,
    },
}

impl MethodHandle {
    /// Returns the underlying open method handle.
    #[must_use]
    pub fn open(&self) -> &MethodHandle {
        match self {
            MethodHandle::Spec { method, .. } => method.open(),
            other => other,
        }
    }
}

/// Addresses a field, whether defined locally or referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldHandle {
    /// Field defined in this module
    Def(FieldId),
    /// Referenced field
    Ref(MemberRefId),
}
