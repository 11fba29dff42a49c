//! Typed row identifiers for the module arenas.
//!
//! Every entity of a [`crate::metadata::module::Module`] lives in a flat table and is addressed
//! by a zero based index wrapped in a newtype, so a method id can never be used where a type id
//! is expected. Identifiers are only meaningful for the module that issued them; moving an entity
//! into another module always goes through the [`crate::cloner::Cloner`].

use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Returns the table index this identifier addresses.
            #[must_use]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            /// Creates an identifier from a table index.
            #[must_use]
            pub fn from_index(index: usize) -> Self {
                $name(u32::try_from(index).unwrap_or(u32::MAX))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Identifies a type defined in the module.
    TypeId,
    "TypeDef"
);
entity_id!(
    /// Identifies a method defined in the module.
    MethodId,
    "MethodDef"
);
entity_id!(
    /// Identifies a field defined in the module.
    FieldId,
    "Field"
);
entity_id!(
    /// Identifies a property defined in the module.
    PropertyId,
    "Property"
);
entity_id!(
    /// Identifies a reference to a type defined elsewhere.
    TypeRefId,
    "TypeRef"
);
entity_id!(
    /// Identifies a reference to a method or field, possibly on a generic instantiation.
    MemberRefId,
    "MemberRef"
);
entity_id!(
    /// Identifies an external module; for native declarations this is the library name.
    ModuleRefId,
    "ModuleRef"
);
entity_id!(
    /// Identifies a referenced assembly.
    AssemblyRefId,
    "AssemblyRef"
);
