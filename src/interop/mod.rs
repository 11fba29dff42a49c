//! The support module.
//!
//! Rewritten code depends on a handful of types that live in the `DotBind.Interop` assembly:
//!
//! - `ILibraryLoader` and its default implementation `LibLoader`, which the synthesized load
//!   routines and resolvers call into; it forwards to a Windows, BSD or `libdl` backend picked
//!   when the loader is first used
//! - the annotations `ImportFilterAttribute`, `ImportLoaderAttribute`,
//!   `MarshalerTypeAttribute` and `MarshalerInfoInitializationAttribute`
//! - the marshaler protocol: `IMarshaler<TSettings, TNative, THost>`, the base class
//!   `Marshaler<TMarshaler, TSettings, TNative, THost>` and the elided marker
//!   `MarshalInitialization<TNative, THost>.ObjectInitialized`
//! - the reference marshalers `CStringMarshaler` (with its settings `StringMarshalerInfo`)
//!   and `CustomMarshalerAdapter<T>` for `ICustomMarshaler` implementations
//!
//! [`Support::builtin`] builds this module in memory; a module image with the same types can
//! be loaded instead with [`Support::from_file`]. The processor either embeds the support types
//! into every rewritten module or leaves references to the support assembly in place.

mod annotations;
mod builder;
mod imports;
mod loader;
mod marshalers;

use std::path::Path;

pub use imports::{Home, Imports};
pub use loader::{BSD_LIB_LOADER, KERNEL32_NAME, LIBC_NAME, LIBDL_NAME, UNIX_LIB_LOADER, WIN_LIB_LOADER};

use crate::{
    metadata::{
        module::Module,
        references::{AssemblyRef, ResolutionScope},
        token::{TypeId, TypeRefId},
        typesystem::TypeSig,
    },
    Error, Result,
};

/// Namespace of every support type.
pub const INTEROP_NAMESPACE: &str = "DotBind.Interop";
/// Simple name of the support assembly.
pub const INTEROP_ASSEMBLY: &str = "DotBind.Interop";

/// The loader contract.
pub const LIBRARY_LOADER: &str = "ILibraryLoader";
/// The default loader.
pub const LIB_LOADER: &str = "LibLoader";
/// Filter annotation, `(bool include)`.
pub const IMPORT_FILTER_ATTRIBUTE: &str = "ImportFilterAttribute";
/// Loader selector annotation, `(string cookie)` or `(Type loader, string cookie)`.
pub const IMPORT_LOADER_ATTRIBUTE: &str = "ImportLoaderAttribute";
/// Declares a native representation a marshaler supports.
pub const MARSHALER_TYPE_ATTRIBUTE: &str = "MarshalerTypeAttribute";
/// Names the generator of a settings constructor parameter.
pub const MARSHALER_INFO_INITIALIZATION_ATTRIBUTE: &str = "MarshalerInfoInitializationAttribute";
/// Holder of the split marker.
pub const MARSHAL_INITIALIZATION: &str = "MarshalInitialization`2";
/// The marshaler interface.
pub const MARSHALER_INTERFACE: &str = "IMarshaler`3";
/// The marshaler base class every marshaler derives from.
pub const MARSHALER_BASE: &str = "Marshaler`4";
/// Settings of the C string marshaler.
pub const STRING_MARSHALER_INFO: &str = "StringMarshalerInfo";
/// The C string marshaler.
pub const CSTRING_MARSHALER: &str = "CStringMarshaler";
/// Adapter wrapping `ICustomMarshaler` implementations.
pub const CUSTOM_MARSHALER_ADAPTER: &str = "CustomMarshalerAdapter`1";

/// Library name that selects the loader's own notion of "the current process".
pub const LOADER_SENTINEL: &str = "<loader>";
/// Name of the static factory of loaders and custom marshalers.
pub const FACTORY_METHOD: &str = "GetInstance";
/// Name of the marker call that separates conversion from cleanup.
pub const MARKER_METHOD: &str = "ObjectInitialized";
/// Host to native conversion.
pub const MARSHAL_MANAGED: &str = "MarshalManaged";
/// Native to host conversion.
pub const MARSHAL_NATIVE: &str = "MarshalNative";

const REQUIRED_TYPES: &[&str] = &[
    LIBRARY_LOADER,
    LIB_LOADER,
    IMPORT_FILTER_ATTRIBUTE,
    IMPORT_LOADER_ATTRIBUTE,
    MARSHALER_TYPE_ATTRIBUTE,
    MARSHALER_INFO_INITIALIZATION_ATTRIBUTE,
    MARSHAL_INITIALIZATION,
    MARSHALER_BASE,
    CUSTOM_MARSHALER_ADAPTER,
];

/// A loaded support module.
#[derive(Debug, Clone)]
pub struct Support {
    module: Module,
}

impl Support {
    /// Builds the support module shipped with the crate.
    ///
    /// # Errors
    /// Only fails if the generated bodies do not verify, which indicates a bug.
    pub fn builtin() -> Result<Support> {
        Support::from_module(builder::build()?)
    }

    /// Wraps a support module, checking that it defines every support type.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] naming the first missing type.
    pub fn from_module(module: Module) -> Result<Support> {
        for name in REQUIRED_TYPES {
            if module.find_type(INTEROP_NAMESPACE, name).is_none() {
                return Err(Error::TypeNotFound(format!("{INTEROP_NAMESPACE}.{name}")));
            }
        }
        Ok(Support { module })
    }

    /// Loads a support module image.
    ///
    /// # Errors
    /// See [`Module::from_file`] and [`Support::from_module`].
    pub fn from_file(path: &Path) -> Result<Support> {
        Support::from_module(Module::from_file(path)?)
    }

    /// The support module.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Name of the support assembly.
    #[must_use]
    pub fn assembly_name(&self) -> &str {
        self.module.assembly_name()
    }

    /// A reference to the support assembly, for modules that keep depending on it.
    #[must_use]
    pub fn assembly_ref(&self) -> AssemblyRef {
        let version = self
            .module
            .assembly
            .as_ref()
            .map(|assembly| assembly.version)
            .unwrap_or_default();
        AssemblyRef::new(self.assembly_name(), version)
    }

    /// Finds a top-level support type.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.module.find_type(INTEROP_NAMESPACE, name)
    }

    /// Finds a top-level support type that must exist.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the support module lacks `name`.
    pub fn require(&self, name: &str) -> Result<TypeId> {
        self.find(name)
            .ok_or_else(|| Error::TypeNotFound(format!("{INTEROP_NAMESPACE}.{name}")))
    }

    /// Returns `true` if the type reference `id` of `target` points into the support assembly.
    #[must_use]
    pub fn owns_ref(&self, target: &Module, id: TypeRefId) -> bool {
        target
            .type_ref_assembly(id)
            .is_some_and(|assembly| target.assembly_ref(assembly).name == self.assembly_name())
    }

    /// Resolves a type reference of `target` to the support type it names.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the reference points into the support assembly but
    /// names a type the support module does not define. References elsewhere yield `Ok(None)`.
    pub fn resolve_ref(&self, target: &Module, id: TypeRefId) -> Result<Option<TypeId>> {
        if !self.owns_ref(target, id) {
            return Ok(None);
        }
        let reference = target.type_ref(id);
        let found = match reference.scope {
            ResolutionScope::Nested(enclosing) => match self.resolve_ref(target, enclosing)? {
                Some(outer) => self.module.find_nested(outer, &reference.name),
                None => None,
            },
            _ => self.module.find_type(&reference.namespace, &reference.name),
        };
        match found {
            Some(def) => Ok(Some(def)),
            None => Err(Error::TypeNotFound(format!(
                "{} in {}",
                target.type_ref_full_name(id),
                self.assembly_name()
            ))),
        }
    }

    /// Resolves a signature of `target` to a support definition, looking through generic
    /// instantiations.
    ///
    /// # Errors
    /// See [`Support::resolve_ref`].
    pub fn resolve_sig(&self, target: &Module, sig: &TypeSig) -> Result<Option<TypeId>> {
        match sig.unmodified() {
            TypeSig::Ref(id) => self.resolve_ref(target, *id),
            TypeSig::GenericInst { generic, .. } => self.resolve_sig(target, generic),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::references::TypeRef, verify::verify_body};

    #[test]
    fn builtin_defines_the_support_types() -> Result<()> {
        let support = Support::builtin()?;
        for name in REQUIRED_TYPES {
            assert!(support.find(name).is_some(), "{name} missing");
        }
        assert_eq!(support.assembly_name(), INTEROP_ASSEMBLY);
        Ok(())
    }

    #[test]
    fn builtin_bodies_verify() -> Result<()> {
        let support = Support::builtin()?;
        let module = support.module();
        for method in &module.methods {
            if let Some(body) = &method.body {
                verify_body(module, method, body)?;
            }
        }
        Ok(())
    }

    #[test]
    fn incomplete_support_is_rejected() {
        let module = Module::new("Other.dll", "Other");
        assert!(matches!(Support::from_module(module), Err(Error::TypeNotFound(_))));
    }

    #[test]
    fn resolves_references_into_the_support_assembly() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let assembly = target.add_assembly_ref(support.assembly_ref());
        let loader = target.add_type_ref(TypeRef {
            scope: ResolutionScope::Assembly(assembly),
            namespace: INTEROP_NAMESPACE.to_string(),
            name: LIB_LOADER.to_string(),
            is_value_type: false,
        });
        let missing = target.add_type_ref(TypeRef {
            scope: ResolutionScope::Assembly(assembly),
            namespace: INTEROP_NAMESPACE.to_string(),
            name: "Nope".to_string(),
            is_value_type: false,
        });
        let object = target.core_type("System", "Object", false);

        assert_eq!(support.resolve_ref(&target, loader)?, support.find(LIB_LOADER));
        assert!(support.resolve_ref(&target, missing).is_err());
        assert_eq!(support.resolve_sig(&target, &object)?, None);
        Ok(())
    }
}
