//! Support entities as seen from a target module.

use crate::{
    cloner::Cloner,
    interop::Support,
    metadata::{
        body::MethodBody,
        module::Module,
        references::MethodHandle,
        token::TypeId,
        typesystem::{MethodSig, TypeSig},
    },
    Error, Result,
};

/// The module a type is defined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// Defined by the target module, which includes embedded support types
    Target(TypeId),
    /// Defined by the support module
    Support(TypeId),
}

/// Hands out support types, members and bodies translated into one target module.
///
/// When the support types are embedded the handles are local definitions of the target;
/// otherwise they are references into the support assembly.
#[derive(Debug)]
pub struct Imports<'s> {
    support: &'s Support,
    cloner: Cloner<'s>,
}

impl<'s> Imports<'s> {
    /// Creates the imports for one target module.
    #[must_use]
    pub fn new(support: &'s Support, embed: bool) -> Self {
        let cloner = if embed {
            Cloner::new(support.module())
        } else {
            Cloner::referencing(support.module())
        };
        Imports { support, cloner }
    }

    /// The support module.
    #[must_use]
    pub fn support(&self) -> &'s Support {
        self.support
    }

    /// Returns `true` if support types live in the target.
    #[must_use]
    pub fn embeds(&self) -> bool {
        self.cloner.embeds()
    }

    /// Clones every support type into `target`.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn embed_all(&mut self, target: &mut Module) -> Result<usize> {
        let mut count = 0;
        for id in self.support.module().type_ids() {
            if self.support.module().ty(id).enclosing.is_none() {
                self.cloner.clone_type(target, id)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// A top-level support type.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the support module lacks `name`.
    pub fn ty(&mut self, target: &mut Module, name: &str) -> Result<TypeSig> {
        let id = self.support.require(name)?;
        self.cloner.clone_type(target, id)
    }

    /// A method of a top-level support type, by name and optionally exact signature.
    ///
    /// # Errors
    /// Returns [`Error::MemberNotFound`] if no such method exists.
    pub fn method(
        &mut self,
        target: &mut Module,
        owner: &str,
        name: &str,
        sig: Option<&MethodSig>,
    ) -> Result<MethodHandle> {
        let owner_id = self.support.require(owner)?;
        let method = self
            .support
            .module()
            .find_method(owner_id, name, sig)
            .ok_or_else(|| Error::MemberNotFound {
                owner: self.support.module().type_full_name(owner_id),
                member: name.to_string(),
            })?;
        self.cloner.clone_method(target, method)
    }

    /// Translates a signature of the support module.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn sig(&mut self, target: &mut Module, sig: &TypeSig) -> Result<TypeSig> {
        self.cloner.clone_sig(target, sig)
    }

    /// Translates a method handle of the support module.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn method_handle(&mut self, target: &mut Module, handle: &MethodHandle) -> Result<MethodHandle> {
        self.cloner.clone_method_handle(target, handle)
    }

    /// Translates a body of the support module.
    ///
    /// # Errors
    /// See [`Cloner::clone_body`].
    pub fn body(&mut self, target: &mut Module, body: &MethodBody) -> Result<MethodBody> {
        self.cloner.clone_body(target, body)
    }

    /// Finds the definition of a type signature of `target`.
    ///
    /// Returns `None` for primitives, generic parameters and references to other assemblies.
    ///
    /// # Errors
    /// See [`Support::resolve_sig`].
    pub fn locate(&self, target: &Module, sig: &TypeSig) -> Result<Option<Home>> {
        if let Some(local) = target.local_definition(sig) {
            return Ok(Some(Home::Target(local)));
        }
        Ok(self.support.resolve_sig(target, sig)?.map(Home::Support))
    }

    /// The module defining a located type.
    #[must_use]
    pub fn module_of<'m>(&'m self, target: &'m Module, home: Home) -> (&'m Module, TypeId) {
        match home {
            Home::Target(id) => (target, id),
            Home::Support(id) => (self.support.module(), id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{FACTORY_METHOD, LIB_LOADER};

    #[test]
    fn embedded_handles_are_definitions() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, true);
        imports.embed_all(&mut target)?;
        let types = target.types.len();

        let loader = imports.ty(&mut target, LIB_LOADER)?;
        assert!(matches!(loader, TypeSig::Def(_)));
        let factory = imports.method(&mut target, LIB_LOADER, FACTORY_METHOD, None)?;
        assert!(matches!(factory, MethodHandle::Def(_)));
        assert_eq!(target.types.len(), types);
        assert_eq!(imports.locate(&target, &loader)?, target.local_definition(&loader).map(Home::Target));
        Ok(())
    }

    #[test]
    fn referenced_handles_point_into_the_support_assembly() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);

        let loader = imports.ty(&mut target, LIB_LOADER)?;
        assert!(matches!(loader, TypeSig::Ref(_)));
        assert_eq!(imports.locate(&target, &loader)?, support.find(LIB_LOADER).map(Home::Support));
        let factory = imports.method(&mut target, LIB_LOADER, FACTORY_METHOD, None)?;
        assert!(matches!(factory, MethodHandle::Ref(_)));
        assert!(target.types.is_empty());
        Ok(())
    }
}
