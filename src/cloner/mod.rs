//! Copies entities of one module into another.
//!
//! A [`Cloner`] is bound to a source module and keeps memo tables from source entities to
//! their counterparts in the destination, so every entity is copied at most once and cyclic
//! type relationships terminate. Before creating anything the cloner looks the entity up in
//! the destination by its identity key (namespace and name for top-level types, enclosing
//! type and name for nested types, name and parameter shape for methods, name for fields and
//! properties), which makes repeated cloning into the same module idempotent.
//!
//! Two modes exist:
//!
//! - [`Cloner::new`] embeds: source definitions become definitions of the destination,
//!   together with their members and bodies
//! - [`Cloner::referencing`] imports: source definitions become type and member references
//!   into the source assembly
//!
//! In both modes references of the source are re-created in the destination, except those
//! naming the destination's own assembly, which resolve to its local definitions.
//!
//! # Examples
//!
//! ```rust
//! use dotbind::{cloner::Cloner, interop::Support, Module};
//!
//! let support = Support::builtin()?;
//! let mut target = Module::new("App.dll", "App");
//! let mut cloner = Cloner::new(support.module());
//! for id in support.module().type_ids() {
//!     cloner.clone_type(&mut target, id)?;
//! }
//! assert_eq!(target.types.len(), support.module().types.len());
//! # Ok::<(), dotbind::Error>(())
//! ```

mod body;
mod resolve;

use std::collections::{HashMap, VecDeque};

use crate::{
    metadata::{
        members::{FieldDef, GenericParam, MethodDef, ParamDef, PropertyDef, ReturnParam, TypeDef},
        module::Module,
        pinvoke::PInvokeInfo,
        references::{
            AssemblyRef, FieldHandle, MemberRef, MemberSig, MethodHandle, ResolutionScope, TypeRef,
        },
        token::{FieldId, MethodId, PropertyId, TypeId, TypeRefId},
        typesystem::TypeSig,
    },
    Error, Result,
};

/// What happens to source definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Embed,
    Reference,
}

#[derive(Debug, Clone, Copy)]
enum Work {
    Type { source: TypeId, dest: TypeId, fresh: bool },
    Body { source: MethodId, dest: MethodId },
}

/// Clones entities of a source module into destination modules.
///
/// The memo tables are only valid for one destination; use a fresh cloner per destination
/// module.
#[derive(Debug)]
pub struct Cloner<'s> {
    source: &'s Module,
    mode: Mode,
    types: HashMap<TypeId, TypeSig>,
    methods: HashMap<MethodId, MethodHandle>,
    fields: HashMap<FieldId, FieldHandle>,
    type_refs: HashMap<TypeRefId, TypeSig>,
    pending: VecDeque<Work>,
}

impl<'s> Cloner<'s> {
    /// Creates a cloner that embeds source definitions into the destination.
    #[must_use]
    pub fn new(source: &'s Module) -> Self {
        Cloner::with_mode(source, Mode::Embed)
    }

    /// Creates a cloner that turns source definitions into references to the source assembly.
    #[must_use]
    pub fn referencing(source: &'s Module) -> Self {
        Cloner::with_mode(source, Mode::Reference)
    }

    fn with_mode(source: &'s Module, mode: Mode) -> Self {
        Cloner {
            source,
            mode,
            types: HashMap::new(),
            methods: HashMap::new(),
            fields: HashMap::new(),
            type_refs: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// The module entities are cloned from.
    #[must_use]
    pub fn source(&self) -> &'s Module {
        self.source
    }

    /// Returns `true` if source definitions are embedded.
    #[must_use]
    pub fn embeds(&self) -> bool {
        self.mode == Mode::Embed
    }

    /// Clones a type with all its members, nested types and bodies.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] or [`Error::MemberNotFound`] if a reference of the
    /// source cannot be resolved where it must be.
    pub fn clone_type(&mut self, dest: &mut Module, source: TypeId) -> Result<TypeSig> {
        let sig = self.ensure_type(dest, source)?;
        self.drain(dest)?;
        Ok(sig)
    }

    /// Clones a method and returns a handle usable in the destination.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn clone_method(&mut self, dest: &mut Module, source: MethodId) -> Result<MethodHandle> {
        let handle = self.ensure_method(dest, source)?;
        self.drain(dest)?;
        Ok(handle)
    }

    /// Clones a field and returns a handle usable in the destination.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn clone_field(&mut self, dest: &mut Module, source: FieldId) -> Result<FieldHandle> {
        let handle = self.ensure_field(dest, source)?;
        self.drain(dest)?;
        Ok(handle)
    }

    /// Translates a signature of the source into the destination.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn clone_sig(&mut self, dest: &mut Module, sig: &TypeSig) -> Result<TypeSig> {
        let sig = self.import_sig(dest, sig)?;
        self.drain(dest)?;
        Ok(sig)
    }

    /// Translates a method handle of the source into the destination.
    ///
    /// # Errors
    /// See [`Cloner::clone_type`].
    pub fn clone_method_handle(&mut self, dest: &mut Module, handle: &MethodHandle) -> Result<MethodHandle> {
        let handle = self.import_method(dest, handle)?;
        self.drain(dest)?;
        Ok(handle)
    }

    fn drain(&mut self, dest: &mut Module) -> Result<()> {
        while let Some(work) = self.pending.pop_front() {
            match work {
                Work::Type {
                    source,
                    dest: id,
                    fresh,
                } => self.fill_type(dest, source, id, fresh)?,
                Work::Body { source, dest: id } => {
                    let module = self.source;
                    if let Some(body) = module.method(source).body.as_ref() {
                        let cloned = self.copy_body(dest, body)?;
                        dest.method_mut(id).body = Some(cloned);
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_type(&mut self, dest: &mut Module, source: TypeId) -> Result<TypeSig> {
        if let Some(sig) = self.types.get(&source) {
            return Ok(sig.clone());
        }
        let module = self.source;
        let def = module.ty(source);
        let sig = match self.mode {
            Mode::Embed => {
                let enclosing = match def.enclosing {
                    Some(outer) => match self.ensure_type(dest, outer)? {
                        TypeSig::Def(id) => Some(id),
                        _ => None,
                    },
                    None => None,
                };
                let existing = match enclosing {
                    Some(outer) => dest.find_nested(outer, &def.name),
                    None => dest.find_type(&def.namespace, &def.name),
                };
                let id = existing.unwrap_or_else(|| {
                    let mut shell = TypeDef::new(&def.namespace, &def.name, def.flags, None);
                    shell.enclosing = enclosing;
                    dest.add_type(shell)
                });
                self.pending.push_back(Work::Type {
                    source,
                    dest: id,
                    fresh: existing.is_none(),
                });
                TypeSig::Def(id)
            }
            Mode::Reference => {
                let scope = match def.enclosing {
                    Some(outer) => match self.ensure_type(dest, outer)? {
                        TypeSig::Ref(id) => ResolutionScope::Nested(id),
                        _ => ResolutionScope::CurrentModule,
                    },
                    None => ResolutionScope::Assembly(self.source_assembly(dest)),
                };
                let is_value_type = self.source.is_value_type(&TypeSig::Def(source));
                TypeSig::Ref(dest.add_type_ref(TypeRef {
                    scope,
                    namespace: def.namespace.clone(),
                    name: def.name.clone(),
                    is_value_type,
                }))
            }
        };
        self.types.insert(source, sig.clone());
        Ok(sig)
    }

    fn source_assembly(&self, dest: &mut Module) -> crate::metadata::token::AssemblyRefId {
        let version = self
            .source
            .assembly
            .as_ref()
            .map(|assembly| assembly.version)
            .unwrap_or_default();
        dest.add_assembly_ref(AssemblyRef::new(self.source.assembly_name(), version))
    }

    fn fill_type(&mut self, dest: &mut Module, source: TypeId, id: TypeId, fresh: bool) -> Result<()> {
        let module = self.source;
        let def = module.ty(source);
        if fresh {
            let extends = match &def.extends {
                Some(base) => Some(self.import_sig(dest, base)?),
                None => None,
            };
            let mut interfaces = Vec::new();
            for interface in self.top_level_interfaces(&def.interfaces) {
                interfaces.push(self.import_sig(dest, interface)?);
            }
            let generic_params = self.clone_generic_params(dest, &def.generic_params)?;
            let custom_attributes = self.clone_attributes(dest, &def.custom_attributes)?;
            let shell = dest.ty_mut(id);
            shell.extends = extends;
            shell.interfaces = interfaces;
            shell.generic_params = generic_params;
            shell.custom_attributes = custom_attributes;
        }

        for field in def.fields.clone() {
            self.ensure_field(dest, field)?;
        }
        for method in def.methods.clone() {
            self.ensure_method(dest, method)?;
        }
        for property in def.properties.clone() {
            self.ensure_property(dest, property, id)?;
        }
        for nested in def.nested.clone() {
            self.ensure_type(dest, nested)?;
        }
        Ok(())
    }

    /// Drops interfaces that another listed interface already inherits.
    fn top_level_interfaces<'a>(&self, interfaces: &'a [TypeSig]) -> Vec<&'a TypeSig> {
        interfaces
            .iter()
            .filter(|candidate| {
                !interfaces.iter().any(|other| {
                    other != *candidate && self.inherits_interface(other, candidate, 0)
                })
            })
            .collect()
    }

    fn inherits_interface(&self, interface: &TypeSig, wanted: &TypeSig, depth: usize) -> bool {
        let Some(id) = self.source.local_definition(interface) else {
            return false;
        };
        if depth > self.source.types.len() {
            return false;
        }
        self.source.ty(id).interfaces.iter().any(|base| {
            base == wanted || self.inherits_interface(base, wanted, depth + 1)
        })
    }

    fn clone_generic_params(&mut self, dest: &mut Module, params: &[GenericParam]) -> Result<Vec<GenericParam>> {
        let mut cloned = Vec::with_capacity(params.len());
        for param in params {
            let mut constraints = Vec::with_capacity(param.constraints.len());
            for constraint in &param.constraints {
                constraints.push(self.import_sig(dest, constraint)?);
            }
            cloned.push(GenericParam {
                number: param.number,
                flags: param.flags,
                name: param.name.clone(),
                constraints,
            });
        }
        Ok(cloned)
    }

    fn ensure_field(&mut self, dest: &mut Module, source: FieldId) -> Result<FieldHandle> {
        if let Some(handle) = self.fields.get(&source) {
            return Ok(*handle);
        }
        let module = self.source;
        let def = module.field(source);
        let owner = self.ensure_type(dest, def.owner)?;
        let field_type = self.import_sig(dest, &def.field_type)?;
        let generic_owner = !self.source.ty(def.owner).generic_params.is_empty();

        let handle = match (&owner, self.mode) {
            (TypeSig::Def(owner_id), Mode::Embed) => {
                let id = match dest.find_field(*owner_id, &def.name) {
                    Some(existing) => existing,
                    None => {
                        let marshal = self.clone_marshal(dest, def.marshal.as_ref())?;
                        let custom_attributes = self.clone_attributes(dest, &def.custom_attributes)?;
                        dest.add_field(FieldDef {
                            owner: *owner_id,
                            flags: def.flags,
                            name: def.name.clone(),
                            field_type: field_type.clone(),
                            marshal,
                            custom_attributes,
                        })
                    }
                };
                if generic_owner {
                    let parent = self.open_instantiation(owner.clone(), def.owner);
                    FieldHandle::Ref(dest.add_member_ref(MemberRef {
                        parent,
                        name: def.name.clone(),
                        signature: MemberSig::Field(field_type),
                    }))
                } else {
                    FieldHandle::Def(id)
                }
            }
            _ => {
                let parent = if generic_owner {
                    self.open_instantiation(owner, def.owner)
                } else {
                    owner
                };
                FieldHandle::Ref(dest.add_member_ref(MemberRef {
                    parent,
                    name: def.name.clone(),
                    signature: MemberSig::Field(field_type),
                }))
            }
        };
        self.fields.insert(source, handle);
        Ok(handle)
    }

    /// `Owner<!0, !1, ...>` over the owner's own generic parameters.
    fn open_instantiation(&self, owner: TypeSig, source: TypeId) -> TypeSig {
        let count = self.source.ty(source).generic_params.len();
        let args = (0..count)
            .map(|n| TypeSig::Var(u16::try_from(n).unwrap_or(u16::MAX)))
            .collect();
        TypeSig::GenericInst {
            generic: Box::new(owner),
            args,
            value_type: self.source.is_value_type(&TypeSig::Def(source)),
        }
    }

    fn ensure_method(&mut self, dest: &mut Module, source: MethodId) -> Result<MethodHandle> {
        if let Some(handle) = self.methods.get(&source) {
            return Ok(handle.clone());
        }
        let module = self.source;
        let def = module.method(source);
        let owner = self.ensure_type(dest, def.owner)?;
        let signature = self.import_method_sig(dest, &def.signature)?;
        let generic_owner = !self.source.ty(def.owner).generic_params.is_empty();

        let handle = match (&owner, self.mode) {
            (TypeSig::Def(owner_id), Mode::Embed) => {
                let existing = dest
                    .find_method(*owner_id, &def.name, Some(&signature))
                    .or_else(|| {
                        dest.find_method_by_params(
                            *owner_id,
                            &def.name,
                            signature.has_this,
                            &signature.params,
                        )
                    });
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = self.add_method_shell(dest, def, *owner_id, signature.clone())?;
                        self.pending.push_back(Work::Body { source, dest: id });
                        id
                    }
                };
                if generic_owner {
                    let parent = self.open_instantiation(owner.clone(), def.owner);
                    MethodHandle::Ref(dest.add_member_ref(MemberRef {
                        parent,
                        name: def.name.clone(),
                        signature: MemberSig::Method(signature),
                    }))
                } else {
                    MethodHandle::Def(id)
                }
            }
            _ => {
                let parent = if generic_owner {
                    self.open_instantiation(owner, def.owner)
                } else {
                    owner
                };
                MethodHandle::Ref(dest.add_member_ref(MemberRef {
                    parent,
                    name: def.name.clone(),
                    signature: MemberSig::Method(signature),
                }))
            }
        };
        self.methods.insert(source, handle.clone());
        Ok(handle)
    }

    fn add_method_shell(
        &mut self,
        dest: &mut Module,
        def: &MethodDef,
        owner: TypeId,
        signature: crate::metadata::typesystem::MethodSig,
    ) -> Result<MethodId> {
        let mut params = Vec::with_capacity(def.params.len());
        for param in &def.params {
            params.push(ParamDef {
                flags: param.flags,
                name: param.name.clone(),
                marshal: self.clone_marshal(dest, param.marshal.as_ref())?,
                custom_attributes: self.clone_attributes(dest, &param.custom_attributes)?,
            });
        }
        let return_param = ReturnParam {
            marshal: self.clone_marshal(dest, def.return_param.marshal.as_ref())?,
            custom_attributes: self.clone_attributes(dest, &def.return_param.custom_attributes)?,
        };
        let pinvoke = def.pinvoke.as_ref().map(|pinvoke| PInvokeInfo {
            flags: pinvoke.flags,
            entry_point: pinvoke.entry_point.clone(),
            module: dest.add_module_ref(&self.source.module_ref(pinvoke.module).name),
        });
        let generic_params = self.clone_generic_params(dest, &def.generic_params)?;
        let custom_attributes = self.clone_attributes(dest, &def.custom_attributes)?;

        Ok(dest.add_method(MethodDef {
            owner,
            flags: def.flags,
            impl_flags: def.impl_flags,
            name: def.name.clone(),
            signature,
            params,
            return_param,
            generic_params,
            pinvoke,
            body: None,
            custom_attributes,
        }))
    }

    fn ensure_property(&mut self, dest: &mut Module, source: PropertyId, owner: TypeId) -> Result<()> {
        let module = self.source;
        let def = module.property(source);
        if dest.find_property(owner, &def.name).is_some() {
            return Ok(());
        }
        let accessor = |cloner: &mut Self, dest: &mut Module, method: Option<MethodId>| -> Result<Option<MethodId>> {
            match method {
                Some(method) => match cloner.ensure_method(dest, method)? {
                    MethodHandle::Def(id) => Ok(Some(id)),
                    _ => {
                        let source_def = cloner.source.method(method);
                        dest.find_method(owner, &source_def.name, None)
                            .map(Some)
                            .ok_or_else(|| Error::MemberNotFound {
                                owner: dest.type_full_name(owner),
                                member: source_def.name.clone(),
                            })
                    }
                },
                None => Ok(None),
            }
        };
        let getter = accessor(self, dest, def.getter)?;
        let setter = accessor(self, dest, def.setter)?;
        let property_type = self.import_sig(dest, &def.property_type)?;
        let custom_attributes = self.clone_attributes(dest, &def.custom_attributes)?;
        dest.add_property(PropertyDef {
            owner,
            flags: def.flags,
            name: def.name.clone(),
            property_type,
            getter,
            setter,
            custom_attributes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::{Support, CSTRING_MARSHALER, INTEROP_NAMESPACE, LIB_LOADER},
        metadata::walk::{walk_definitions, RefVisitor},
        verify::verify_body,
    };

    fn embedded() -> Result<(Support, Module)> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut cloner = Cloner::new(support.module());
        for id in support.module().type_ids() {
            cloner.clone_type(&mut target, id)?;
        }
        Ok((support, target))
    }

    #[test]
    fn embedding_recreates_every_definition() -> Result<()> {
        let (support, target) = embedded()?;
        let source = support.module();
        assert_eq!(target.types.len(), source.types.len());
        assert_eq!(target.methods.len(), source.methods.len());
        assert_eq!(target.fields.len(), source.fields.len());
        assert_eq!(target.properties.len(), source.properties.len());
        assert!(target.find_assembly_ref(source.assembly_name()).is_none());
        for method in &target.methods {
            if let Some(body) = &method.body {
                verify_body(&target, method, body)?;
            }
        }
        Ok(())
    }

    #[test]
    fn cloning_twice_creates_nothing_new() -> Result<()> {
        let (support, mut target) = embedded()?;
        let counts = (target.types.len(), target.methods.len(), target.member_refs.len());
        let mut again = Cloner::new(support.module());
        for id in support.module().type_ids() {
            again.clone_type(&mut target, id)?;
        }
        assert_eq!(
            counts,
            (target.types.len(), target.methods.len(), target.member_refs.len())
        );
        Ok(())
    }

    #[test]
    fn cloned_references_point_into_the_destination() -> Result<()> {
        struct Bounds<'a> {
            module: &'a Module,
            ok: bool,
        }
        impl RefVisitor for Bounds<'_> {
            fn type_sig(&mut self, sig: &mut TypeSig) {
                match sig {
                    TypeSig::Def(id) => self.ok &= id.index() < self.module.types.len(),
                    TypeSig::Ref(id) => self.ok &= id.index() < self.module.type_refs.len(),
                    _ => {}
                }
            }
            fn method(&mut self, handle: &mut MethodHandle) {
                match handle {
                    MethodHandle::Def(id) => self.ok &= id.index() < self.module.methods.len(),
                    MethodHandle::Ref(id) => self.ok &= id.index() < self.module.member_refs.len(),
                    MethodHandle::Spec { .. } => {}
                }
            }
        }
        let (_, target) = embedded()?;
        let mut copy = target.clone();
        let mut bounds = Bounds {
            module: &target,
            ok: true,
        };
        walk_definitions(&mut copy, &mut bounds);
        assert!(bounds.ok);
        Ok(())
    }

    #[test]
    fn referencing_imports_the_support_assembly() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut cloner = Cloner::referencing(support.module());
        let loader = support.require(LIB_LOADER)?;
        let sig = cloner.clone_type(&mut target, loader)?;
        let TypeSig::Ref(id) = sig else {
            panic!("expected a type reference, got {sig:?}");
        };
        assert_eq!(target.type_ref(id).namespace, INTEROP_NAMESPACE);
        assert!(support.owns_ref(&target, id));
        assert!(target.types.is_empty());

        let marshaler = support.require(CSTRING_MARSHALER)?;
        let factory = support
            .module()
            .find_method(marshaler, "GetInstance", None)
            .ok_or_else(|| Error::Error("no factory".into()))?;
        let handle = cloner.clone_method(&mut target, factory)?;
        assert!(matches!(handle, MethodHandle::Ref(_)));
        Ok(())
    }

    #[test]
    fn native_declarations_keep_their_library() -> Result<()> {
        let (_, target) = embedded()?;
        let dlopen: Vec<_> = target.methods.iter().filter(|m| m.name == "dlopen").collect();
        assert_eq!(dlopen.len(), 2);
        let mut libraries = Vec::new();
        for method in dlopen {
            let pinvoke = method
                .pinvoke
                .as_ref()
                .ok_or_else(|| Error::Error("descriptor missing".into()))?;
            libraries.push(target.module_ref(pinvoke.module).name.as_str());
            assert!(method.body.is_none());
        }
        libraries.sort_unstable();
        assert_eq!(libraries, ["libc", "libdl.so.2"]);
        Ok(())
    }
}
