//! Traversal of every reference a module holds.
//!
//! [`RefVisitor`] receives mutable access to each type signature node, method handle, field
//! handle and module reference id in a module, which makes one walker serve two purposes:
//! retargeting references (replace a `Ref` with the `Def` it now points at) and collecting the
//! set of references still in use. [`prune_references`] builds on the latter to drop rows of
//! the reference tables nothing points at anymore, renumbering the survivors.

use std::collections::HashSet;

use crate::metadata::{
    body::{HandlerKind, Operand},
    customattributes::{AttributeArgument, CustomAttribute},
    members::GenericParam,
    module::Module,
    references::{FieldHandle, MemberRef, MemberSig, MethodHandle, ResolutionScope},
    token::{AssemblyRefId, MemberRefId, ModuleRefId, TypeRefId},
    typesystem::{MethodSig, TypeSig},
};

/// Callbacks invoked by [`walk_definitions`] and [`walk_member_ref`].
///
/// Type signatures are visited bottom up: the callback for a compound signature runs after
/// its components were visited, so a visitor may replace any node it is handed.
pub trait RefVisitor {
    /// Called for every type signature node.
    fn type_sig(&mut self, _sig: &mut TypeSig) {}
    /// Called for every method handle, after its components were visited.
    fn method(&mut self, _handle: &mut MethodHandle) {}
    /// Called for every field handle.
    fn field(&mut self, _handle: &mut FieldHandle) {}
    /// Called for the library reference of every native declaration.
    fn module_ref(&mut self, _id: &mut ModuleRefId) {}
}

/// Visits a type signature and everything nested in it.
pub fn walk_type_sig<V: RefVisitor + ?Sized>(sig: &mut TypeSig, visitor: &mut V) {
    match sig {
        TypeSig::Ptr(inner)
        | TypeSig::ByRef(inner)
        | TypeSig::Pinned(inner)
        | TypeSig::SzArray(inner) => walk_type_sig(inner, visitor),
        TypeSig::ModOpt { modifier, inner } | TypeSig::ModReq { modifier, inner } => {
            walk_type_sig(modifier, visitor);
            walk_type_sig(inner, visitor);
        }
        TypeSig::GenericInst { generic, args, .. } => {
            walk_type_sig(generic, visitor);
            for arg in args {
                walk_type_sig(arg, visitor);
            }
        }
        TypeSig::FnPtr(method) => walk_method_sig(method, visitor),
        _ => {}
    }
    visitor.type_sig(sig);
}

/// Visits the return and parameter types of a method signature.
pub fn walk_method_sig<V: RefVisitor + ?Sized>(sig: &mut MethodSig, visitor: &mut V) {
    walk_type_sig(&mut sig.ret, visitor);
    for param in &mut sig.params {
        walk_type_sig(param, visitor);
    }
}

/// Visits a method handle, including the arguments of an instantiation.
pub fn walk_method_handle<V: RefVisitor + ?Sized>(handle: &mut MethodHandle, visitor: &mut V) {
    if let MethodHandle::Spec { method, args } = handle {
        walk_method_handle(method, visitor);
        for arg in args {
            walk_type_sig(arg, visitor);
        }
    }
    visitor.method(handle);
}

fn walk_argument<V: RefVisitor + ?Sized>(argument: &mut AttributeArgument, visitor: &mut V) {
    match argument {
        AttributeArgument::Type(Some(sig)) => walk_type_sig(sig, visitor),
        AttributeArgument::Enum { enum_type, .. } => walk_type_sig(enum_type, visitor),
        AttributeArgument::Array(Some(items)) => {
            for item in items {
                walk_argument(item, visitor);
            }
        }
        _ => {}
    }
}

fn walk_attributes<V: RefVisitor + ?Sized>(attributes: &mut [CustomAttribute], visitor: &mut V) {
    for attribute in attributes {
        walk_method_handle(&mut attribute.constructor, visitor);
        for argument in &mut attribute.fixed_args {
            walk_argument(argument, visitor);
        }
        for named in &mut attribute.named_args {
            walk_argument(&mut named.value, visitor);
        }
    }
}

fn walk_generic_params<V: RefVisitor + ?Sized>(params: &mut [GenericParam], visitor: &mut V) {
    for param in params {
        for constraint in &mut param.constraints {
            walk_type_sig(constraint, visitor);
        }
    }
}

fn walk_marshal<V: RefVisitor + ?Sized>(
    marshal: &mut Option<crate::metadata::marshalling::MarshalInfo>,
    visitor: &mut V,
) {
    if let Some(custom) = marshal.as_mut().and_then(|m| m.custom.as_mut()) {
        walk_type_sig(&mut custom.marshaler, visitor);
    }
}

/// Visits a member reference row: its parent and its signature.
pub fn walk_member_ref<V: RefVisitor + ?Sized>(reference: &mut MemberRef, visitor: &mut V) {
    walk_type_sig(&mut reference.parent, visitor);
    match &mut reference.signature {
        MemberSig::Method(sig) => walk_method_sig(sig, visitor),
        MemberSig::Field(sig) => walk_type_sig(sig, visitor),
    }
}

/// Visits every reference held by definitions of `module`.
///
/// The reference tables themselves (type refs, member refs) are not visited; use
/// [`walk_member_ref`] for member reference rows.
pub fn walk_definitions<V: RefVisitor + ?Sized>(module: &mut Module, visitor: &mut V) {
    walk_attributes(&mut module.custom_attributes, visitor);

    for def in &mut module.types {
        if let Some(base) = def.extends.as_mut() {
            walk_type_sig(base, visitor);
        }
        for interface in &mut def.interfaces {
            walk_type_sig(interface, visitor);
        }
        walk_generic_params(&mut def.generic_params, visitor);
        walk_attributes(&mut def.custom_attributes, visitor);
    }

    for field in &mut module.fields {
        walk_type_sig(&mut field.field_type, visitor);
        walk_marshal(&mut field.marshal, visitor);
        walk_attributes(&mut field.custom_attributes, visitor);
    }

    for property in &mut module.properties {
        walk_type_sig(&mut property.property_type, visitor);
        walk_attributes(&mut property.custom_attributes, visitor);
    }

    for method in &mut module.methods {
        walk_method_sig(&mut method.signature, visitor);
        walk_generic_params(&mut method.generic_params, visitor);
        walk_attributes(&mut method.custom_attributes, visitor);
        walk_marshal(&mut method.return_param.marshal, visitor);
        walk_attributes(&mut method.return_param.custom_attributes, visitor);
        for param in &mut method.params {
            walk_marshal(&mut param.marshal, visitor);
            walk_attributes(&mut param.custom_attributes, visitor);
        }
        if let Some(pinvoke) = method.pinvoke.as_mut() {
            visitor.module_ref(&mut pinvoke.module);
        }

        let Some(body) = method.body.as_mut() else {
            continue;
        };
        for local in &mut body.locals {
            walk_type_sig(&mut local.local_type, visitor);
        }
        for handler in &mut body.exception_handlers {
            if let HandlerKind::Catch(sig) = &mut handler.kind {
                walk_type_sig(sig, visitor);
            }
        }
        for instr in &mut body.instructions {
            match &mut instr.operand {
                Operand::Type(sig) => walk_type_sig(sig, visitor),
                Operand::Method(handle) => walk_method_handle(handle, visitor),
                Operand::Field(handle) => visitor.field(handle),
                Operand::Sig(sig) => walk_method_sig(sig, visitor),
                _ => {}
            }
        }
    }
}

/// Visits the definitions and every member reference row of `module`.
pub fn walk_module<V: RefVisitor + ?Sized>(module: &mut Module, visitor: &mut V) {
    walk_definitions(module, visitor);
    for reference in &mut module.member_refs {
        walk_member_ref(reference, visitor);
    }
}

#[derive(Default)]
struct Usage {
    type_refs: HashSet<TypeRefId>,
    member_refs: HashSet<MemberRefId>,
    module_refs: HashSet<ModuleRefId>,
}

impl RefVisitor for Usage {
    fn type_sig(&mut self, sig: &mut TypeSig) {
        if let TypeSig::Ref(id) = sig {
            self.type_refs.insert(*id);
        }
    }

    fn method(&mut self, handle: &mut MethodHandle) {
        if let MethodHandle::Ref(id) = handle {
            self.member_refs.insert(*id);
        }
    }

    fn field(&mut self, handle: &mut FieldHandle) {
        if let FieldHandle::Ref(id) = handle {
            self.member_refs.insert(*id);
        }
    }

    fn module_ref(&mut self, id: &mut ModuleRefId) {
        self.module_refs.insert(*id);
    }
}

struct Remap {
    type_refs: Vec<Option<TypeRefId>>,
    member_refs: Vec<Option<MemberRefId>>,
    module_refs: Vec<Option<ModuleRefId>>,
}

impl RefVisitor for Remap {
    fn type_sig(&mut self, sig: &mut TypeSig) {
        if let TypeSig::Ref(id) = sig {
            if let Some(Some(new)) = self.type_refs.get(id.index()) {
                *id = *new;
            }
        }
    }

    fn method(&mut self, handle: &mut MethodHandle) {
        if let MethodHandle::Ref(id) = handle {
            if let Some(Some(new)) = self.member_refs.get(id.index()) {
                *id = *new;
            }
        }
    }

    fn field(&mut self, handle: &mut FieldHandle) {
        if let FieldHandle::Ref(id) = handle {
            if let Some(Some(new)) = self.member_refs.get(id.index()) {
                *id = *new;
            }
        }
    }

    fn module_ref(&mut self, id: &mut ModuleRefId) {
        if let Some(Some(new)) = self.module_refs.get(id.index()) {
            *id = *new;
        }
    }
}

fn renumber<T, I: Copy>(
    rows: &mut Vec<T>,
    keep: impl Fn(usize) -> bool,
    make: impl Fn(usize) -> I,
) -> Vec<Option<I>> {
    let mut map = Vec::with_capacity(rows.len());
    let mut next = 0;
    let mut index = 0;
    rows.retain(|_| {
        let kept = keep(index);
        map.push(kept.then(|| make(next)));
        if kept {
            next += 1;
        }
        index += 1;
        kept
    });
    map
}

/// Number of rows removed by [`prune_references`], per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Removed type references
    pub type_refs: usize,
    /// Removed member references
    pub member_refs: usize,
    /// Removed module references
    pub module_refs: usize,
    /// Removed assembly references
    pub assembly_refs: usize,
}

/// Removes reference rows that nothing in the module uses.
///
/// Type and member references are kept when reachable from a definition, directly or through
/// another kept reference (the parent of a member reference, the enclosing type of a nested
/// type reference). Module references are kept while a native declaration names them.
/// Assembly references are only ever removed when unused and listed in `removable_assemblies`.
pub fn prune_references(module: &mut Module, removable_assemblies: &[&str]) -> PruneStats {
    let mut usage = Usage::default();
    walk_definitions(module, &mut usage);

    // member refs pull in the types of their signatures; nested type refs pull in the
    // enclosing ref
    let mut walked: HashSet<MemberRefId> = HashSet::new();
    loop {
        let pending: Vec<MemberRefId> = usage
            .member_refs
            .iter()
            .copied()
            .filter(|id| !walked.contains(id))
            .collect();
        if pending.is_empty() {
            break;
        }
        for id in pending {
            walked.insert(id);
            let mut reference = module.member_refs[id.index()].clone();
            walk_member_ref(&mut reference, &mut usage);
        }
    }
    let mut scopes: Vec<TypeRefId> = usage.type_refs.iter().copied().collect();
    while let Some(id) = scopes.pop() {
        match module.type_refs[id.index()].scope {
            ResolutionScope::Nested(enclosing) => {
                if usage.type_refs.insert(enclosing) {
                    scopes.push(enclosing);
                }
            }
            ResolutionScope::Module(module_ref) => {
                usage.module_refs.insert(module_ref);
            }
            _ => {}
        }
    }

    let before = (
        module.type_refs.len(),
        module.member_refs.len(),
        module.module_refs.len(),
        module.assembly_refs.len(),
    );

    let mut remap = Remap {
        type_refs: renumber(
            &mut module.type_refs,
            |i| usage.type_refs.contains(&TypeRefId::from_index(i)),
            TypeRefId::from_index,
        ),
        member_refs: renumber(
            &mut module.member_refs,
            |i| usage.member_refs.contains(&MemberRefId::from_index(i)),
            MemberRefId::from_index,
        ),
        module_refs: renumber(
            &mut module.module_refs,
            |i| usage.module_refs.contains(&ModuleRefId::from_index(i)),
            ModuleRefId::from_index,
        ),
    };
    walk_module(module, &mut remap);
    for reference in &mut module.type_refs {
        match &mut reference.scope {
            ResolutionScope::Nested(id) => {
                if let Some(Some(new)) = remap.type_refs.get(id.index()) {
                    *id = *new;
                }
            }
            ResolutionScope::Module(id) => remap.module_ref(id),
            _ => {}
        }
    }

    let used_assemblies: HashSet<AssemblyRefId> = module
        .type_refs
        .iter()
        .filter_map(|reference| match reference.scope {
            ResolutionScope::Assembly(id) => Some(id),
            _ => None,
        })
        .collect();
    let names: Vec<String> = module.assembly_refs.iter().map(|a| a.name.clone()).collect();
    let assembly_map = renumber(
        &mut module.assembly_refs,
        |i| {
            used_assemblies.contains(&AssemblyRefId::from_index(i))
                || !removable_assemblies.contains(&names[i].as_str())
        },
        AssemblyRefId::from_index,
    );
    for reference in &mut module.type_refs {
        if let ResolutionScope::Assembly(id) = &mut reference.scope {
            if let Some(Some(new)) = assembly_map.get(id.index()) {
                *id = *new;
            }
        }
    }

    PruneStats {
        type_refs: before.0 - module.type_refs.len(),
        member_refs: before.1 - module.member_refs.len(),
        module_refs: before.2 - module.module_refs.len(),
        assembly_refs: before.3 - module.assembly_refs.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        attributes::{FieldAttributes, MethodAttributes, TypeAttributes},
        emitter::BodyEmitter,
        members::{FieldDef, MethodDef, TypeDef},
        references::{AssemblyRef, TypeRef, Version},
    };

    #[test]
    fn prune_drops_unused_and_renumbers() -> crate::Result<()> {
        let mut module = Module::new("Test.dll", "Test");
        let object = module.core_type("System", "Object", false);
        let unused = module.core_type("System", "Unused", false);
        let console = module.core_type("System", "Console", false);
        let other = module.add_assembly_ref(AssemblyRef::new("Other", Version::new(1, 0, 0, 0)));
        module.add_type_ref(TypeRef {
            scope: ResolutionScope::Assembly(other),
            namespace: "Other".into(),
            name: "Gone".into(),
            is_value_type: false,
        });

        let owner = module.add_type(TypeDef::new("Ns", "T", TypeAttributes::PUBLIC, Some(object.clone())));
        module.add_field(FieldDef::new(owner, "f", FieldAttributes::STATIC, TypeSig::I4));
        let write_line = module.method_on(
            &console,
            "WriteLine",
            MethodSig::new_static(TypeSig::Void, vec![TypeSig::String]),
        )?;
        module.method_on(&unused, "Nothing", MethodSig::new_static(TypeSig::Void, vec![]))?;

        let mut method = MethodDef::new(owner, "M", MethodAttributes::STATIC, MethodSig::new_static(TypeSig::Void, vec![]));
        let mut e = BodyEmitter::new();
        e.ldstr("hi");
        e.call(write_line);
        e.ret();
        method.body = Some(e.finish()?);
        module.add_method(method);

        let stats = prune_references(&mut module, &["Other"]);
        assert_eq!(stats.type_refs, 2);
        assert_eq!(stats.member_refs, 1);
        assert_eq!(stats.assembly_refs, 1);
        assert_eq!(module.type_refs.len(), 2);
        assert_eq!(module.member_refs.len(), 1);
        assert_eq!(module.member_refs[0].name, "WriteLine");
        assert_eq!(module.type_name(&module.member_refs[0].parent).map(|n| n.name), Some("Console"));
        Ok(())
    }

    #[test]
    fn retarget_visitor_replaces_leaves() {
        struct ToDef;
        impl RefVisitor for ToDef {
            fn type_sig(&mut self, sig: &mut TypeSig) {
                if matches!(sig, TypeSig::Ref(_)) {
                    *sig = TypeSig::Def(crate::metadata::token::TypeId(0));
                }
            }
        }
        let mut sig = TypeSig::Ref(TypeRefId(3)).sz_array().by_ref();
        walk_type_sig(&mut sig, &mut ToDef);
        assert_eq!(
            sig,
            TypeSig::Def(crate::metadata::token::TypeId(0)).sz_array().by_ref()
        );
    }
}
