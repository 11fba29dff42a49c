//! Retargeting of support references onto embedded definitions.

use std::collections::HashMap;

use crate::{
    interop::Support,
    metadata::{
        module::Module,
        references::{FieldHandle, MemberSig, MethodHandle, ResolutionScope},
        token::{FieldId, MemberRefId, MethodId, TypeId, TypeRefId},
        typesystem::TypeSig,
        walk::{walk_member_ref, walk_module, RefVisitor},
    },
};

/// The embedded definition a support type reference names.
fn embedded_type(support: &Support, target: &Module, id: TypeRefId) -> Option<TypeId> {
    if !support.owns_ref(target, id) {
        return None;
    }
    let reference = target.type_ref(id);
    match reference.scope {
        ResolutionScope::Nested(enclosing) => {
            embedded_type(support, target, enclosing).and_then(|outer| target.find_nested(outer, &reference.name))
        }
        _ => target.find_type(&reference.namespace, &reference.name),
    }
}

#[derive(Default)]
struct Retarget {
    types: HashMap<TypeRefId, TypeId>,
    methods: HashMap<MemberRefId, MethodId>,
    fields: HashMap<MemberRefId, FieldId>,
}

impl RefVisitor for Retarget {
    fn type_sig(&mut self, sig: &mut TypeSig) {
        if let TypeSig::Ref(id) = sig {
            if let Some(def) = self.types.get(id) {
                *sig = TypeSig::Def(*def);
            }
        }
    }

    fn method(&mut self, handle: &mut MethodHandle) {
        if let MethodHandle::Ref(id) = handle {
            if let Some(def) = self.methods.get(id) {
                *handle = MethodHandle::Def(*def);
            }
        }
    }

    fn field(&mut self, handle: &mut FieldHandle) {
        if let FieldHandle::Ref(id) = handle {
            if let Some(def) = self.fields.get(id) {
                *handle = FieldHandle::Def(*def);
            }
        }
    }
}

/// Points every reference into the support assembly at the embedded copy of its target.
///
/// Members of generic instantiations stay member references; only their parent is
/// retargeted. Returns the number of type and member references that now resolve locally.
pub fn retarget_support_refs(support: &Support, target: &mut Module) -> usize {
    let mut retarget = Retarget::default();
    for index in 0..target.type_refs.len() {
        let id = TypeRefId::from_index(index);
        if let Some(def) = embedded_type(support, target, id) {
            retarget.types.insert(id, def);
        }
    }
    if retarget.types.is_empty() {
        return 0;
    }

    for index in 0..target.member_refs.len() {
        let id = MemberRefId::from_index(index);
        let mut reference = target.member_refs[index].clone();
        walk_member_ref(&mut reference, &mut retarget);
        let TypeSig::Def(owner) = reference.parent else {
            continue;
        };
        match &reference.signature {
            MemberSig::Method(sig) => {
                if let Some(method) = target.find_method(owner, &reference.name, Some(sig)) {
                    retarget.methods.insert(id, method);
                }
            }
            MemberSig::Field(_) => {
                if let Some(field) = target.find_field(owner, &reference.name) {
                    retarget.fields.insert(id, field);
                }
            }
        }
    }

    let count = retarget.types.len() + retarget.methods.len() + retarget.fields.len();
    walk_module(target, &mut retarget);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::{Imports, FACTORY_METHOD, INTEROP_NAMESPACE, LIBRARY_LOADER, LIB_LOADER},
        metadata::{
            attributes::{MemberAccess, MethodAttributes, TypeAttributes},
            body::Operand,
            emitter::BodyEmitter,
            members::{MethodDef, TypeDef},
            opcodes::OpCode,
            references::{MemberRef, TypeRef},
            typesystem::MethodSig,
            walk::prune_references,
        },
        Result,
    };

    #[test]
    fn support_refs_become_definitions() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let assembly = target.add_assembly_ref(support.assembly_ref());
        let mut support_type = |name: &str| {
            target.add_type_ref(TypeRef {
                scope: ResolutionScope::Assembly(assembly),
                namespace: INTEROP_NAMESPACE.to_string(),
                name: name.to_string(),
                is_value_type: false,
            })
        };
        let loader = support_type(LIB_LOADER);
        let contract = support_type(LIBRARY_LOADER);
        let factory = target.add_member_ref(MemberRef {
            parent: TypeSig::Ref(loader),
            name: FACTORY_METHOD.to_string(),
            signature: MemberSig::Method(MethodSig::new_static(TypeSig::Ref(contract), vec![TypeSig::String])),
        });

        let owner = target.add_type(TypeDef::new("App", "Program", TypeAttributes::PUBLIC, None));
        let mut e = BodyEmitter::new();
        e.ldstr("");
        e.call(MethodHandle::Ref(factory));
        e.emit(OpCode::Pop);
        e.ret();
        let mut main = MethodDef::new(
            owner,
            "Main",
            MethodAttributes::STATIC.with_access(MemberAccess::Public),
            MethodSig::new_static(TypeSig::Void, vec![]),
        );
        main.body = Some(e.finish()?);
        let main = target.add_method(main);

        let mut imports = Imports::new(&support, true);
        imports.embed_all(&mut target)?;
        assert_eq!(retarget_support_refs(&support, &mut target), 3);

        let local_loader = target.find_type(INTEROP_NAMESPACE, LIB_LOADER);
        let expected = local_loader.and_then(|id| target.find_method(id, FACTORY_METHOD, None));
        let operand = target
            .method(main)
            .body
            .as_ref()
            .map(|body| body.instructions[1].operand.clone());
        assert_eq!(operand, expected.map(|id| Operand::Method(MethodHandle::Def(id))));

        prune_references(&mut target, &[support.assembly_name()]);
        assert!(target.find_assembly_ref(support.assembly_name()).is_none());
        Ok(())
    }
}
