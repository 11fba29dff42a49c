//! Initializers and the static constructor prefix.

use crate::{
    metadata::{
        attributes::{MemberAccess, MethodAttributes},
        emitter::BodyEmitter,
        members::MethodDef,
        module::Module,
        references::{FieldHandle, MethodHandle},
        token::{MethodId, TypeId},
        typesystem::{MethodSig, TypeSig},
    },
    rewriter::{loader::LoaderChoice, names, CoreRefs},
    verify::finalize_body,
    Result,
};

fn private_static() -> MethodAttributes {
    (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Private)
}

/// Adds a private static `void name()` with the body recorded by `build`.
///
/// # Errors
/// Propagates emitter and verifier failures.
pub fn add_routine<F>(target: &mut Module, owner: TypeId, name: &str, build: F) -> Result<MethodId>
where
    F: FnOnce(&mut BodyEmitter),
{
    let mut e = BodyEmitter::new();
    build(&mut e);
    e.ret();
    let name = names::unique(target, owner, name);
    let mut def = MethodDef::new(owner, &name, private_static(), MethodSig::new_static(TypeSig::Void, vec![]));
    def.body = Some(e.finish()?);
    let id = target.add_method(def);
    finalize_body(target, id)?;
    Ok(id)
}

/// `<Init>`: prepares every loader once, then runs the per-declaration initializers.
///
/// # Errors
/// See [`add_routine`].
pub fn type_initializer(
    target: &mut Module,
    refs: &CoreRefs,
    owner: TypeId,
    loaders: &[LoaderChoice],
    initializers: &[MethodId],
) -> Result<MethodId> {
    add_routine(target, owner, names::TYPE_INIT, |e| {
        for loader in loaders {
            loader.emit_instance(e);
            e.callvirt(refs.prepare.clone());
        }
        for init in initializers {
            e.call(MethodHandle::Def(*init));
        }
    })
}

/// Puts `newobj object::.ctor; stsfld lock; call <Init>` at the start of the static
/// constructor of `owner`, creating one if the type has none.
///
/// # Errors
/// Propagates emitter and verifier failures.
pub fn wire_static_constructor(
    target: &mut Module,
    refs: &CoreRefs,
    owner: TypeId,
    lock: FieldHandle,
    init: MethodId,
) -> Result<MethodId> {
    let cctor = match target.static_constructor(owner) {
        Some(existing) => existing,
        None => {
            let mut e = BodyEmitter::new();
            e.ret();
            let mut def = MethodDef::new(
                owner,
                ".cctor",
                private_static() | MethodAttributes::SPECIAL_NAME | MethodAttributes::RTSPECIAL_NAME,
                MethodSig::new_static(TypeSig::Void, vec![]),
            );
            def.body = Some(e.finish()?);
            target.add_method(def)
        }
    };

    let mut e = match target.method(cctor).body.as_ref() {
        Some(body) => BodyEmitter::from_body(body)?,
        None => {
            let mut e = BodyEmitter::new();
            e.ret();
            e
        }
    };
    e.prepend(|e| {
        e.newobj(refs.object_ctor.clone());
        e.stsfld(lock);
        e.call(MethodHandle::Def(init));
    });
    target.method_mut(cctor).body = Some(e.finish()?);
    finalize_body(target, cctor)?;
    Ok(cctor)
}
