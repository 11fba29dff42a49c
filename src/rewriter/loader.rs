//! Loader selection and the per-library load routines.

use crate::{
    interop::{Home, Imports, FACTORY_METHOD, IMPORT_LOADER_ATTRIBUTE, INTEROP_NAMESPACE, LIBRARY_LOADER, LIB_LOADER},
    metadata::{
        attributes::{FieldAttributes, MemberAccess, MethodAttributes},
        customattributes::AttributeArgument,
        emitter::BodyEmitter,
        members::{FieldDef, MethodDef},
        module::Module,
        opcodes::OpCode,
        references::{FieldHandle, MethodHandle},
        token::{MethodId, TypeId},
        typesystem::{MethodSig, TypeSig},
    },
    rewriter::{names, CoreRefs},
    Error, Result,
};

/// The loader instance a declaration binds through.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderChoice {
    /// The loader type
    pub loader: TypeSig,
    /// Its `static GetInstance(string)`
    pub factory: MethodHandle,
    /// The cookie handed to the factory
    pub cookie: String,
}

impl LoaderChoice {
    /// `ldstr cookie; call GetInstance`, leaving the loader on the stack.
    pub fn emit_instance(&self, e: &mut BodyEmitter) {
        e.ldstr(&self.cookie);
        e.call(self.factory.clone());
    }

    /// Returns `true` if both choices yield the same loader instance.
    #[must_use]
    pub fn same_instance(&self, other: &LoaderChoice) -> bool {
        self.loader == other.loader && self.cookie == other.cookie
    }
}

/// Reads `ImportLoaderAttribute([Type loader,] string cookie)` from `method`, then its
/// declaring type.
fn annotated(module: &Module, method: MethodId) -> Option<(Option<TypeSig>, String)> {
    let def = module.method(method);
    let owner = &module.ty(def.owner).custom_attributes;
    [&def.custom_attributes, owner].into_iter().find_map(|attributes| {
        module
            .attributes_of(attributes, INTEROP_NAMESPACE, IMPORT_LOADER_ATTRIBUTE)
            .next()
            .map(|attribute| match attribute.fixed_args.as_slice() {
                [AttributeArgument::Type(loader), cookie] => {
                    (loader.clone(), cookie.as_str().unwrap_or_default().to_string())
                }
                [cookie] => (None, cookie.as_str().unwrap_or_default().to_string()),
                _ => (None, String::new()),
            })
    })
}

/// Picks the loader of `method`.
///
/// # Errors
/// Returns [`Error::MissingFactory`] if the selected loader type has no
/// `static GetInstance(string)`.
pub fn select(imports: &mut Imports<'_>, target: &mut Module, method: MethodId) -> Result<LoaderChoice> {
    let (loader, cookie) = annotated(target, method).unwrap_or_default();
    let Some(loader) = loader else {
        let factory = imports.method(target, LIB_LOADER, FACTORY_METHOD, None)?;
        return Ok(LoaderChoice {
            loader: imports.ty(target, LIB_LOADER)?,
            factory,
            cookie,
        });
    };

    let factory = match imports.locate(target, &loader)? {
        Some(Home::Target(id)) => MethodHandle::Def(
            local_factory(target, id).ok_or_else(|| Error::MissingFactory(target.type_full_name(id)))?,
        ),
        Some(Home::Support(id)) => {
            let support = imports.support().module();
            let found = local_factory(support, id).ok_or_else(|| Error::MissingFactory(support.type_full_name(id)))?;
            imports.method_handle(target, &MethodHandle::Def(found))?
        }
        None => {
            let contract = imports.ty(target, LIBRARY_LOADER)?;
            target.method_on(&loader, FACTORY_METHOD, MethodSig::new_static(contract, vec![TypeSig::String]))?
        }
    };
    Ok(LoaderChoice { loader, factory, cookie })
}

fn local_factory(module: &Module, id: TypeId) -> Option<MethodId> {
    module.methods_named(id, FACTORY_METHOD).into_iter().find(|candidate| {
        let candidate = module.method(*candidate);
        candidate.is_static() && candidate.signature.params == [TypeSig::String]
    })
}

/// The cached handle of one library and the routine that fills it.
#[derive(Debug, Clone, Copy)]
pub struct LoadRoutine {
    /// `_<lib>`
    pub handle: FieldHandle,
    /// `<Load_lib>`
    pub method: MethodId,
}

/// Synthesizes `_<lib>` and `<Load_lib>` on `owner`.
///
/// ```text
///     ldsfld   _<lib>
///     brtrue   cached
///     <loader>
///     ldstr    lib
///     callvirt LoadLibrary
///     dup
///     brfalse  failed
///     stsfld   _<lib>
/// cached:
///     ldsfld   _<lib>
///     ret
/// failed:
///     pop
///     ldstr    "cannot load lib: "
///     <loader>
///     callvirt GetError
///     call     String::Concat
///     newobj   DllNotFoundException::.ctor(string)
///     throw
/// ```
///
/// # Errors
/// Propagates emitter and verifier failures.
pub fn load_routine(
    target: &mut Module,
    refs: &CoreRefs,
    owner: TypeId,
    loader: &LoaderChoice,
    library: &str,
) -> Result<LoadRoutine> {
    let handle_name = names::unique(target, owner, &names::library_handle(library));
    let handle = FieldHandle::Def(target.add_field(FieldDef::new(
        owner,
        &handle_name,
        FieldAttributes::STATIC.with_access(MemberAccess::Private),
        TypeSig::I,
    )));

    let mut e = BodyEmitter::new();
    let cached = e.define_label();
    let failed = e.define_label();
    e.ldsfld(handle);
    e.branch(OpCode::Brtrue, cached);
    loader.emit_instance(&mut e);
    e.ldstr(library);
    e.callvirt(refs.load_library.clone());
    e.dup();
    e.branch(OpCode::Brfalse, failed);
    e.stsfld(handle);
    e.mark_label(cached);
    e.ldsfld(handle);
    e.ret();
    e.mark_label(failed);
    e.emit(OpCode::Pop);
    e.ldstr(&format!("dotbind: cannot load {library}: "));
    loader.emit_instance(&mut e);
    e.callvirt(refs.get_error.clone());
    e.call(refs.concat.clone());
    e.newobj(refs.dll_not_found.clone());
    e.throw();

    let method_name = names::unique(target, owner, &names::library_loader(library));
    let mut def = MethodDef::new(
        owner,
        &method_name,
        (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Private),
        MethodSig::new_static(TypeSig::I, vec![]),
    );
    def.body = Some(e.finish()?);
    let method = target.add_method(def);
    crate::verify::finalize_body(target, method)?;
    Ok(LoadRoutine { handle, method })
}

/// Emits the resolution of `symbol` into `fnptr`, throwing `EntryPointNotFoundException` on a
/// zero address. Leaves the stack empty.
pub fn emit_resolve(
    e: &mut BodyEmitter,
    refs: &CoreRefs,
    loader: &LoaderChoice,
    routine: &LoadRoutine,
    library: &str,
    symbol: &str,
    fnptr: FieldHandle,
) {
    let found = e.define_label();
    loader.emit_instance(e);
    e.call(MethodHandle::Def(routine.method));
    e.ldstr(symbol);
    e.callvirt(refs.get_proc_address.clone());
    e.dup();
    e.branch(OpCode::Brtrue, found);
    e.emit(OpCode::Pop);
    e.ldstr(&format!("dotbind: cannot resolve {symbol} in {library}: "));
    loader.emit_instance(e);
    e.callvirt(refs.get_error.clone());
    e.call(refs.concat.clone());
    e.newobj(refs.entry_point_not_found.clone());
    e.throw();
    e.mark_label(found);
    e.stsfld(fnptr);
}
