//! Foreign-call rewriting.
//!
//! [`Rewriter::rewrite_type`] replaces every selected native declaration of one type with
//! binding code. Per declaration `Name` of library `lib` it adds a public function pointer
//! field `_<Name_fnptr>`, an initializer `<InitName>` and, in [`BindingMode::Lazy`], a
//! resolver `<Name_Lazy>` with the native signature that the pointer initially targets. The
//! first call through the pointer lands in the resolver, which takes the type's lock,
//! resolves the symbol through the selected loader, stores the real address and forwards the
//! call. Every later call is a plain `calli` through the field.
//!
//! Libraries are loaded by one `<Load_lib>` routine per loader and library, caching the
//! handle in `_<lib>`. The type's static constructor creates `_<lockObject>` and runs
//! `<Init>`, which prepares each loader once and calls every `<InitName>`.

mod init;
mod loader;
mod lock;
pub mod names;

use std::collections::HashMap;

use strum::{Display, EnumString};

pub use loader::LoaderChoice;

use crate::{
    interop::{Imports, LIBRARY_LOADER},
    marshal::{Injector, NativeDeclaration},
    metadata::{
        attributes::{FieldAttributes, MemberAccess, MethodAttributes, MethodImplAttributes, ParamAttributes},
        emitter::BodyEmitter,
        members::{FieldDef, MethodDef},
        module::Module,
        opcodes::OpCode,
        references::{FieldHandle, MethodHandle},
        token::{MethodId, TypeId},
        typesystem::{CallingConvention, MethodSig, TypeSig},
    },
    verify::finalize_body,
    Error, Result,
};

use loader::LoadRoutine;

/// When symbols are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BindingMode {
    /// On the first call, through the lazy resolver
    #[default]
    Lazy,
    /// In the static constructor of the declaring type
    Eager,
}

/// Core library and loader members the synthesized code calls.
#[derive(Debug, Clone)]
pub struct CoreRefs {
    pub(crate) object_ctor: MethodHandle,
    pub(crate) monitor_enter: MethodHandle,
    pub(crate) monitor_exit: MethodHandle,
    pub(crate) concat: MethodHandle,
    pub(crate) dll_not_found: MethodHandle,
    pub(crate) entry_point_not_found: MethodHandle,
    pub(crate) load_library: MethodHandle,
    pub(crate) get_proc_address: MethodHandle,
    pub(crate) get_error: MethodHandle,
    pub(crate) prepare: MethodHandle,
}

impl CoreRefs {
    pub(crate) fn new(imports: &mut Imports<'_>, target: &mut Module) -> Result<CoreRefs> {
        let void_ctor = || MethodSig::new_instance(TypeSig::Void, vec![]);
        let message_ctor = || MethodSig::new_instance(TypeSig::Void, vec![TypeSig::String]);

        let object = target.core_type("System", "Object", false);
        let monitor = target.core_type("System.Threading", "Monitor", false);
        let string = target.core_type("System", "String", false);
        let dll_not_found = target.core_type("System", "DllNotFoundException", false);
        let entry_point_not_found = target.core_type("System", "EntryPointNotFoundException", false);
        let lock_sig = || MethodSig::new_static(TypeSig::Void, vec![TypeSig::Object]);

        Ok(CoreRefs {
            object_ctor: target.method_on(&object, ".ctor", void_ctor())?,
            monitor_enter: target.method_on(&monitor, "Enter", lock_sig())?,
            monitor_exit: target.method_on(&monitor, "Exit", lock_sig())?,
            concat: target.method_on(
                &string,
                "Concat",
                MethodSig::new_static(TypeSig::String, vec![TypeSig::String, TypeSig::String]),
            )?,
            dll_not_found: target.method_on(&dll_not_found, ".ctor", message_ctor())?,
            entry_point_not_found: target.method_on(&entry_point_not_found, ".ctor", message_ctor())?,
            load_library: imports.method(target, LIBRARY_LOADER, "LoadLibrary", None)?,
            get_proc_address: imports.method(target, LIBRARY_LOADER, "GetProcAddress", None)?,
            get_error: imports.method(target, LIBRARY_LOADER, "GetError", None)?,
            prepare: imports.method(target, LIBRARY_LOADER, "Prepare", None)?,
        })
    }
}

/// Reads the native descriptor of a declaration.
///
/// # Errors
/// Returns [`Error::MissingDescriptor`] if the method has none and
/// [`Error::UnsupportedCallingConvention`] for an unknown convention.
pub fn declaration_of(module: &Module, method: MethodId) -> Result<NativeDeclaration> {
    let def = module.method(method);
    let full_name = module.method_full_name(method);
    let info = def
        .pinvoke
        .as_ref()
        .ok_or_else(|| Error::MissingDescriptor(full_name.clone()))?;
    Ok(NativeDeclaration {
        library: module.module_ref(info.module).name.clone(),
        entry_point: info.symbol(&def.name).to_string(),
        calling_convention: info.calling_convention(&full_name)?,
        char_set: info.char_set(),
    })
}

/// What rewriting one type produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeReport {
    /// Declarations rewritten
    pub declarations: usize,
    /// Load routines synthesized
    pub libraries: usize,
    /// Parameter and return slots with an inlined marshaler
    pub marshaled_slots: usize,
}

/// Bookkeeping shared by the declarations of one type.
struct TypeState {
    owner: TypeId,
    lock: FieldHandle,
    loaders: Vec<LoaderChoice>,
    routines: HashMap<(usize, String), LoadRoutine>,
    initializers: Vec<MethodId>,
    ordinals: names::Ordinals,
}

impl TypeState {
    fn loader_index(&mut self, choice: LoaderChoice) -> usize {
        match self.loaders.iter().position(|known| known.same_instance(&choice)) {
            Some(index) => index,
            None => {
                self.loaders.push(choice);
                self.loaders.len() - 1
            }
        }
    }

    fn routine(&mut self, target: &mut Module, refs: &CoreRefs, loader: usize, library: &str) -> Result<LoadRoutine> {
        let key = (loader, library.to_string());
        if let Some(routine) = self.routines.get(&key) {
            return Ok(*routine);
        }
        let routine = loader::load_routine(target, refs, self.owner, &self.loaders[loader], library)?;
        self.routines.insert(key, routine);
        Ok(routine)
    }
}

/// Marks a lazy resolver's return type with the calling convention it is entered with.
fn convention_modifier(target: &mut Module, convention: CallingConvention, ret: TypeSig) -> TypeSig {
    let name = match convention {
        CallingConvention::C => "CallConvCdecl",
        CallingConvention::StdCall => "CallConvStdcall",
        CallingConvention::ThisCall => "CallConvThiscall",
        CallingConvention::FastCall => "CallConvFastcall",
        _ => return ret,
    };
    TypeSig::ModOpt {
        modifier: Box::new(target.core_type("System.Runtime.CompilerServices", name, false)),
        inner: Box::new(ret),
    }
}

/// Rewrites the native declarations of one target module, type by type.
#[derive(Debug)]
pub struct Rewriter<'s> {
    imports: Imports<'s>,
    injector: Injector,
    mode: BindingMode,
    refs: Option<CoreRefs>,
}

impl<'s> Rewriter<'s> {
    /// Creates a rewriter; `injector` must have been built over the same target.
    #[must_use]
    pub fn new(imports: Imports<'s>, injector: Injector, mode: BindingMode) -> Self {
        Rewriter {
            imports,
            injector,
            mode,
            refs: None,
        }
    }

    /// The binding mode.
    #[must_use]
    pub fn mode(&self) -> BindingMode {
        self.mode
    }

    fn refs(&mut self, target: &mut Module) -> Result<CoreRefs> {
        if let Some(refs) = &self.refs {
            return Ok(refs.clone());
        }
        let refs = CoreRefs::new(&mut self.imports, target)?;
        self.refs = Some(refs.clone());
        Ok(refs)
    }

    /// Rewrites `declarations`, all declared by `owner`.
    ///
    /// # Errors
    /// Every failure is fatal for the module: descriptor, loader, marshaling and verifier
    /// errors are returned as they occur and `target` is left partially rewritten.
    pub fn rewrite_type(&mut self, target: &mut Module, owner: TypeId, declarations: &[MethodId]) -> Result<TypeReport> {
        let mut report = TypeReport::default();
        if declarations.is_empty() {
            return Ok(report);
        }
        let refs = self.refs(target)?;

        let lock_name = names::unique(target, owner, names::LOCK_FIELD);
        let lock = FieldHandle::Def(target.add_field(FieldDef::new(
            owner,
            &lock_name,
            (FieldAttributes::STATIC | FieldAttributes::INIT_ONLY).with_access(MemberAccess::Private),
            TypeSig::Object,
        )));
        let mut state = TypeState {
            owner,
            lock,
            loaders: Vec::new(),
            routines: HashMap::new(),
            initializers: Vec::new(),
            ordinals: names::Ordinals::default(),
        };

        for method in declarations {
            report.marshaled_slots += self.rewrite_declaration(target, &refs, &mut state, *method)?;
            report.declarations += 1;
        }
        report.libraries = state.routines.len();

        let init = init::type_initializer(target, &refs, owner, &state.loaders, &state.initializers)?;
        init::wire_static_constructor(target, &refs, owner, lock, init)?;
        log::debug!(
            "{}: {} declarations, {} libraries",
            target.type_full_name(owner),
            report.declarations,
            report.libraries
        );
        Ok(report)
    }

    /// Returns the number of marshaled slots.
    fn rewrite_declaration(
        &mut self,
        target: &mut Module,
        refs: &CoreRefs,
        state: &mut TypeState,
        method: MethodId,
    ) -> Result<usize> {
        let declaration = declaration_of(target, method)?;
        let name = state.ordinals.next(&target.method(method).name);
        let choice = loader::select(&mut self.imports, target, method)?;
        let loader_index = state.loader_index(choice);
        let routine = state.routine(target, refs, loader_index, &declaration.library)?;
        let loader = state.loaders[loader_index].clone();

        let pipeline = self.injector.plan(&mut self.imports, target, method, &declaration)?;
        let native = pipeline.native_sig(declaration.calling_convention);

        let fnptr_name = names::unique(target, state.owner, &names::function_pointer(&name));
        let fnptr = FieldHandle::Def(target.add_field(FieldDef::new(
            state.owner,
            &fnptr_name,
            FieldAttributes::STATIC.with_access(MemberAccess::Public),
            TypeSig::I,
        )));

        let resolve = |e: &mut BodyEmitter| {
            loader::emit_resolve(
                e,
                refs,
                &loader,
                &routine,
                &declaration.library,
                &declaration.entry_point,
                fnptr,
            );
        };
        let initializer = match self.mode {
            BindingMode::Lazy => {
                let lazy = lazy_resolver(target, refs, state, &name, &native, &declaration, fnptr, resolve)?;
                init::add_routine(target, state.owner, &names::initializer(&name), |e| {
                    e.ldftn(MethodHandle::Def(lazy));
                    e.stsfld(fnptr);
                })?
            }
            BindingMode::Eager => init::add_routine(target, state.owner, &names::initializer(&name), resolve)?,
        };
        state.initializers.push(initializer);

        let mut e = BodyEmitter::new();
        pipeline.emit(&mut e, |e| {
            e.ldsfld(fnptr);
            e.calli(native.clone());
        })?;
        let body = e.finish()?;

        let def = target.method_mut(method);
        def.flags = (def.flags - MethodAttributes::PINVOKE_IMPL).with_access(MemberAccess::Public);
        def.impl_flags -= MethodImplAttributes::PRESERVE_SIG;
        def.pinvoke = None;
        for param in &mut def.params {
            param.marshal = None;
            param.flags -= ParamAttributes::HAS_FIELD_MARSHAL;
        }
        def.return_param.marshal = None;
        def.body = Some(body);
        finalize_body(target, method)?;

        log::debug!(
            "{} -> {}!{} ({}, {} marshaled)",
            target.method_full_name(method),
            declaration.library,
            declaration.entry_point,
            declaration.calling_convention,
            pipeline.marshaled_slots()
        );
        Ok(pipeline.marshaled_slots())
    }
}

/// `<Name_Lazy>`: resolves under the type lock unless another thread already did, then
/// forwards its arguments through the pointer.
fn lazy_resolver<F>(
    target: &mut Module,
    refs: &CoreRefs,
    state: &TypeState,
    name: &str,
    native: &MethodSig,
    declaration: &NativeDeclaration,
    fnptr: FieldHandle,
    resolve: F,
) -> Result<MethodId>
where
    F: FnOnce(&mut BodyEmitter),
{
    let ret = convention_modifier(target, declaration.calling_convention, native.ret.clone());
    let resolver_name = names::unique(target, state.owner, &names::lazy_resolver(name));
    let lazy = target.add_method(MethodDef::new(
        state.owner,
        &resolver_name,
        (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Private),
        MethodSig::new_static(ret, native.params.clone()),
    ));

    let mut e = BodyEmitter::new();
    lock::locked(&mut e, refs, state.lock, |e| {
        let resolved = e.define_label();
        e.ldsfld(fnptr);
        e.ldftn(MethodHandle::Def(lazy));
        e.branch(OpCode::BneUn, resolved);
        resolve(e);
        e.mark_label(resolved);
    });
    for arg in 0..native.params.len() {
        e.ldarg(u16::try_from(arg).map_err(|_| Error::Error(format!("too many parameters on {name}")))?);
    }
    e.ldsfld(fnptr);
    e.calli(native.clone());
    e.ret();

    target.method_mut(lazy).body = Some(e.finish()?);
    finalize_body(target, lazy)?;
    Ok(lazy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::Support,
        metadata::{
            attributes::TypeAttributes,
            body::HandlerKind,
            marshalling::{MarshalInfo, NATIVE_TYPE},
            members::{ParamDef, TypeDef},
            pinvoke::{PInvokeAttributes, PInvokeInfo},
        },
        verify::verify_body,
    };

    struct Fixture {
        target: Module,
        owner: TypeId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut target = Module::new("App.dll", "App");
            let object = target.core_type("System", "Object", false);
            let owner = target.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, Some(object)));
            Fixture { target, owner }
        }

        fn declare(&mut self, name: &str, library: &str, flags: u16, sig: MethodSig) -> MethodId {
            let module = self.target.add_module_ref(library);
            let mut def = MethodDef::new(
                self.owner,
                name,
                (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG | MethodAttributes::PINVOKE_IMPL)
                    .with_access(MemberAccess::Private),
                sig,
            );
            def.impl_flags = MethodImplAttributes::PRESERVE_SIG;
            def.pinvoke = Some(PInvokeInfo {
                flags,
                entry_point: None,
                module,
            });
            self.target.add_method(def)
        }

        fn rewrite(&mut self, support: &Support, mode: BindingMode, methods: &[MethodId]) -> Result<TypeReport> {
            let imports = Imports::new(support, false);
            let injector = Injector::new(&imports, &self.target);
            let mut rewriter = Rewriter::new(imports, injector, mode);
            rewriter.rewrite_type(&mut self.target, self.owner, methods)
        }

        fn member(&self, name: &str) -> Option<MethodId> {
            self.target
                .ty(self.owner)
                .methods
                .iter()
                .copied()
                .find(|id| self.target.method(*id).name == name)
        }

        fn has_field(&self, name: &str) -> bool {
            self.target
                .ty(self.owner)
                .fields
                .iter()
                .any(|id| self.target.field(*id).name == name)
        }

        fn verify_all(&self) -> Result<()> {
            for id in &self.target.ty(self.owner).methods {
                let method = self.target.method(*id);
                if let Some(body) = &method.body {
                    verify_body(&self.target, method, body)?;
                }
            }
            Ok(())
        }
    }

    const CDECL_ANSI: u16 = PInvokeAttributes::CALL_CONV_CDECL | PInvokeAttributes::CHAR_SET_ANSI;

    fn puts(fixture: &mut Fixture) -> MethodId {
        let puts = fixture.declare(
            "puts",
            "libc.so.6",
            CDECL_ANSI,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::String]),
        );
        let param = &mut fixture.target.method_mut(puts).params[0];
        *param = ParamDef::new("s").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR));
        puts
    }

    #[test]
    fn lazy_binding_synthesizes_the_full_member_set() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let puts = puts(&mut fixture);

        let report = fixture.rewrite(&support, BindingMode::Lazy, &[puts])?;
        assert_eq!(
            report,
            TypeReport {
                declarations: 1,
                libraries: 1,
                marshaled_slots: 1
            }
        );

        for field in ["_<puts_fnptr>", "_<libc.so.6>", "_<lockObject>"] {
            assert!(fixture.has_field(field), "{field} missing");
        }
        let lock = fixture
            .target
            .find_field(fixture.owner, "_<lockObject>")
            .map(|id| fixture.target.field(id).flags);
        assert!(lock.is_some_and(|flags| flags.contains(FieldAttributes::STATIC | FieldAttributes::INIT_ONLY)));
        for method in ["<puts_Lazy>", "<Initputs>", "<Load_libc.so.6>", "<Init>", ".cctor"] {
            assert!(fixture.member(method).is_some(), "{method} missing");
        }

        let rewritten = fixture.target.method(puts);
        assert!(rewritten.body.is_some());
        assert!(rewritten.pinvoke.is_none());
        assert!(!rewritten.flags.contains(MethodAttributes::PINVOKE_IMPL));
        assert_eq!(rewritten.flags.access(), MemberAccess::Public);
        assert!(rewritten.params[0].marshal.is_none());
        assert!(!rewritten.params[0].flags.contains(ParamAttributes::HAS_FIELD_MARSHAL));

        fixture.verify_all()
    }

    #[test]
    fn lazy_resolvers_lock_and_carry_the_convention() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let puts = puts(&mut fixture);
        fixture.rewrite(&support, BindingMode::Lazy, &[puts])?;

        let lazy = fixture.member("<puts_Lazy>").map(|id| fixture.target.method(id));
        let Some(lazy) = lazy else {
            panic!("no lazy resolver");
        };
        assert_eq!(lazy.signature.params, vec![TypeSig::I]);
        assert!(matches!(&lazy.signature.ret, TypeSig::ModOpt { inner, .. } if **inner == TypeSig::I4));
        let Some(body) = &lazy.body else {
            panic!("no body");
        };
        assert_eq!(body.exception_handlers.len(), 1);
        assert!(matches!(body.exception_handlers[0].kind, HandlerKind::Finally));
        let opcodes: Vec<OpCode> = body.instructions.iter().map(|instr| instr.opcode).collect();
        assert!(opcodes.contains(&OpCode::BneUn));
        assert_eq!(opcodes.iter().filter(|op| **op == OpCode::Calli).count(), 1);
        Ok(())
    }

    #[test]
    fn eager_binding_resolves_in_the_initializer() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let getpid = fixture.declare(
            "getpid",
            "libc.so.6",
            PInvokeAttributes::CALL_CONV_CDECL,
            MethodSig::new_static(TypeSig::I4, vec![]),
        );
        fixture.rewrite(&support, BindingMode::Eager, &[getpid])?;

        assert!(fixture.member("<getpid_Lazy>").is_none());
        let Some(init) = fixture.member("<Initgetpid>") else {
            panic!("no initializer");
        };
        let calls: Vec<String> = fixture
            .target
            .method(init)
            .body
            .iter()
            .flat_map(|body| body.instructions.iter())
            .filter_map(|instr| match &instr.operand {
                crate::metadata::body::Operand::Method(handle) => {
                    fixture.target.method_name(handle).map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert!(calls.iter().any(|name| name == "GetProcAddress"));
        fixture.verify_all()
    }

    #[test]
    fn overloads_share_the_library_and_get_ordinals() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let narrow = fixture.declare("write", "libc.so.6", CDECL_ANSI, MethodSig::new_static(TypeSig::I, vec![TypeSig::I4, TypeSig::I, TypeSig::I]));
        let wide = fixture.declare("write", "libc.so.6", CDECL_ANSI, MethodSig::new_static(TypeSig::I, vec![TypeSig::I4, TypeSig::I, TypeSig::U]));
        let report = fixture.rewrite(&support, BindingMode::Lazy, &[narrow, wide])?;

        assert_eq!(report.declarations, 2);
        assert_eq!(report.libraries, 1);
        assert!(fixture.has_field("_<write_fnptr>"));
        assert!(fixture.has_field("_<write_1_fnptr>"));
        assert!(fixture.member("<write_1_Lazy>").is_some());
        assert!(!fixture.has_field("_<libc.so.6>_1"));
        fixture.verify_all()
    }

    #[test]
    fn existing_static_constructors_run_after_the_prefix() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let mut e = BodyEmitter::new();
        e.emit(OpCode::Nop);
        e.ret();
        let mut cctor = MethodDef::new(
            fixture.owner,
            ".cctor",
            (MethodAttributes::STATIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::RTSPECIAL_NAME)
                .with_access(MemberAccess::Private),
            MethodSig::new_static(TypeSig::Void, vec![]),
        );
        cctor.body = Some(e.finish()?);
        let cctor = fixture.target.add_method(cctor);
        let puts = puts(&mut fixture);
        fixture.rewrite(&support, BindingMode::Lazy, &[puts])?;

        let Some(body) = &fixture.target.method(cctor).body else {
            panic!("no body");
        };
        let opcodes: Vec<OpCode> = body.instructions.iter().map(|instr| instr.opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::Newobj, OpCode::Stsfld, OpCode::Call, OpCode::Nop, OpCode::Ret]
        );
        Ok(())
    }

    #[test]
    fn declarations_without_descriptor_are_fatal() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let orphan = fixture.declare("orphan", "libc.so.6", 0, MethodSig::new_static(TypeSig::Void, vec![]));
        fixture.target.method_mut(orphan).pinvoke = None;
        assert!(matches!(
            fixture.rewrite(&support, BindingMode::Lazy, &[orphan]),
            Err(Error::MissingDescriptor(name)) if name == "App.Native::orphan"
        ));
        Ok(())
    }

    #[test]
    fn unknown_calling_conventions_are_fatal() -> Result<()> {
        let support = Support::builtin()?;
        let mut fixture = Fixture::new();
        let odd = fixture.declare("odd", "libc.so.6", 0x0600, MethodSig::new_static(TypeSig::Void, vec![]));
        assert!(matches!(
            fixture.rewrite(&support, BindingMode::Lazy, &[odd]),
            Err(Error::UnsupportedCallingConvention { .. })
        ));
        Ok(())
    }

    #[test]
    fn descriptors_default_the_entry_point() -> Result<()> {
        let mut fixture = Fixture::new();
        let strlen = fixture.declare("strlen", "libc.so.6", CDECL_ANSI, MethodSig::new_static(TypeSig::U, vec![TypeSig::I]));
        let declaration = declaration_of(&fixture.target, strlen)?;
        assert_eq!(declaration.entry_point, "strlen");
        assert_eq!(declaration.library, "libc.so.6");
        assert_eq!(declaration.calling_convention, CallingConvention::C);

        if let Some(info) = fixture.target.method_mut(strlen).pinvoke.as_mut() {
            info.entry_point = Some("__strlen_avx2".into());
        }
        assert_eq!(declaration_of(&fixture.target, strlen)?.entry_point, "__strlen_avx2");
        Ok(())
    }

    #[test]
    fn binding_modes_parse() {
        assert_eq!("eager".parse::<BindingMode>().ok(), Some(BindingMode::Eager));
        assert_eq!(BindingMode::default().to_string(), "lazy");
    }
}
