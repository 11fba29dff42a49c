//! End-to-end tests of the module processor.
//!
//! Each test builds a small application module with native declarations, runs it through
//! [`ModuleProcessor`] and inspects the generated members and bodies.

use dotbind::{
    interop::INTEROP_NAMESPACE,
    metadata::opcodes::ImpliedOperand,
    prelude::*,
    verify::verify_body,
};

const CDECL_ANSI: u16 = PInvokeAttributes::CALL_CONV_CDECL | PInvokeAttributes::CHAR_SET_ANSI;

struct App {
    module: Module,
    native: TypeId,
}

impl App {
    fn new() -> Self {
        let mut module = Module::new("App.dll", "App");
        let object = module.core_type("System", "Object", false);
        let native = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, Some(object)));
        App { module, native }
    }

    fn declare(&mut self, name: &str, library: &str, sig: MethodSig) -> MethodId {
        let library = self.module.add_module_ref(library);
        let mut def = MethodDef::new(
            self.native,
            name,
            (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG | MethodAttributes::PINVOKE_IMPL)
                .with_access(MemberAccess::Public),
            sig,
        );
        def.impl_flags = MethodImplAttributes::PRESERVE_SIG;
        def.pinvoke = Some(PInvokeInfo {
            flags: CDECL_ANSI,
            entry_point: None,
            module: library,
        });
        self.module.add_method(def)
    }

    /// `static string strdup([LPStr] string)` returning `[LPStr]`.
    fn strdup(&mut self) -> MethodId {
        let id = self.declare(
            "strdup",
            "libc.so.6",
            MethodSig::new_static(TypeSig::String, vec![TypeSig::String]),
        );
        let method = self.module.method_mut(id);
        method.params = vec![ParamDef::new("value").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR))];
        method.return_param.marshal = Some(MarshalInfo::native(NATIVE_TYPE::LPSTR));
        id
    }

    /// `static string concat([LPStr] string, [LPWStr] string)` returning `[LPUTF8Str]`.
    fn concat(&mut self) -> MethodId {
        let id = self.declare(
            "concat",
            "libconcat.so",
            MethodSig::new_static(TypeSig::String, vec![TypeSig::String, TypeSig::String]),
        );
        let method = self.module.method_mut(id);
        method.params = vec![
            ParamDef::new("left").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR)),
            ParamDef::new("right").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPWSTR)),
        ];
        method.return_param.marshal = Some(MarshalInfo::native(NATIVE_TYPE::LPUTF8STR));
        id
    }

    fn member(&self, name: &str) -> Option<MethodId> {
        self.module
            .ty(self.native)
            .methods
            .iter()
            .copied()
            .find(|id| self.module.method(*id).name == name)
    }

    fn field(&self, name: &str) -> Option<FieldId> {
        self.module.find_field(self.native, name)
    }
}

fn verify_all(module: &Module) -> Result<()> {
    for method in &module.methods {
        if let Some(body) = &method.body {
            verify_body(module, method, body)?;
        }
    }
    Ok(())
}

/// Name of the method a `call` instruction invokes.
fn callee<'m>(module: &'m Module, instr: &Instruction) -> Option<&'m str> {
    match (instr.opcode, &instr.operand) {
        (OpCode::Call, Operand::Method(MethodHandle::Ref(id))) => Some(module.member_ref(*id).name.as_str()),
        (OpCode::Call, Operand::Method(MethodHandle::Def(id))) => Some(module.method(*id).name.as_str()),
        _ => None,
    }
}

/// Local slot an `ldloc` in any of its forms reads.
fn loaded_local(instr: &Instruction) -> Option<u16> {
    match (instr.opcode.expand_macro(), &instr.operand) {
        ((OpCode::Ldloc, ImpliedOperand::Index(slot)), _) => Some(slot),
        ((OpCode::Ldloc, _), Operand::Local(slot)) => Some(*slot),
        _ => None,
    }
}

#[test]
fn marshaled_declarations_become_pointer_calls() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    let strdup = app.strdup();

    let config = RewriteConfig::lazy();
    let report = ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    assert_eq!(report.declarations, 1);
    assert_eq!(report.marshaled_slots, 2);

    let method = app.module.method(strdup);
    assert!(method.pinvoke.is_none());
    assert!(!method.flags.contains(MethodAttributes::PINVOKE_IMPL));
    assert!(method.params.iter().all(|param| param.marshal.is_none()));
    assert!(method.return_param.marshal.is_none());
    let body = method.body.as_ref().map(|body| body.count(OpCode::Calli));
    assert_eq!(body, Some(1));

    for name in ["<strdup_Lazy>", "<Initstrdup>", "<Load_libc.so.6>", "<Init>", ".cctor"] {
        assert!(app.member(name).is_some(), "missing {name}");
    }
    for name in ["_<strdup_fnptr>", "_<libc.so.6>", "_<lockObject>"] {
        assert!(app.field(name).is_some(), "missing {name}");
    }
    verify_all(&app.module)
}

#[test]
fn eager_binding_has_no_lazy_resolvers() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    app.declare("abs", "libc.so.6", MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]));

    let config = RewriteConfig::eager();
    ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    assert!(app.member("<abs_Lazy>").is_none());
    let init = app
        .member("<Initabs>")
        .and_then(|id| app.module.method(id).body.as_ref())
        .map(|body| body.count(OpCode::Throw));
    assert_eq!(init, Some(1));
    verify_all(&app.module)
}

#[test]
fn images_preserve_rewritten_modules() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    app.strdup();
    app.declare("getpid", "<loader>", MethodSig::new_static(TypeSig::I4, vec![]));

    let config = RewriteConfig::default();
    ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    let bytes = app.module.to_bytes()?;
    let reloaded = Module::from_bytes(&bytes)?;
    assert_eq!(reloaded.to_bytes()?, bytes);
    assert_eq!(reloaded.mvid, app.module.mvid);
    verify_all(&reloaded)
}

#[test]
fn second_runs_change_nothing_but_the_mvid() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    app.strdup();

    let config = RewriteConfig::default();
    let processor = ModuleProcessor::new(&support, &config);
    processor.process(&mut app.module)?;
    let types = app.module.types.len();
    let methods = app.module.methods.len();
    let mvid = app.module.mvid;

    let report = processor.process(&mut app.module)?;
    assert!(report.is_unchanged());
    assert_eq!(app.module.types.len(), types);
    assert_eq!(app.module.methods.len(), methods);
    assert_ne!(app.module.mvid, mvid);
    Ok(())
}

#[test]
fn custom_filters_select_declarations() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    let keep = app.declare("abs", "libc.so.6", MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]));
    let skip = app.declare("labs", "libc.so.6", MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]));

    let config = RewriteConfig::default().with_filter(|module: &Module, candidate: Candidate| match candidate {
        Candidate::Type(_) => true,
        Candidate::Method(id) => module.method(id).name != "labs",
    });
    let report = ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    assert_eq!(report.declarations, 1);
    assert_eq!(report.skipped, 1);
    assert!(!app.module.method(keep).is_foreign_declaration());
    assert!(app.module.method(skip).is_foreign_declaration());
    Ok(())
}

#[test]
fn embedded_support_types_are_not_rewritten() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    app.declare("abs", "libc.so.6", MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]));

    let config = RewriteConfig::default();
    ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    let support_declarations = app
        .module
        .type_ids()
        .filter(|id| app.module.ty(*id).namespace == INTEROP_NAMESPACE)
        .flat_map(|id| app.module.ty(id).methods.clone())
        .filter(|id| app.module.method(*id).is_foreign_declaration())
        .count();
    assert!(support_declarations > 0);
    Ok(())
}

#[test]
fn marshaled_parameters_chain_around_the_native_call() -> Result<()> {
    let support = Support::builtin()?;
    let mut app = App::new();
    let concat = app.concat();

    let config = RewriteConfig::lazy();
    let report = ModuleProcessor::new(&support, &config).process(&mut app.module)?;
    assert_eq!(report.marshaled_slots, 3);

    let body = app
        .module
        .method(concat)
        .body
        .clone()
        .ok_or_else(|| Error::Error("concat has no body".into()))?;
    let calls: Vec<(usize, &str)> = body
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(index, instr)| callee(&app.module, instr).map(|name| (index, name)))
        .collect();
    let at = |prefix: &str| -> Vec<usize> {
        calls
            .iter()
            .filter(|(_, name)| name.starts_with(prefix))
            .map(|(index, _)| *index)
            .collect()
    };
    let calli: Vec<usize> = (0..body.instructions.len())
        .filter(|index| body.instructions[*index].opcode == OpCode::Calli)
        .collect();
    assert_eq!(calli.len(), 1);
    let calli = calli[0];

    // both host to native conversions run before the call
    let to_native = at("StringToCoTaskMem");
    assert_eq!(to_native.len(), 6);
    assert!(to_native.iter().all(|index| *index < calli));

    // the return conversion follows the call, the cleanups follow the return conversion
    let to_host = at("PtrToString");
    assert_eq!(to_host.len(), 3);
    assert!(to_host.iter().all(|index| *index > calli));
    let frees = at("FreeCoTaskMem");
    assert_eq!(frees.len(), 2);
    let last_host = to_host.iter().max().copied().unwrap_or_default();
    assert!(frees.iter().all(|index| *index > last_host));

    // cleanups run in reverse parameter order: the second buffer is freed first
    let freed: Vec<u16> = frees
        .iter()
        .filter_map(|index| loaded_local(&body.instructions[index - 1]))
        .collect();
    assert_eq!(freed.len(), 2);
    assert!(freed[0] > freed[1], "freed locals {freed:?}");

    let tail: Vec<OpCode> = body.instructions[body.instructions.len() - 2..]
        .iter()
        .map(|instr| instr.opcode.expand_macro().0)
        .collect();
    assert_eq!(tail, [OpCode::Ldloc, OpCode::Ret]);
    verify_all(&app.module)
}
