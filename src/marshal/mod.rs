//! Marshaling pipeline injection.
//!
//! Every parameter and the return slot of a native declaration may carry a marshal descriptor.
//! The [`Injector`] picks a marshaler for each of them, works out how its settings are
//! constructed and prepares its conversion body. The resulting [`Pipeline`] emits the
//! rewritten declaration body around the native call:
//!
//! ```text
//! for each parameter:  settings; pre segment   (or a plain ldarg)
//! ldsfld fnptr; calli native-signature
//! return value:        stloc native; settings; pre segment; stloc result
//! return cleanup, then parameter cleanups in reverse order
//! ldloc result; ret
//! ```
//!
//! A custom marshaler descriptor naming a `Marshaler<,,,>` subtype uses that marshaler
//! directly. One naming an `ICustomMarshaler` implementation is wrapped in
//! `CustomMarshalerAdapter<T>`. Any other representation is looked up in the [`Catalog`].

mod catalog;
mod inline;
mod settings;

pub use catalog::{declared_representations, Catalog, Entry};
pub use inline::{Binding, Conversion, Datum, Segment};
pub use settings::{generate, Generated, MarshalContext, NativeDeclaration, Settings};

use std::fmt;

use crate::{
    interop::{
        Home, Imports, CUSTOM_MARSHALER_ADAPTER, INTEROP_NAMESPACE, MARSHALER_BASE, MARSHAL_MANAGED,
        MARSHAL_NATIVE,
    },
    metadata::{
        body::Operand,
        emitter::BodyEmitter,
        marshalling::{native_type_name, MarshalInfo, NATIVE_TYPE},
        module::Module,
        opcodes::OpCode,
        token::{MethodId, TypeId},
        typesystem::{CallingConvention, MethodSig, TypeSig},
    },
    Error, Result,
};

/// A marshaled position of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Parameter by position, not counting `this`
    Param(u16),
    /// The return value
    Return,
}

impl Slot {
    /// Position as seen by the `Slot.Index` generator: `-1` for the return value.
    #[must_use]
    pub fn index(self) -> i32 {
        match self {
            Slot::Param(index) => i32::from(index),
            Slot::Return => -1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Param(index) => write!(f, "parameter {index}"),
            Slot::Return => write!(f, "return value"),
        }
    }
}

/// The four type arguments of the `Marshaler<TMarshaler, TSettings, TNative, THost>` base of
/// `id`, in terms of the generic parameters of `id`.
fn protocol_args(module: &Module, id: TypeId) -> Option<Vec<TypeSig>> {
    let mut current = id;
    let mut args: Vec<TypeSig> = Vec::new();
    loop {
        let base = module.ty(current).extends.as_ref()?.substitute(&args, &[]);
        if module
            .type_name(&base)
            .is_some_and(|name| name.is(INTEROP_NAMESPACE, MARSHALER_BASE))
        {
            return match base {
                TypeSig::GenericInst { args, .. } if args.len() == 4 => Some(args),
                _ => None,
            };
        }
        current = module.local_definition(&base)?;
        args = match base {
            TypeSig::GenericInst { args, .. } => args,
            _ => Vec::new(),
        };
    }
}

/// Returns `true` if `id` or one of its local bases lists the interface `namespace.name`.
fn implements(module: &Module, id: TypeId, namespace: &str, name: &str) -> bool {
    let ty = module.ty(id);
    ty.interfaces
        .iter()
        .any(|interface| module.type_name(interface).is_some_and(|found| found.is(namespace, name)))
        || ty
            .extends
            .as_ref()
            .and_then(|base| module.local_definition(base))
            .is_some_and(|base| implements(module, base, namespace, name))
}

fn instantiation_args(sig: &TypeSig) -> Vec<TypeSig> {
    match sig.unmodified() {
        TypeSig::GenericInst { args, .. } => args.clone(),
        _ => Vec::new(),
    }
}

/// The marshaler chosen for one slot.
struct Choice {
    home: Home,
    type_args: Vec<TypeSig>,
    /// The wrapped `ICustomMarshaler`, when going through the adapter
    custom: Option<TypeSig>,
}

/// Everything needed to marshal one slot at the call site.
#[derive(Debug, Clone)]
struct SlotPlan {
    native: TypeSig,
    settings: Settings,
    conversion: Conversion,
    cast: Option<TypeSig>,
}

/// The marshaling plan of one declaration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    signature: MethodSig,
    first_arg: u16,
    params: Vec<Option<SlotPlan>>,
    ret: Option<SlotPlan>,
}

impl Pipeline {
    /// Returns `true` if no slot needs conversion.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marshaled_slots() == 0
    }

    /// Number of slots with a conversion.
    #[must_use]
    pub fn marshaled_slots(&self) -> usize {
        self.params.iter().flatten().count() + usize::from(self.ret.is_some())
    }

    /// The unmanaged call site signature: marshaled slots take their native type.
    #[must_use]
    pub fn native_sig(&self, convention: CallingConvention) -> MethodSig {
        let params = self
            .signature
            .params
            .iter()
            .zip(&self.params)
            .map(|(declared, plan)| plan.as_ref().map_or_else(|| declared.clone(), |plan| plan.native.clone()))
            .collect();
        let ret = self
            .ret
            .as_ref()
            .map_or_else(|| self.signature.ret.clone(), |plan| plan.native.clone());
        MethodSig {
            call_conv: convention,
            ..MethodSig::new_static(ret, params)
        }
    }

    /// Emits the complete declaration body; `call` emits the native call itself.
    ///
    /// # Errors
    /// See [`Conversion::emit`].
    pub fn emit<F>(&self, e: &mut BodyEmitter, call: F) -> Result<()>
    where
        F: FnOnce(&mut BodyEmitter),
    {
        let mut bound = Vec::new();
        for (arg, plan) in (self.first_arg..).zip(&self.params) {
            match plan {
                None => e.ldarg(arg),
                Some(plan) => {
                    let settings = e.declare_local(plan.settings.local_type().clone());
                    plan.settings.emit(e, settings);
                    let binding = plan.conversion.bind(e, settings, Datum::Arg(arg));
                    plan.conversion.emit(e, &binding, Segment::Pre)?;
                    bound.push((plan, binding));
                }
            }
        }

        call(e);

        let result = match &self.ret {
            _ if self.signature.ret.is_void() => None,
            None => {
                let result = e.declare_local(self.signature.ret.clone());
                e.stloc(result);
                Some(result)
            }
            Some(plan) => {
                let native = e.declare_local(plan.native.clone());
                e.stloc(native);
                let settings = e.declare_local(plan.settings.local_type().clone());
                plan.settings.emit(e, settings);
                let binding = plan.conversion.bind(e, settings, Datum::Local(native));
                plan.conversion.emit(e, &binding, Segment::Pre)?;
                if let Some(cast) = &plan.cast {
                    e.emit_operand(OpCode::Castclass, Operand::Type(cast.clone()));
                }
                let result = e.declare_local(self.signature.ret.clone());
                e.stloc(result);
                plan.conversion.emit(e, &binding, Segment::Cleanup)?;
                Some(result)
            }
        };

        for (plan, binding) in bound.iter().rev() {
            plan.conversion.emit(e, binding, Segment::Cleanup)?;
        }
        if let Some(result) = result {
            e.ldloc(result);
        }
        e.ret();
        Ok(())
    }
}

/// Plans the marshaling of declarations in one target module.
#[derive(Debug, Clone)]
pub struct Injector {
    catalog: Catalog,
}

impl Injector {
    /// Creates an injector over the marshalers visible from `target`.
    ///
    /// Build it after the support types were embedded so that embedded marshalers are found
    /// as local definitions.
    #[must_use]
    pub fn new(imports: &Imports<'_>, target: &Module) -> Self {
        Injector {
            catalog: Catalog::build(imports, target),
        }
    }

    /// The marshaler catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Plans every marshaled slot of the declaration `method`.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedRepresentation`] if no marshaler covers a reference-typed
    /// slot, and the errors of settings construction and body preparation.
    pub fn plan(
        &self,
        imports: &mut Imports<'_>,
        target: &mut Module,
        method: MethodId,
        declaration: &NativeDeclaration,
    ) -> Result<Pipeline> {
        let def = target.method(method);
        let signature = def.signature.clone();
        let first_arg = def.first_param_arg();
        let descriptors: Vec<Option<MarshalInfo>> = def.params.iter().map(|param| param.marshal.clone()).collect();
        let return_descriptor = def.return_param.marshal.clone();

        let mut params = Vec::with_capacity(signature.params.len());
        for (index, declared) in (0u16..).zip(&signature.params) {
            let plan = match descriptors.get(usize::from(index)).cloned().flatten() {
                Some(info) => self.plan_slot(imports, target, Slot::Param(index), declared, &info, declaration)?,
                None => None,
            };
            params.push(plan);
        }
        let ret = match return_descriptor {
            Some(info) if !signature.ret.is_void() => {
                self.plan_slot(imports, target, Slot::Return, &signature.ret, &info, declaration)?
            }
            _ => None,
        };

        Ok(Pipeline {
            signature,
            first_arg,
            params,
            ret,
        })
    }

    fn choose(
        &self,
        imports: &mut Imports<'_>,
        target: &mut Module,
        slot: Slot,
        declared: &TypeSig,
        info: &MarshalInfo,
    ) -> Result<Option<Choice>> {
        let unsupported = |representation: String| Error::UnsupportedRepresentation {
            slot: slot.to_string(),
            representation,
        };

        if info.native_type != NATIVE_TYPE::CUSTOMMARSHALER {
            return match self.catalog.select(info.native_type) {
                Some(entry) => Ok(Some(Choice {
                    home: entry.home,
                    type_args: Vec::new(),
                    custom: None,
                })),
                None if target.is_value_type(declared) => Ok(None),
                None => Err(unsupported(native_type_name(info.native_type))),
            };
        }

        let Some(spec) = &info.custom else {
            return Err(unsupported("custom marshaler without a marshaler type".to_string()));
        };
        let marshaler = spec.marshaler.clone();
        if let Some(home) = imports.locate(target, &marshaler)? {
            let (module, id) = imports.module_of(target, home);
            if protocol_args(module, id).is_some() {
                return Ok(Some(Choice {
                    home,
                    type_args: instantiation_args(&marshaler),
                    custom: None,
                }));
            }
            if !implements(module, id, "System.Runtime.InteropServices", "ICustomMarshaler") {
                return Err(unsupported(format!(
                    "{} is neither a marshaler nor an ICustomMarshaler",
                    module.type_full_name(id)
                )));
            }
        }
        if target.is_value_type(declared) {
            return Err(unsupported(format!(
                "custom marshaler {} on value type {}",
                target.sig_name(&marshaler),
                target.sig_name(declared)
            )));
        }

        let adapter = imports.ty(target, CUSTOM_MARSHALER_ADAPTER)?;
        let home = imports
            .locate(target, &adapter)?
            .ok_or_else(|| Error::TypeNotFound(target.sig_name(&adapter)))?;
        let (module, id) = imports.module_of(target, home);
        if !declared_representations(module, id).contains(&NATIVE_TYPE::CUSTOMMARSHALER) {
            return Err(unsupported(native_type_name(NATIVE_TYPE::CUSTOMMARSHALER)));
        }
        Ok(Some(Choice {
            home,
            type_args: vec![marshaler.clone()],
            custom: Some(marshaler),
        }))
    }

    fn plan_slot(
        &self,
        imports: &mut Imports<'_>,
        target: &mut Module,
        slot: Slot,
        declared: &TypeSig,
        info: &MarshalInfo,
        declaration: &NativeDeclaration,
    ) -> Result<Option<SlotPlan>> {
        let Some(choice) = self.choose(imports, target, slot, declared, info)? else {
            return Ok(None);
        };
        let conversion_name = match slot {
            Slot::Param(_) => MARSHAL_MANAGED,
            Slot::Return => MARSHAL_NATIVE,
        };

        let (module, id) = imports.module_of(target, choice.home);
        let marshaler_name = module.type_full_name(id);
        let protocol = protocol_args(module, id).ok_or_else(|| Error::UnsupportedRepresentation {
            slot: slot.to_string(),
            representation: format!("{marshaler_name} does not derive from {MARSHALER_BASE}"),
        })?;
        let body = module
            .methods_named(id, conversion_name)
            .into_iter()
            .map(|method| module.method(method))
            .find(|method| !method.is_static() && method.signature.params.len() == 2)
            .and_then(|method| method.body.clone())
            .ok_or_else(|| Error::MemberNotFound {
                owner: marshaler_name.clone(),
                member: conversion_name.to_string(),
            })?;

        let (protocol, body) = match choice.home {
            Home::Target(_) => (protocol, body),
            Home::Support(_) => {
                let mut imported = Vec::with_capacity(protocol.len());
                for arg in &protocol {
                    imported.push(imports.sig(target, arg)?);
                }
                (imported, imports.body(target, &body)?)
            }
        };
        let protocol: Vec<TypeSig> = protocol
            .iter()
            .map(|arg| arg.substitute(&choice.type_args, &[]))
            .collect();
        let [_, settings_type, native, host]: [TypeSig; 4] =
            protocol.try_into().map_err(|_| Error::UnsupportedRepresentation {
                slot: slot.to_string(),
                representation: format!("{marshaler_name} has a malformed {MARSHALER_BASE} base"),
            })?;

        let cookie = info.custom.as_ref().map_or("", |spec| spec.cookie.as_str());
        let settings = match &choice.custom {
            Some(custom) => settings::factory(target, custom, cookie)?,
            None => {
                let ctx = MarshalContext {
                    declaration,
                    slot,
                    native_type: info.native_type,
                    cookie,
                };
                settings::construct(imports, target, &settings_type, &ctx)?
            }
        };
        let conversion = Conversion::split(
            target,
            &format!("{marshaler_name}::{conversion_name}"),
            body,
            &choice.type_args,
        )?;
        let cast = (slot == Slot::Return && host != *declared && !target.is_value_type(declared))
            .then(|| declared.clone());

        Ok(Some(SlotPlan {
            native,
            settings,
            conversion,
            cast,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::Support,
        metadata::{
            attributes::{MethodAttributes, TypeAttributes},
            members::{MethodDef, ParamDef, TypeDef},
            pinvoke::CharSet,
        },
        verify::verify_body,
    };

    fn declaration() -> NativeDeclaration {
        NativeDeclaration {
            library: "libc.so.6".into(),
            entry_point: "strdup".into(),
            calling_convention: CallingConvention::C,
            char_set: CharSet::Ansi,
        }
    }

    /// `static string strdup([LPStr] string)` on a fresh `App.Native`.
    fn strdup(module: &mut Module, ret_marshal: Option<MarshalInfo>) -> MethodId {
        let owner = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, None));
        let mut def = MethodDef::new(
            owner,
            "strdup",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::String, vec![TypeSig::String]),
        );
        def.params = vec![ParamDef::new("value").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR))];
        def.return_param.marshal = ret_marshal;
        module.add_method(def)
    }

    #[test]
    fn slots_show_their_position() {
        assert_eq!(Slot::Param(2).to_string(), "parameter 2");
        assert_eq!(Slot::Return.to_string(), "return value");
        assert_eq!(Slot::Return.index(), -1);
    }

    #[test]
    fn string_slots_get_native_pointers() -> Result<()> {
        let support = Support::builtin()?;
        for embed in [true, false] {
            let mut target = Module::new("App.dll", "App");
            let mut imports = Imports::new(&support, embed);
            if embed {
                imports.embed_all(&mut target)?;
            }
            let method = strdup(&mut target, Some(MarshalInfo::native(NATIVE_TYPE::LPSTR)));
            let injector = Injector::new(&imports, &target);
            let pipeline = injector.plan(&mut imports, &mut target, method, &declaration())?;
            assert_eq!(pipeline.marshaled_slots(), 2);

            let native = pipeline.native_sig(CallingConvention::C);
            assert_eq!(native.params, vec![TypeSig::I]);
            assert_eq!(native.ret, TypeSig::I);
            assert_eq!(native.call_conv, CallingConvention::C);
            assert!(!native.has_this);
        }
        Ok(())
    }

    #[test]
    fn emitted_bodies_inline_both_directions() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let method = strdup(&mut target, Some(MarshalInfo::native(NATIVE_TYPE::LPSTR)));
        let injector = Injector::new(&imports, &target);
        let pipeline = injector.plan(&mut imports, &mut target, method, &declaration())?;

        let mut e = BodyEmitter::new();
        pipeline.emit(&mut e, |e| {
            e.emit(OpCode::Pop);
            e.ldc_i4(0);
            e.emit(OpCode::ConvI);
        })?;
        let body = e.finish()?;
        verify_body(&target, target.method(method), &body)?;
        // the string is freed by the parameter cleanup
        assert!(body.instructions.iter().any(|instr| matches!(
            &instr.operand,
            Operand::Method(handle) if target.method_name(handle) == Some("FreeCoTaskMem")
        )));
        assert_eq!(body.count(OpCode::Ret), 1);
        assert_eq!(body.instructions.last().map(|instr| instr.opcode), Some(OpCode::Ret));
        Ok(())
    }

    #[test]
    fn unmarshaled_slots_pass_through() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let owner = target.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, None));
        let mut def = MethodDef::new(
            owner,
            "abs",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]),
        );
        def.params = vec![ParamDef::new("value").with_marshal(MarshalInfo::native(NATIVE_TYPE::I4))];
        let method = target.add_method(def);
        let injector = Injector::new(&imports, &target);
        let pipeline = injector.plan(&mut imports, &mut target, method, &declaration())?;
        assert!(pipeline.is_empty());

        let mut e = BodyEmitter::new();
        pipeline.emit(&mut e, |e| {
            e.emit(OpCode::Pop);
            e.ldc_i4(0);
        })?;
        let body = e.finish()?;
        let opcodes: Vec<OpCode> = body.instructions.iter().map(|instr| instr.opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::Ldarg0, OpCode::Pop, OpCode::LdcI40, OpCode::Stloc0, OpCode::Ldloc0, OpCode::Ret]
        );
        Ok(())
    }

    #[test]
    fn uncovered_reference_slots_are_fatal() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let owner = target.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, None));
        let mut def = MethodDef::new(
            owner,
            "SysAllocString",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::Void, vec![TypeSig::String]),
        );
        def.params = vec![ParamDef::new("value").with_marshal(MarshalInfo::native(NATIVE_TYPE::BSTR))];
        let method = target.add_method(def);
        let injector = Injector::new(&imports, &target);
        assert!(matches!(
            injector.plan(&mut imports, &mut target, method, &declaration()),
            Err(Error::UnsupportedRepresentation { .. })
        ));
        Ok(())
    }

    #[test]
    fn custom_marshalers_go_through_the_adapter() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let custom = target.core_type("App.Interop", "PathMarshaler", false);
        let owner = target.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, None));
        let mut def = MethodDef::new(
            owner,
            "open",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::Object]),
        );
        def.params = vec![ParamDef::new("path").with_marshal(MarshalInfo::custom(custom.clone(), "utf8"))];
        let method = target.add_method(def);
        let injector = Injector::new(&imports, &target);
        let pipeline = injector.plan(&mut imports, &mut target, method, &declaration())?;
        assert_eq!(pipeline.native_sig(CallingConvention::C).params, vec![TypeSig::I]);

        let mut e = BodyEmitter::new();
        pipeline.emit(&mut e, |e| {
            e.emit(OpCode::Pop);
            e.ldc_i4(0);
        })?;
        let body = e.finish()?;
        verify_body(&target, target.method(method), &body)?;
        assert!(body.instructions.iter().any(|instr| instr.operand == Operand::String("utf8".into())));
        assert!(body.instructions.iter().any(|instr| instr.operand == Operand::Type(custom.clone())));
        Ok(())
    }
}
