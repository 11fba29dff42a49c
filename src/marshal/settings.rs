//! Construction of marshaler settings values.
//!
//! Every parameter of a settings constructor names a generator through
//! `MarshalerInfoInitializationAttribute`. Generators are looked up in a fixed table and
//! evaluated against the [`MarshalContext`] of the slot being marshaled, so the constructor
//! arguments are known when the call site is synthesized.

use crate::{
    interop::{Home, Imports, FACTORY_METHOD, INTEROP_NAMESPACE, MARSHALER_INFO_INITIALIZATION_ATTRIBUTE},
    marshal::Slot,
    metadata::{
        emitter::BodyEmitter,
        module::Module,
        body::Operand,
        opcodes::OpCode,
        pinvoke::CharSet,
        references::MethodHandle,
        token::MethodId,
        typesystem::{CallingConvention, MethodSig, TypeSig},
    },
    Error, Result,
};

/// What a native declaration says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDeclaration {
    /// Library name as declared
    pub library: String,
    /// Symbol to resolve
    pub entry_point: String,
    /// Call site convention
    pub calling_convention: CallingConvention,
    /// Character set policy
    pub char_set: CharSet,
}

/// Everything a generator may read.
#[derive(Debug, Clone, Copy)]
pub struct MarshalContext<'a> {
    /// The declaration being rewritten
    pub declaration: &'a NativeDeclaration,
    /// The slot being marshaled
    pub slot: Slot,
    /// Requested native representation
    pub native_type: u8,
    /// Cookie of a custom marshaler descriptor, empty otherwise
    pub cookie: &'a str,
}

/// A constant produced by a generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    /// Integer or enum value
    Int(i32),
    /// String value
    Str(String),
}

impl Generated {
    fn emit(&self, e: &mut BodyEmitter) {
        match self {
            Generated::Int(value) => e.ldc_i4(*value),
            Generated::Str(value) => e.ldstr(value),
        }
    }
}

/// `System.Runtime.InteropServices.CallingConvention` value of a call site convention.
fn calling_convention_value(convention: CallingConvention) -> i32 {
    match convention {
        CallingConvention::C => 2,
        CallingConvention::StdCall => 3,
        CallingConvention::ThisCall => 4,
        CallingConvention::FastCall => 5,
        _ => 1,
    }
}

type Generator = fn(&MarshalContext<'_>) -> Generated;

const GENERATORS: &[(&str, Generator)] = &[
    ("CharSet", |ctx| Generated::Int(ctx.declaration.char_set as i32)),
    ("NativeDeclaration.CharSet", |ctx| Generated::Int(ctx.declaration.char_set as i32)),
    ("UnmanagedType", |ctx| Generated::Int(i32::from(ctx.native_type))),
    ("NativeDeclaration.EntryPoint", |ctx| Generated::Str(ctx.declaration.entry_point.clone())),
    ("NativeDeclaration.Library", |ctx| Generated::Str(ctx.declaration.library.clone())),
    ("NativeDeclaration.CallingConvention", |ctx| {
        Generated::Int(calling_convention_value(ctx.declaration.calling_convention))
    }),
    ("Slot.Index", |ctx| Generated::Int(ctx.slot.index())),
    ("Cookie", |ctx| Generated::Str(ctx.cookie.to_string())),
];

/// Evaluates the generator called `name`.
#[must_use]
pub fn generate(name: &str, ctx: &MarshalContext<'_>) -> Option<Generated> {
    GENERATORS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, generator)| generator(ctx))
}

/// How the settings local of one slot is initialized.
#[derive(Debug, Clone)]
pub enum Settings {
    /// `ldloca s; args; call ctor` or `args; newobj ctor; stloc s`
    Construct {
        /// The settings type
        settings_type: TypeSig,
        /// The chosen constructor
        ctor: MethodHandle,
        /// Constructor arguments in order
        args: Vec<Generated>,
        /// The settings type is a value type
        value_type: bool,
    },
    /// `ldloca s; initobj T` for value types without constructor
    Zero(TypeSig),
    /// `ldstr cookie; call T::GetInstance(string); castclass T; stloc s`
    Factory {
        /// The custom marshaler type
        marshaler: TypeSig,
        /// Its factory
        factory: MethodHandle,
        /// The cookie handed to the factory
        cookie: String,
    },
}

impl Settings {
    /// The type of the settings local.
    #[must_use]
    pub fn local_type(&self) -> &TypeSig {
        match self {
            Settings::Construct { settings_type, .. } | Settings::Zero(settings_type) => settings_type,
            Settings::Factory { marshaler, .. } => marshaler,
        }
    }

    /// Emits the initialization of local `slot`.
    pub fn emit(&self, e: &mut BodyEmitter, slot: u16) {
        match self {
            Settings::Construct {
                ctor,
                args,
                value_type: true,
                ..
            } => {
                e.ldloca(slot);
                for arg in args {
                    arg.emit(e);
                }
                e.call(ctor.clone());
            }
            Settings::Construct { ctor, args, .. } => {
                for arg in args {
                    arg.emit(e);
                }
                e.newobj(ctor.clone());
                e.stloc(slot);
            }
            Settings::Zero(settings_type) => {
                e.ldloca(slot);
                e.emit_operand(OpCode::Initobj, Operand::Type(settings_type.clone()));
            }
            Settings::Factory {
                marshaler,
                factory,
                cookie,
            } => {
                e.ldstr(cookie);
                e.call(factory.clone());
                e.emit_operand(OpCode::Castclass, Operand::Type(marshaler.clone()));
                e.stloc(slot);
            }
        }
    }
}

/// Finds the settings constructor whose parameters all resolve, longest parameter list first.
///
/// # Errors
/// Returns [`Error::SettingsConstruction`] if no constructor resolves.
pub fn construct(
    imports: &mut Imports<'_>,
    target: &mut Module,
    settings_type: &TypeSig,
    ctx: &MarshalContext<'_>,
) -> Result<Settings> {
    let Some(home) = imports.locate(target, settings_type)? else {
        return Err(Error::SettingsConstruction(format!(
            "{} is not defined by the module or the support assembly",
            target.sig_name(settings_type)
        )));
    };

    let (module, id) = imports.module_of(target, home);
    let value_type = module.is_value_type(&TypeSig::Def(id));
    if !module.ty(id).generic_params.is_empty() {
        return Err(Error::SettingsConstruction(format!(
            "generic settings type {}",
            module.type_full_name(id)
        )));
    }
    let mut ctors: Vec<MethodId> = module
        .methods_named(id, ".ctor")
        .into_iter()
        .filter(|ctor| !module.method(*ctor).is_static())
        .collect();
    // stable, so declaration order breaks ties
    ctors.sort_by_key(|ctor| std::cmp::Reverse(module.method(*ctor).params.len()));

    let mut chosen = None;
    for ctor in &ctors {
        let method = module.method(*ctor);
        let args: Option<Vec<Generated>> = method
            .params
            .iter()
            .map(|param| {
                module
                    .attributes_of(
                        &param.custom_attributes,
                        INTEROP_NAMESPACE,
                        MARSHALER_INFO_INITIALIZATION_ATTRIBUTE,
                    )
                    .find_map(|attribute| attribute.fixed_args.first().and_then(|arg| arg.as_str()))
                    .and_then(|name| generate(name, ctx))
            })
            .collect();
        if let Some(args) = args {
            chosen = Some((*ctor, args));
            break;
        }
    }

    let name = module.type_full_name(id);
    match chosen {
        Some((ctor, args)) => {
            let ctor = match home {
                Home::Target(_) => MethodHandle::Def(ctor),
                Home::Support(_) => imports.method_handle(target, &MethodHandle::Def(ctor))?,
            };
            Ok(Settings::Construct {
                settings_type: settings_type.clone(),
                ctor,
                args,
                value_type,
            })
        }
        None if ctors.is_empty() && value_type => Ok(Settings::Zero(settings_type.clone())),
        None => Err(Error::SettingsConstruction(format!(
            "no constructor of {name} can be initialized for {}",
            ctx.slot
        ))),
    }
}

/// Settings of a custom marshaler: the instance its factory returns.
///
/// # Errors
/// Returns [`Error::MissingFactory`] if a locally defined marshaler has no
/// `static GetInstance(string)`.
pub fn factory(target: &mut Module, marshaler: &TypeSig, cookie: &str) -> Result<Settings> {
    let factory = match target.local_definition(marshaler) {
        Some(id) => target
            .methods_named(id, FACTORY_METHOD)
            .into_iter()
            .find(|method| {
                let method = target.method(*method);
                method.is_static() && method.signature.params == [TypeSig::String]
            })
            .map(MethodHandle::Def)
            .ok_or_else(|| Error::MissingFactory(target.type_full_name(id)))?,
        None => {
            let contract = target.core_type("System.Runtime.InteropServices", "ICustomMarshaler", false);
            target.method_on(
                marshaler,
                FACTORY_METHOD,
                MethodSig::new_static(contract, vec![TypeSig::String]),
            )?
        }
    };
    Ok(Settings::Factory {
        marshaler: marshaler.clone(),
        factory,
        cookie: cookie.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{Support, STRING_MARSHALER_INFO};
    use crate::metadata::marshalling::NATIVE_TYPE;

    fn declaration() -> NativeDeclaration {
        NativeDeclaration {
            library: "libc.so.6".into(),
            entry_point: "puts".into(),
            calling_convention: CallingConvention::C,
            char_set: CharSet::Unicode,
        }
    }

    #[test]
    fn generators_read_the_context() {
        let declaration = declaration();
        let ctx = MarshalContext {
            declaration: &declaration,
            slot: Slot::Param(1),
            native_type: NATIVE_TYPE::LPWSTR,
            cookie: "c",
        };
        assert_eq!(generate("CharSet", &ctx), Some(Generated::Int(3)));
        assert_eq!(generate("UnmanagedType", &ctx), Some(Generated::Int(0x15)));
        assert_eq!(generate("NativeDeclaration.CallingConvention", &ctx), Some(Generated::Int(2)));
        assert_eq!(generate("NativeDeclaration.Library", &ctx), Some(Generated::Str("libc.so.6".into())));
        assert_eq!(generate("Slot.Index", &ctx), Some(Generated::Int(1)));
        assert_eq!(generate("Slot.Index", &MarshalContext { slot: Slot::Return, ..ctx }), Some(Generated::Int(-1)));
        assert_eq!(generate("Nope", &ctx), None);
    }

    #[test]
    fn string_settings_use_the_two_argument_constructor() -> Result<()> {
        let support = Support::builtin()?;
        for embed in [true, false] {
            let mut target = Module::new("App.dll", "App");
            let mut imports = Imports::new(&support, embed);
            let info = imports.ty(&mut target, STRING_MARSHALER_INFO)?;
            let declaration = declaration();
            let ctx = MarshalContext {
                declaration: &declaration,
                slot: Slot::Param(0),
                native_type: NATIVE_TYPE::LPSTR,
                cookie: "",
            };
            let settings = construct(&mut imports, &mut target, &info, &ctx)?;
            let Settings::Construct { args, value_type, .. } = settings else {
                panic!("expected a constructor call");
            };
            assert!(value_type);
            assert_eq!(args, vec![Generated::Int(3), Generated::Int(0x14)]);
        }
        Ok(())
    }

    #[test]
    fn primitive_settings_are_rejected() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let declaration = declaration();
        let ctx = MarshalContext {
            declaration: &declaration,
            slot: Slot::Return,
            native_type: NATIVE_TYPE::LPSTR,
            cookie: "",
        };
        assert!(matches!(
            construct(&mut imports, &mut target, &TypeSig::I4, &ctx),
            Err(Error::SettingsConstruction(_))
        ));
        Ok(())
    }
}
