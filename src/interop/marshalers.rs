//! The marshaler protocol and the two reference marshalers.
//!
//! Marshaler conversion bodies are never called: the injector splices them into call sites.
//! A body receives the settings as argument 1 and the datum as argument 2, leaves the
//! converted value as the argument of the `ObjectInitialized` marker and continues with the
//! cleanup that runs after the native call.

use crate::{
    interop::{
        annotations::Annotations,
        builder::{ctor_flags, interface_slot, public_static, SupportBuilder},
        CSTRING_MARSHALER, CUSTOM_MARSHALER_ADAPTER, FACTORY_METHOD, MARKER_METHOD,
        MARSHALER_BASE, MARSHALER_INTERFACE, MARSHAL_INITIALIZATION, MARSHAL_MANAGED,
        MARSHAL_NATIVE, STRING_MARSHALER_INFO,
    },
    metadata::{
        attributes::{MemberAccess, MethodAttributes, TypeAttributes},
        body::Operand,
        customattributes::{AttributeArgument, CustomAttribute},
        emitter::{BodyEmitter, Label},
        marshalling::NATIVE_TYPE,
        members::GenericParam,
        opcodes::OpCode,
        references::{FieldHandle, MethodHandle},
        token::TypeId,
        typesystem::{MethodSig, TypeSig},
    },
    Result,
};

fn generic(b: &mut SupportBuilder, id: TypeId, names: &[&str]) {
    b.module.ty_mut(id).generic_params = names
        .iter()
        .zip(0u16..)
        .map(|(name, number)| GenericParam::new(number, name))
        .collect();
}

fn vars(count: u16) -> Vec<TypeSig> {
    (0..count).map(TypeSig::Var).collect()
}

fn supports(annotations: &Annotations, native_type: u8) -> CustomAttribute {
    CustomAttribute::new(
        annotations.marshaler_type.clone(),
        vec![AttributeArgument::Enum {
            enum_type: annotations.unmanaged_type.clone(),
            value: i32::from(native_type),
        }],
    )
}

fn overriding() -> MethodAttributes {
    (MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Public)
}

struct Protocol {
    marker: TypeId,
    base: TypeId,
}

fn protocol(b: &mut SupportBuilder) -> Result<Protocol> {
    let object = b.object.clone();
    let marker = b.class(
        MARSHAL_INITIALIZATION,
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object.clone()),
    );
    generic(b, marker, &["TNative", "THost"]);
    for slot in vars(2) {
        b.method(
            marker,
            MARKER_METHOD,
            public_static(),
            MethodSig::new_static(TypeSig::Void, vec![slot]),
            Some(|e: &mut BodyEmitter| e.ret()),
        )?;
    }

    let interface = b.class(
        MARSHALER_INTERFACE,
        TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
        None,
    );
    generic(b, interface, &["TSettings", "TNative", "THost"]);
    b.declare(
        interface,
        MARSHAL_MANAGED,
        interface_slot(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(0), TypeSig::Var(2)]),
    )?;
    b.declare(
        interface,
        MARSHAL_NATIVE,
        interface_slot(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(0), TypeSig::Var(1)]),
    )?;

    let base = b.class(
        MARSHALER_BASE,
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    generic(b, base, &["TMarshaler", "TSettings", "TNative", "THost"]);
    b.module.ty_mut(base).interfaces.push(TypeSig::generic_class(
        TypeSig::Def(interface),
        vec![TypeSig::Var(1), TypeSig::Var(2), TypeSig::Var(3)],
    ));
    let object_ctor = b.object_ctor()?;
    let ctor = b.ctor(base, vec![], object_ctor, |_| {})?;
    let flags = ctor_flags().with_access(MemberAccess::Family);
    b.module.method_mut(ctor).flags = flags;
    b.declare(
        base,
        MARSHAL_MANAGED,
        interface_slot(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(1), TypeSig::Var(3)]),
    )?;
    b.declare(
        base,
        MARSHAL_NATIVE,
        interface_slot(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(1), TypeSig::Var(2)]),
    )?;
    Ok(Protocol { marker, base })
}

/// `MarshalInitialization<native, host>.ObjectInitialized(!position)`
fn marker_call(b: &mut SupportBuilder, protocol: &Protocol, host: TypeSig, position: u16) -> Result<MethodHandle> {
    let parent = TypeSig::generic_class(TypeSig::Def(protocol.marker), vec![TypeSig::I, host]);
    b.module.method_on(
        &parent,
        MARKER_METHOD,
        MethodSig::new_static(TypeSig::Void, vec![TypeSig::Var(position)]),
    )
}

/// Defines the settings type of the string marshaler and returns it with its
/// `UnmanagedType` getter.
fn string_marshaler_info(b: &mut SupportBuilder, annotations: &Annotations) -> Result<(TypeId, MethodHandle)> {
    let value_type = b.core("System", "ValueType");
    let char_set = b.core_value("System.Runtime.InteropServices", "CharSet");
    let info = b.class(
        STRING_MARSHALER_INFO,
        TypeAttributes::PUBLIC
            | TypeAttributes::SEALED
            | TypeAttributes::SEQUENTIAL_LAYOUT
            | TypeAttributes::BEFORE_FIELD_INIT,
        Some(value_type),
    );
    let char_set_field = b.auto_property(info, "CharSet", char_set.clone())?;
    let representation = b.auto_property(info, "UnmanagedType", annotations.unmanaged_type.clone())?;

    let ctor = b.method(
        info,
        ".ctor",
        ctor_flags(),
        MethodSig::new_instance(TypeSig::Void, vec![char_set, annotations.unmanaged_type.clone()]),
        Some(|e: &mut BodyEmitter| {
            for (arg, field) in [(1, char_set_field), (2, representation)] {
                e.ldarg(0);
                e.ldarg(arg);
                e.emit_operand(OpCode::Stfld, Operand::Field(FieldHandle::Def(field)));
            }
            e.ret();
        }),
    )?;
    let params = &mut b.module.method_mut(ctor).params;
    for (param, (name, generator)) in params
        .iter_mut()
        .zip([("charSet", "CharSet"), ("unmanagedType", "UnmanagedType")])
    {
        param.name = name.to_string();
        param.custom_attributes.push(CustomAttribute::new(
            annotations.info_initialization.clone(),
            vec![AttributeArgument::String(Some(generator.to_string()))],
        ));
    }

    let getter = b
        .module
        .find_method(info, "get_UnmanagedType", None)
        .map(MethodHandle::Def)
        .ok_or_else(|| crate::Error::MemberNotFound {
            owner: STRING_MARSHALER_INFO.to_string(),
            member: "get_UnmanagedType".to_string(),
        })?;
    Ok((info, getter))
}

fn cstring_marshaler(b: &mut SupportBuilder, annotations: &Annotations, protocol: &Protocol) -> Result<()> {
    let (info, representation) = string_marshaler_info(b, annotations)?;
    let marshaler = b.class(
        CSTRING_MARSHALER,
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        None,
    );
    let base = TypeSig::generic_class(
        TypeSig::Def(protocol.base),
        vec![TypeSig::Def(marshaler), TypeSig::Def(info), TypeSig::I, TypeSig::String],
    );
    b.module.ty_mut(marshaler).extends = Some(base.clone());
    for native_type in [NATIVE_TYPE::LPSTR, NATIVE_TYPE::LPWSTR, NATIVE_TYPE::LPUTF8STR] {
        b.module
            .ty_mut(marshaler)
            .custom_attributes
            .push(supports(annotations, native_type));
    }

    let base_ctor = b.module.method_on(&base, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![]))?;
    let ctor = b.ctor(marshaler, vec![], base_ctor, |_| {})?;
    b.method(
        marshaler,
        FACTORY_METHOD,
        public_static(),
        MethodSig::new_static(TypeSig::Def(marshaler), vec![TypeSig::String]),
        Some(|e: &mut BodyEmitter| {
            e.newobj(MethodHandle::Def(ctor));
            e.ret();
        }),
    )?;

    let marshal = b.core("System.Runtime.InteropServices", "Marshal");
    let mut interop = |name: &str, ret: TypeSig, param: TypeSig| {
        b.module
            .method_on(&marshal, name, MethodSig::new_static(ret, vec![param]))
    };
    let to_ansi = interop("StringToCoTaskMemAnsi", TypeSig::I, TypeSig::String)?;
    let to_unicode = interop("StringToCoTaskMemUni", TypeSig::I, TypeSig::String)?;
    let to_utf8 = interop("StringToCoTaskMemUTF8", TypeSig::I, TypeSig::String)?;
    let free = interop("FreeCoTaskMem", TypeSig::Void, TypeSig::I)?;
    let from_ansi = interop("PtrToStringAnsi", TypeSig::String, TypeSig::I)?;
    let from_unicode = interop("PtrToStringUni", TypeSig::String, TypeSig::I)?;
    let from_utf8 = interop("PtrToStringUTF8", TypeSig::String, TypeSig::I)?;
    let native_ready = marker_call(b, protocol, TypeSig::String, 0)?;
    let host_ready = marker_call(b, protocol, TypeSig::String, 1)?;

    // picks one of three conversions by the requested representation, leaving its result
    let dispatch = move |e: &mut BodyEmitter, ansi: MethodHandle, unicode: MethodHandle, utf8: MethodHandle, done: Label| {
        let wide = e.define_label();
        let narrow = e.define_label();
        e.ldarga(1);
        e.call(representation.clone());
        e.ldc_i4(i32::from(NATIVE_TYPE::LPWSTR));
        e.branch(OpCode::Beq, wide);
        e.ldarga(1);
        e.call(representation.clone());
        e.ldc_i4(i32::from(NATIVE_TYPE::LPUTF8STR));
        e.branch(OpCode::Beq, narrow);
        e.ldarg(2);
        e.call(ansi);
        e.branch(OpCode::Br, done);
        e.mark_label(wide);
        e.ldarg(2);
        e.call(unicode);
        e.branch(OpCode::Br, done);
        e.mark_label(narrow);
        e.ldarg(2);
        e.call(utf8);
    };

    let to_native = dispatch.clone();
    b.method(
        marshaler,
        MARSHAL_MANAGED,
        overriding(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Def(info), TypeSig::String]),
        Some(|e: &mut BodyEmitter| {
            let buffer = e.declare_local(TypeSig::I);
            let store = e.define_label();
            to_native(e, to_ansi, to_unicode, to_utf8, store);
            e.mark_label(store);
            e.stloc(buffer);
            e.ldloc(buffer);
            e.call(native_ready);
            e.ldloc(buffer);
            e.call(free);
            e.ret();
        }),
    )?;
    b.method(
        marshaler,
        MARSHAL_NATIVE,
        overriding(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Def(info), TypeSig::I]),
        Some(|e: &mut BodyEmitter| {
            let present = e.define_label();
            let done = e.define_label();
            e.ldarg(2);
            e.branch(OpCode::Brtrue, present);
            e.ldnull();
            e.branch(OpCode::Br, done);
            e.mark_label(present);
            dispatch(e, from_ansi, from_unicode, from_utf8, done);
            e.mark_label(done);
            e.call(host_ready);
            e.ret();
        }),
    )?;
    Ok(())
}

fn custom_marshaler_adapter(b: &mut SupportBuilder, annotations: &Annotations, protocol: &Protocol) -> Result<()> {
    let custom = b.core("System.Runtime.InteropServices", "ICustomMarshaler");
    let adapter = b.class(
        CUSTOM_MARSHALER_ADAPTER,
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        None,
    );
    let mut param = GenericParam::new(0, "T");
    param.constraints.push(custom.clone());
    b.module.ty_mut(adapter).generic_params = vec![param];
    let own = TypeSig::generic_class(TypeSig::Def(adapter), vec![TypeSig::Var(0)]);
    let base = TypeSig::generic_class(
        TypeSig::Def(protocol.base),
        vec![own.clone(), TypeSig::Var(0), TypeSig::I, TypeSig::Object],
    );
    b.module.ty_mut(adapter).extends = Some(base.clone());
    b.module
        .ty_mut(adapter)
        .custom_attributes
        .push(supports(annotations, NATIVE_TYPE::CUSTOMMARSHALER));

    let base_ctor = b.module.method_on(&base, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![]))?;
    b.ctor(adapter, vec![], base_ctor, |_| {})?;
    let own_ctor = b.module.method_on(&own, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![]))?;
    b.method(
        adapter,
        FACTORY_METHOD,
        public_static(),
        MethodSig::new_static(own, vec![TypeSig::String]),
        Some(|e: &mut BodyEmitter| {
            e.newobj(own_ctor);
            e.ret();
        }),
    )?;

    let mut contract = |name: &str, ret: TypeSig, param: TypeSig| {
        b.module
            .method_on(&custom, name, MethodSig::new_instance(ret, vec![param]))
    };
    let to_native = contract("MarshalManagedToNative", TypeSig::I, TypeSig::Object)?;
    let to_host = contract("MarshalNativeToManaged", TypeSig::Object, TypeSig::I)?;
    let clean_native = contract("CleanUpNativeData", TypeSig::Void, TypeSig::I)?;
    let native_ready = marker_call(b, protocol, TypeSig::Object, 0)?;
    let host_ready = marker_call(b, protocol, TypeSig::Object, 1)?;

    let settings = |e: &mut BodyEmitter| {
        e.ldarg(1);
        e.emit_operand(OpCode::Box, Operand::Type(TypeSig::Var(0)));
    };
    b.method(
        adapter,
        MARSHAL_MANAGED,
        overriding(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(0), TypeSig::Object]),
        Some(|e: &mut BodyEmitter| {
            let native = e.declare_local(TypeSig::I);
            settings(e);
            e.ldarg(2);
            e.callvirt(to_native);
            e.stloc(native);
            e.ldloc(native);
            e.call(native_ready);
            settings(e);
            e.ldloc(native);
            e.callvirt(clean_native.clone());
            e.ret();
        }),
    )?;
    b.method(
        adapter,
        MARSHAL_NATIVE,
        overriding(),
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Var(0), TypeSig::I]),
        Some(|e: &mut BodyEmitter| {
            settings(e);
            e.ldarg(2);
            e.callvirt(to_host);
            e.call(host_ready);
            settings(e);
            e.ldarg(2);
            e.callvirt(clean_native);
            e.ret();
        }),
    )?;
    Ok(())
}

pub(super) fn define(b: &mut SupportBuilder, annotations: &Annotations) -> Result<()> {
    let protocol = protocol(b)?;
    cstring_marshaler(b, annotations, &protocol)?;
    custom_marshaler_adapter(b, annotations, &protocol)
}
