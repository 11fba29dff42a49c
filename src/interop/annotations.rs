//! Annotation types read by the rewriter.

use crate::{
    interop::{
        builder::SupportBuilder, IMPORT_FILTER_ATTRIBUTE, IMPORT_LOADER_ATTRIBUTE,
        MARSHALER_INFO_INITIALIZATION_ATTRIBUTE, MARSHALER_TYPE_ATTRIBUTE,
    },
    metadata::{
        attributes::TypeAttributes,
        body::Operand,
        emitter::BodyEmitter,
        opcodes::OpCode,
        references::{FieldHandle, MethodHandle},
        token::{FieldId, TypeId},
        typesystem::TypeSig,
    },
    Result,
};

/// Constructors of the annotations, for attaching them to other support types.
pub(super) struct Annotations {
    pub import_filter: MethodHandle,
    pub marshaler_type: MethodHandle,
    pub info_initialization: MethodHandle,
    pub unmanaged_type: TypeSig,
}

fn attribute_class(b: &mut SupportBuilder, name: &str) -> TypeId {
    let attribute = b.attribute.clone();
    b.class(
        name,
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        Some(attribute),
    )
}

fn store(field: FieldId, arg: u16) -> impl Fn(&mut BodyEmitter) {
    move |e: &mut BodyEmitter| {
        e.ldarg(0);
        e.ldarg(arg);
        e.emit_operand(OpCode::Stfld, Operand::Field(FieldHandle::Def(field)));
    }
}

pub(super) fn define(b: &mut SupportBuilder) -> Result<Annotations> {
    let base = b.attribute_ctor()?;
    let string = TypeSig::String;
    let system_type = b.core("System", "Type");
    let unmanaged_type = b.core_value("System.Runtime.InteropServices", "UnmanagedType");

    let filter = attribute_class(b, IMPORT_FILTER_ATTRIBUTE);
    let include = b.auto_property(filter, "Include", TypeSig::Boolean)?;
    let import_filter = b.ctor(filter, vec![TypeSig::Boolean], base.clone(), store(include, 1))?;

    let loader = attribute_class(b, IMPORT_LOADER_ATTRIBUTE);
    let loader_type = b.auto_property(loader, "Loader", system_type.clone())?;
    let cookie = b.auto_property(loader, "Cookie", string.clone())?;
    b.ctor(loader, vec![string.clone()], base.clone(), store(cookie, 1))?;
    b.ctor(loader, vec![system_type, string.clone()], base.clone(), |e| {
        store(loader_type, 1)(e);
        store(cookie, 2)(e);
    })?;

    let marshaler = attribute_class(b, MARSHALER_TYPE_ATTRIBUTE);
    let representation = b.auto_property(marshaler, "UnmanagedType", unmanaged_type.clone())?;
    let marshaler_type = b.ctor(
        marshaler,
        vec![unmanaged_type.clone()],
        base.clone(),
        store(representation, 1),
    )?;

    let initialization = attribute_class(b, MARSHALER_INFO_INITIALIZATION_ATTRIBUTE);
    let generator = b.auto_property(initialization, "InitializationGenerator", string.clone())?;
    let info_initialization = b.ctor(initialization, vec![string], base, store(generator, 1))?;

    Ok(Annotations {
        import_filter: MethodHandle::Def(import_filter),
        marshaler_type: MethodHandle::Def(marshaler_type),
        info_initialization: MethodHandle::Def(info_initialization),
        unmanaged_type,
    })
}
