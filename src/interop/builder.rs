//! Helpers for assembling the support module in memory.

use crate::{
    interop::{annotations, loader, marshalers, INTEROP_ASSEMBLY, INTEROP_NAMESPACE},
    metadata::{
        attributes::{FieldAttributes, MemberAccess, MethodAttributes, PropertyAttributes, TypeAttributes},
        emitter::BodyEmitter,
        members::{FieldDef, MethodDef, PropertyDef, TypeDef},
        module::Module,
        opcodes::OpCode,
        references::{FieldHandle, MethodHandle, Version},
        token::{FieldId, MethodId, TypeId},
        typesystem::{MethodSig, TypeSig},
    },
    verify::finalize_body,
    Result,
};

/// Public instance constructor flags.
pub(super) fn ctor_flags() -> MethodAttributes {
    (MethodAttributes::HIDE_BY_SIG | MethodAttributes::SPECIAL_NAME | MethodAttributes::RTSPECIAL_NAME)
        .with_access(MemberAccess::Public)
}

/// Public abstract interface slot.
pub(super) fn interface_slot() -> MethodAttributes {
    (MethodAttributes::VIRTUAL
        | MethodAttributes::ABSTRACT
        | MethodAttributes::NEW_SLOT
        | MethodAttributes::HIDE_BY_SIG)
        .with_access(MemberAccess::Public)
}

/// Public sealed implementation of an interface slot.
pub(super) fn implementation() -> MethodAttributes {
    (MethodAttributes::VIRTUAL
        | MethodAttributes::FINAL
        | MethodAttributes::NEW_SLOT
        | MethodAttributes::HIDE_BY_SIG)
        .with_access(MemberAccess::Public)
}

/// Public static method.
pub(super) fn public_static() -> MethodAttributes {
    (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Public)
}

pub(super) struct SupportBuilder {
    pub module: Module,
    pub object: TypeSig,
    pub attribute: TypeSig,
    object_ctor: Option<MethodHandle>,
    attribute_ctor: Option<MethodHandle>,
}

impl SupportBuilder {
    fn new() -> Self {
        let mut module = Module::new(&format!("{INTEROP_ASSEMBLY}.dll"), INTEROP_ASSEMBLY);
        if let Some(assembly) = module.assembly.as_mut() {
            assembly.version = Version::new(1, 0, 0, 0);
        }
        let object = module.core_type("System", "Object", false);
        let attribute = module.core_type("System", "Attribute", false);
        SupportBuilder {
            module,
            object,
            attribute,
            object_ctor: None,
            attribute_ctor: None,
        }
    }

    pub fn core(&mut self, namespace: &str, name: &str) -> TypeSig {
        self.module.core_type(namespace, name, false)
    }

    pub fn core_value(&mut self, namespace: &str, name: &str) -> TypeSig {
        self.module.core_type(namespace, name, true)
    }

    pub fn core_method(&mut self, parent: &TypeSig, name: &str, sig: MethodSig) -> Result<MethodHandle> {
        self.module.method_on(parent, name, sig)
    }

    pub fn object_ctor(&mut self) -> Result<MethodHandle> {
        if let Some(handle) = &self.object_ctor {
            return Ok(handle.clone());
        }
        let object = self.object.clone();
        let handle = self.module.method_on(&object, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![]))?;
        self.object_ctor = Some(handle.clone());
        Ok(handle)
    }

    pub fn attribute_ctor(&mut self) -> Result<MethodHandle> {
        if let Some(handle) = &self.attribute_ctor {
            return Ok(handle.clone());
        }
        let attribute = self.attribute.clone();
        let handle =
            self.module
                .method_on(&attribute, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![]))?;
        self.attribute_ctor = Some(handle.clone());
        Ok(handle)
    }

    /// Adds a top-level type of the support namespace.
    pub fn class(&mut self, name: &str, flags: TypeAttributes, extends: Option<TypeSig>) -> TypeId {
        self.module
            .add_type(TypeDef::new(INTEROP_NAMESPACE, name, flags, extends))
    }

    /// Adds a nested type.
    pub fn nested(&mut self, enclosing: TypeId, name: &str, flags: TypeAttributes, extends: Option<TypeSig>) -> TypeId {
        let mut def = TypeDef::new("", name, flags, extends);
        def.enclosing = Some(enclosing);
        self.module.add_type(def)
    }

    /// Adds a method; `build` receives an emitter if the method has a body.
    pub fn method<F>(
        &mut self,
        owner: TypeId,
        name: &str,
        flags: MethodAttributes,
        sig: MethodSig,
        build: Option<F>,
    ) -> Result<MethodId>
    where
        F: FnOnce(&mut BodyEmitter),
    {
        let mut def = MethodDef::new(owner, name, flags, sig);
        if let Some(build) = build {
            let mut emitter = BodyEmitter::new();
            build(&mut emitter);
            def.body = Some(emitter.finish()?);
        }
        Ok(self.module.add_method(def))
    }

    /// Adds an abstract method without body.
    pub fn declare(&mut self, owner: TypeId, name: &str, flags: MethodAttributes, sig: MethodSig) -> Result<MethodId> {
        self.method(owner, name, flags, sig, None::<fn(&mut BodyEmitter)>)
    }

    /// Adds an instance constructor that chains to `base` and then runs `build`.
    pub fn ctor<F>(&mut self, owner: TypeId, params: Vec<TypeSig>, base: MethodHandle, build: F) -> Result<MethodId>
    where
        F: FnOnce(&mut BodyEmitter),
    {
        self.method(
            owner,
            ".ctor",
            ctor_flags(),
            MethodSig::new_instance(TypeSig::Void, params),
            Some(|e: &mut BodyEmitter| {
                e.ldarg(0);
                e.call(base);
                build(e);
                e.ret();
            }),
        )
    }

    /// Adds a read-only auto property with a private backing field, returning the field.
    pub fn auto_property(&mut self, owner: TypeId, name: &str, property_type: TypeSig) -> Result<FieldId> {
        let field = self.module.add_field(FieldDef::new(
            owner,
            &format!("<{name}>k__BackingField"),
            FieldAttributes::INIT_ONLY.with_access(MemberAccess::Private),
            property_type.clone(),
        ));
        let getter = self.method(
            owner,
            &format!("get_{name}"),
            (MethodAttributes::HIDE_BY_SIG | MethodAttributes::SPECIAL_NAME).with_access(MemberAccess::Public),
            MethodSig::new_instance(property_type.clone(), vec![]),
            Some(|e: &mut BodyEmitter| {
                e.ldarg(0);
                e.emit_operand(OpCode::Ldfld, crate::metadata::body::Operand::Field(FieldHandle::Def(field)));
                e.ret();
            }),
        )?;
        self.module.add_property(PropertyDef {
            owner,
            flags: PropertyAttributes::empty(),
            name: name.to_string(),
            property_type,
            getter: Some(getter),
            setter: None,
            custom_attributes: Vec::new(),
        });
        Ok(field)
    }

    fn finish(mut self) -> Result<Module> {
        let with_bodies: Vec<MethodId> = (0..self.module.methods.len())
            .map(MethodId::from_index)
            .filter(|id| self.module.method(*id).body.is_some())
            .collect();
        for id in with_bodies {
            finalize_body(&mut self.module, id)?;
        }
        Ok(self.module)
    }
}

/// Builds the complete support module.
pub(super) fn build() -> Result<Module> {
    let mut builder = SupportBuilder::new();
    let annotations = annotations::define(&mut builder)?;
    loader::define(&mut builder, &annotations)?;
    marshalers::define(&mut builder, &annotations)?;
    builder.finish()
}
