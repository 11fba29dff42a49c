//! Definitions owned by a module: types, methods, fields, properties and generic parameters.

use crate::metadata::{
    attributes::{
        FieldAttributes, GenericParamAttributes, MethodAttributes, MethodImplAttributes,
        ParamAttributes, PropertyAttributes, TypeAttributes,
    },
    body::MethodBody,
    customattributes::CustomAttribute,
    marshalling::MarshalInfo,
    pinvoke::PInvokeInfo,
    token::{FieldId, MethodId, PropertyId, TypeId},
    typesystem::{MethodSig, TypeSig},
};

/// A generic parameter of a type or method.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericParam {
    /// Zero based position
    pub number: u16,
    /// Variance and constraint flags
    pub flags: GenericParamAttributes,
    /// Parameter name
    pub name: String,
    /// Type constraints
    pub constraints: Vec<TypeSig>,
}

impl GenericParam {
    /// Creates an unconstrained parameter.
    #[must_use]
    pub fn new(number: u16, name: &str) -> Self {
        GenericParam {
            number,
            flags: GenericParamAttributes::empty(),
            name: name.to_string(),
            constraints: Vec::new(),
        }
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Type attributes
    pub flags: TypeAttributes,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Base type, `None` for interfaces and `System.Object`
    pub extends: Option<TypeSig>,
    /// Directly implemented interfaces
    pub interfaces: Vec<TypeSig>,
    /// Enclosing type of a nested type
    pub enclosing: Option<TypeId>,
    /// Nested types
    pub nested: Vec<TypeId>,
    /// Fields in declaration order
    pub fields: Vec<FieldId>,
    /// Methods in declaration order
    pub methods: Vec<MethodId>,
    /// Properties in declaration order
    pub properties: Vec<PropertyId>,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    /// Creates an empty type definition.
    #[must_use]
    pub fn new(namespace: &str, name: &str, flags: TypeAttributes, extends: Option<TypeSig>) -> Self {
        TypeDef {
            flags,
            namespace: namespace.to_string(),
            name: name.to_string(),
            extends,
            interfaces: Vec::new(),
            enclosing: None,
            nested: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            generic_params: Vec::new(),
            custom_attributes: Vec::new(),
        }
    }

    /// Returns `true` if the type is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeAttributes::INTERFACE)
    }
}

/// A parameter row.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    /// Parameter flags
    pub flags: ParamAttributes,
    /// Parameter name
    pub name: String,
    /// Marshal descriptor
    pub marshal: Option<MarshalInfo>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl ParamDef {
    /// Creates a plain parameter.
    #[must_use]
    pub fn new(name: &str) -> Self {
        ParamDef {
            flags: ParamAttributes::empty(),
            name: name.to_string(),
            marshal: None,
            custom_attributes: Vec::new(),
        }
    }

    /// Attaches a marshal descriptor.
    #[must_use]
    pub fn with_marshal(mut self, marshal: MarshalInfo) -> Self {
        self.flags |= ParamAttributes::HAS_FIELD_MARSHAL;
        self.marshal = Some(marshal);
        self
    }
}

/// The return slot of a method.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReturnParam {
    /// Marshal descriptor
    pub marshal: Option<MarshalInfo>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

/// A method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Declaring type
    pub owner: TypeId,
    /// Method attributes
    pub flags: MethodAttributes,
    /// Implementation attributes
    pub impl_flags: MethodImplAttributes,
    /// Method name
    pub name: String,
    /// Signature
    pub signature: MethodSig,
    /// One row per signature parameter
    pub params: Vec<ParamDef>,
    /// Return slot
    pub return_param: ReturnParam,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Native declaration descriptor
    pub pinvoke: Option<PInvokeInfo>,
    /// Body, `None` for abstract, runtime and native methods
    pub body: Option<MethodBody>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl MethodDef {
    /// Creates a method without body; parameter rows are named `arg0`, `arg1`, ...
    #[must_use]
    pub fn new(owner: TypeId, name: &str, flags: MethodAttributes, signature: MethodSig) -> Self {
        let params = (0..signature.params.len())
            .map(|i| ParamDef::new(&format!("arg{i}")))
            .collect();
        MethodDef {
            owner,
            flags,
            impl_flags: MethodImplAttributes::empty(),
            name: name.to_string(),
            signature,
            params,
            return_param: ReturnParam::default(),
            generic_params: Vec::new(),
            pinvoke: None,
            body: None,
            custom_attributes: Vec::new(),
        }
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// Returns `true` for a body-less method forwarded to a native library.
    #[must_use]
    pub fn is_foreign_declaration(&self) -> bool {
        self.body.is_none()
            && (self.flags.contains(MethodAttributes::PINVOKE_IMPL) || self.pinvoke.is_some())
    }

    /// Returns `true` for instance and type constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(MethodAttributes::RTSPECIAL_NAME)
            && (self.name == ".ctor" || self.name == ".cctor")
    }

    /// Index of the first signature parameter in the argument list.
    #[must_use]
    pub fn first_param_arg(&self) -> u16 {
        u16::from(self.signature.has_this && !self.signature.explicit_this)
    }
}

/// A field definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Declaring type
    pub owner: TypeId,
    /// Field attributes
    pub flags: FieldAttributes,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeSig,
    /// Marshal descriptor
    pub marshal: Option<MarshalInfo>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl FieldDef {
    /// Creates a field.
    #[must_use]
    pub fn new(owner: TypeId, name: &str, flags: FieldAttributes, field_type: TypeSig) -> Self {
        FieldDef {
            owner,
            flags,
            name: name.to_string(),
            field_type,
            marshal: None,
            custom_attributes: Vec::new(),
        }
    }
}

/// A property definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    /// Declaring type
    pub owner: TypeId,
    /// Property attributes
    pub flags: PropertyAttributes,
    /// Property name
    pub name: String,
    /// Property type
    pub property_type: TypeSig,
    /// Getter
    pub getter: Option<MethodId>,
    /// Setter
    pub setter: Option<MethodId>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}
