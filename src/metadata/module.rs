//! The in-memory module graph.
//!
//! A [`Module`] owns flat tables for every entity kind, addressed by the ids of
//! [`crate::metadata::token`]. Cross references inside the module are ids or
//! [`TypeSig`]/[`MethodHandle`]/[`crate::metadata::references::FieldHandle`] values, never
//! pointers, so the graph can be mutated in place by the cloner and the rewriter and then
//! written back as a whole.
//!
//! Besides plain accessors this module offers the lookup and import helpers everything else is
//! built on: identity lookups (namespace+name, enclosing+name, name+signature), deduplicating
//! imports of references, and signature queries over method handles.

use uguid::Guid;

use crate::{
    metadata::{
        customattributes::CustomAttribute,
        members::{FieldDef, MethodDef, PropertyDef, TypeDef},
        references::{
            AssemblyRef, MemberRef, MemberSig, MethodHandle, ModuleRef,
            ResolutionScope, TypeRef, Version,
        },
        token::{
            AssemblyRefId, FieldId, MemberRefId, MethodId, ModuleRefId, PropertyId, TypeId,
            TypeRefId,
        },
        typesystem::{MethodSig, TypeSig},
    },
    Error, Result,
};

/// Assembly names that identify the core library in a reference list.
pub const CORE_LIBRARY_NAMES: &[&str] = &[
    "System.Runtime",
    "System.Private.CoreLib",
    "netstandard",
    "mscorlib",
];

/// Identity of the assembly a module belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    /// Simple name
    pub name: String,
    /// Version
    pub version: Version,
}

/// A module and everything it defines and references.
#[derive(Debug, Clone)]
pub struct Module {
    /// Module file name
    pub name: String,
    /// Version identifier, regenerated on every successful rewrite
    pub mvid: Guid,
    /// Owning assembly, `None` for netmodules
    pub assembly: Option<AssemblyIdentity>,
    /// AssemblyRef table
    pub assembly_refs: Vec<AssemblyRef>,
    /// ModuleRef table
    pub module_refs: Vec<ModuleRef>,
    /// TypeRef table
    pub type_refs: Vec<TypeRef>,
    /// MemberRef table
    pub member_refs: Vec<MemberRef>,
    /// TypeDef table
    pub types: Vec<TypeDef>,
    /// MethodDef table
    pub methods: Vec<MethodDef>,
    /// Field table
    pub fields: Vec<FieldDef>,
    /// Property table
    pub properties: Vec<PropertyDef>,
    /// Assembly and module level custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

/// Namespace and name of a type, irrespective of whether it is defined or referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeName<'a> {
    /// Namespace, empty for nested types
    pub namespace: &'a str,
    /// Simple name
    pub name: &'a str,
}

impl TypeName<'_> {
    /// Returns `true` if this is `namespace.name`.
    #[must_use]
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl Default for Module {
    fn default() -> Self {
        Module {
            name: String::new(),
            mvid: Guid::ZERO,
            assembly: None,
            assembly_refs: Vec::new(),
            module_refs: Vec::new(),
            type_refs: Vec::new(),
            member_refs: Vec::new(),
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
            custom_attributes: Vec::new(),
        }
    }
}

impl Module {
    /// Creates an empty module belonging to assembly `assembly`.
    #[must_use]
    pub fn new(name: &str, assembly: &str) -> Self {
        Module {
            name: name.to_string(),
            assembly: Some(AssemblyIdentity {
                name: assembly.to_string(),
                version: Version::new(1, 0, 0, 0),
            }),
            ..Module::default()
        }
    }

    /// Name of the owning assembly, falling back to the module name.
    #[must_use]
    pub fn assembly_name(&self) -> &str {
        self.assembly
            .as_ref()
            .map_or(self.name.as_str(), |assembly| assembly.name.as_str())
    }

    /// Returns a type definition.
    #[must_use]
    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    /// Returns a type definition for modification.
    pub fn ty_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.index()]
    }

    /// Returns a method definition.
    #[must_use]
    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.index()]
    }

    /// Returns a method definition for modification.
    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDef {
        &mut self.methods[id.index()]
    }

    /// Returns a field definition.
    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.index()]
    }

    /// Returns a property definition.
    #[must_use]
    pub fn property(&self, id: PropertyId) -> &PropertyDef {
        &self.properties[id.index()]
    }

    /// Returns a type reference.
    #[must_use]
    pub fn type_ref(&self, id: TypeRefId) -> &TypeRef {
        &self.type_refs[id.index()]
    }

    /// Returns a member reference.
    #[must_use]
    pub fn member_ref(&self, id: MemberRefId) -> &MemberRef {
        &self.member_refs[id.index()]
    }

    /// Returns a module reference.
    #[must_use]
    pub fn module_ref(&self, id: ModuleRefId) -> &ModuleRef {
        &self.module_refs[id.index()]
    }

    /// Returns an assembly reference.
    #[must_use]
    pub fn assembly_ref(&self, id: AssemblyRefId) -> &AssemblyRef {
        &self.assembly_refs[id.index()]
    }

    /// Iterates over all type ids in definition order.
    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> {
        (0..self.types.len()).map(TypeId::from_index)
    }

    /// Adds a type; nested types are also linked into their enclosing type.
    pub fn add_type(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId::from_index(self.types.len());
        let enclosing = def.enclosing;
        self.types.push(def);
        if let Some(enclosing) = enclosing {
            self.types[enclosing.index()].nested.push(id);
        }
        id
    }

    /// Adds a method to `owner`.
    pub fn add_method(&mut self, mut def: MethodDef) -> MethodId {
        let id = MethodId::from_index(self.methods.len());
        let owner = def.owner;
        if def.params.len() < def.signature.params.len() {
            let missing = def.params.len()..def.signature.params.len();
            def.params.extend(
                missing.map(|i| crate::metadata::members::ParamDef::new(&format!("arg{i}"))),
            );
        }
        self.methods.push(def);
        self.types[owner.index()].methods.push(id);
        id
    }

    /// Adds a field to its owner.
    pub fn add_field(&mut self, def: FieldDef) -> FieldId {
        let id = FieldId::from_index(self.fields.len());
        let owner = def.owner;
        self.fields.push(def);
        self.types[owner.index()].fields.push(id);
        id
    }

    /// Adds a property to its owner.
    pub fn add_property(&mut self, def: PropertyDef) -> PropertyId {
        let id = PropertyId::from_index(self.properties.len());
        let owner = def.owner;
        self.properties.push(def);
        self.types[owner.index()].properties.push(id);
        id
    }

    /// Finds a top-level type by namespace and name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|def| def.enclosing.is_none() && def.namespace == namespace && def.name == name)
            .map(TypeId::from_index)
    }

    /// Finds a type nested directly in `enclosing` by name.
    #[must_use]
    pub fn find_nested(&self, enclosing: TypeId, name: &str) -> Option<TypeId> {
        self.ty(enclosing)
            .nested
            .iter()
            .copied()
            .find(|id| self.ty(*id).name == name)
    }

    /// Finds a method of `owner` by name and, if given, exact signature.
    #[must_use]
    pub fn find_method(&self, owner: TypeId, name: &str, sig: Option<&MethodSig>) -> Option<MethodId> {
        self.ty(owner).methods.iter().copied().find(|id| {
            let method = self.method(*id);
            method.name == name && sig.map_or(true, |sig| &method.signature == sig)
        })
    }

    /// Finds a method of `owner` by name and parameter shape, ignoring the return type.
    #[must_use]
    pub fn find_method_by_params(
        &self,
        owner: TypeId,
        name: &str,
        has_this: bool,
        params: &[TypeSig],
    ) -> Option<MethodId> {
        self.ty(owner).methods.iter().copied().find(|id| {
            let method = self.method(*id);
            method.name == name
                && method.signature.has_this == has_this
                && method.signature.params == params
        })
    }

    /// Returns all methods of `owner` with the given name, in declaration order.
    #[must_use]
    pub fn methods_named(&self, owner: TypeId, name: &str) -> Vec<MethodId> {
        self.ty(owner)
            .methods
            .iter()
            .copied()
            .filter(|id| self.method(*id).name == name)
            .collect()
    }

    /// Finds a field of `owner` by name.
    #[must_use]
    pub fn find_field(&self, owner: TypeId, name: &str) -> Option<FieldId> {
        self.ty(owner)
            .fields
            .iter()
            .copied()
            .find(|id| self.field(*id).name == name)
    }

    /// Finds a property of `owner` by name.
    #[must_use]
    pub fn find_property(&self, owner: TypeId, name: &str) -> Option<PropertyId> {
        self.ty(owner)
            .properties
            .iter()
            .copied()
            .find(|id| self.property(*id).name == name)
    }

    /// Returns the static constructor of `owner`.
    #[must_use]
    pub fn static_constructor(&self, owner: TypeId) -> Option<MethodId> {
        self.ty(owner)
            .methods
            .iter()
            .copied()
            .find(|id| self.method(*id).name == ".cctor" && self.method(*id).is_static())
    }

    /// Fully qualified name of a type definition, nested types joined with `/`.
    #[must_use]
    pub fn type_full_name(&self, id: TypeId) -> String {
        let def = self.ty(id);
        match def.enclosing {
            Some(enclosing) => format!("{}/{}", self.type_full_name(enclosing), def.name),
            None if def.namespace.is_empty() => def.name.clone(),
            None => format!("{}.{}", def.namespace, def.name),
        }
    }

    /// Fully qualified name of a type reference.
    #[must_use]
    pub fn type_ref_full_name(&self, id: TypeRefId) -> String {
        let tr = self.type_ref(id);
        match tr.scope {
            ResolutionScope::Nested(enclosing) => {
                format!("{}/{}", self.type_ref_full_name(enclosing), tr.name)
            }
            _ if tr.namespace.is_empty() => tr.name.clone(),
            _ => format!("{}.{}", tr.namespace, tr.name),
        }
    }

    /// Display form of a signature, used in diagnostics.
    #[must_use]
    pub fn sig_name(&self, sig: &TypeSig) -> String {
        match sig {
            TypeSig::Def(id) => self.type_full_name(*id),
            TypeSig::Ref(id) => self.type_ref_full_name(*id),
            TypeSig::Ptr(inner) => format!("{}*", self.sig_name(inner)),
            TypeSig::ByRef(inner) => format!("{}&", self.sig_name(inner)),
            TypeSig::Pinned(inner) => format!("{} pinned", self.sig_name(inner)),
            TypeSig::SzArray(inner) => format!("{}[]", self.sig_name(inner)),
            TypeSig::ModOpt { modifier, inner } => {
                format!("{} modopt({})", self.sig_name(inner), self.sig_name(modifier))
            }
            TypeSig::ModReq { modifier, inner } => {
                format!("{} modreq({})", self.sig_name(inner), self.sig_name(modifier))
            }
            TypeSig::GenericInst { generic, args, .. } => {
                let args: Vec<String> = args.iter().map(|arg| self.sig_name(arg)).collect();
                format!("{}<{}>", self.sig_name(generic), args.join(","))
            }
            TypeSig::Var(n) => format!("!{n}"),
            TypeSig::MVar(n) => format!("!!{n}"),
            TypeSig::FnPtr(_) => "method*".to_string(),
            primitive => format!("{primitive:?}").to_lowercase(),
        }
    }

    /// `Owner::Name` display form of a method definition.
    #[must_use]
    pub fn method_full_name(&self, id: MethodId) -> String {
        let method = self.method(id);
        format!("{}::{}", self.type_full_name(method.owner), method.name)
    }

    /// Namespace and name of a defined, referenced or instantiated type.
    #[must_use]
    pub fn type_name(&self, sig: &TypeSig) -> Option<TypeName<'_>> {
        match sig.unmodified() {
            TypeSig::Def(id) => {
                let def = self.ty(*id);
                Some(TypeName {
                    namespace: &def.namespace,
                    name: &def.name,
                })
            }
            TypeSig::Ref(id) => {
                let tr = self.type_ref(*id);
                Some(TypeName {
                    namespace: &tr.namespace,
                    name: &tr.name,
                })
            }
            TypeSig::GenericInst { generic, .. } => self.type_name(generic),
            _ => None,
        }
    }

    /// The assembly a type reference ultimately resolves into.
    #[must_use]
    pub fn type_ref_assembly(&self, id: TypeRefId) -> Option<AssemblyRefId> {
        match self.type_ref(id).scope {
            ResolutionScope::Assembly(assembly) => Some(assembly),
            ResolutionScope::Nested(enclosing) => self.type_ref_assembly(enclosing),
            ResolutionScope::Module(_) | ResolutionScope::CurrentModule => None,
        }
    }

    /// The defining type of a definition or of an instantiation of one.
    #[must_use]
    pub fn local_definition(&self, sig: &TypeSig) -> Option<TypeId> {
        match sig.unmodified() {
            TypeSig::Def(id) => Some(*id),
            TypeSig::GenericInst { generic, .. } => self.local_definition(generic),
            _ => None,
        }
    }

    /// Returns `true` if `sig` denotes a value type.
    #[must_use]
    pub fn is_value_type(&self, sig: &TypeSig) -> bool {
        match sig.unmodified() {
            TypeSig::String
            | TypeSig::Object
            | TypeSig::SzArray(_)
            | TypeSig::ByRef(_)
            | TypeSig::Var(_)
            | TypeSig::MVar(_)
            | TypeSig::Void => false,
            TypeSig::Def(id) => self.ty(*id).extends.as_ref().is_some_and(|base| {
                self.type_name(base).is_some_and(|name| {
                    name.is("System", "ValueType") || name.is("System", "Enum")
                })
            }),
            TypeSig::Ref(id) => self.type_ref(*id).is_value_type,
            TypeSig::GenericInst { value_type, .. } => *value_type,
            _ => true,
        }
    }

    /// Adds an assembly reference, reusing an existing one with the same name.
    pub fn add_assembly_ref(&mut self, reference: AssemblyRef) -> AssemblyRefId {
        if let Some(index) = self
            .assembly_refs
            .iter()
            .position(|existing| existing.name == reference.name)
        {
            return AssemblyRefId::from_index(index);
        }
        self.assembly_refs.push(reference);
        AssemblyRefId::from_index(self.assembly_refs.len() - 1)
    }

    /// Finds an assembly reference by name.
    #[must_use]
    pub fn find_assembly_ref(&self, name: &str) -> Option<AssemblyRefId> {
        self.assembly_refs
            .iter()
            .position(|existing| existing.name == name)
            .map(AssemblyRefId::from_index)
    }

    /// Adds a module reference, reusing an existing one with the same name.
    pub fn add_module_ref(&mut self, name: &str) -> ModuleRefId {
        if let Some(index) = self.module_refs.iter().position(|m| m.name == name) {
            return ModuleRefId::from_index(index);
        }
        self.module_refs.push(ModuleRef {
            name: name.to_string(),
        });
        ModuleRefId::from_index(self.module_refs.len() - 1)
    }

    /// Adds a type reference, reusing an existing one with the same scope and name.
    pub fn add_type_ref(&mut self, reference: TypeRef) -> TypeRefId {
        if let Some(index) = self.type_refs.iter().position(|existing| {
            existing.scope == reference.scope
                && existing.namespace == reference.namespace
                && existing.name == reference.name
        }) {
            if reference.is_value_type {
                self.type_refs[index].is_value_type = true;
            }
            return TypeRefId::from_index(index);
        }
        self.type_refs.push(reference);
        TypeRefId::from_index(self.type_refs.len() - 1)
    }

    /// Adds a member reference, reusing an identical one.
    pub fn add_member_ref(&mut self, reference: MemberRef) -> MemberRefId {
        if let Some(index) = self
            .member_refs
            .iter()
            .position(|existing| *existing == reference)
        {
            return MemberRefId::from_index(index);
        }
        self.member_refs.push(reference);
        MemberRefId::from_index(self.member_refs.len() - 1)
    }

    /// The core library reference, added if no known core library is referenced yet.
    pub fn core_library(&mut self) -> AssemblyRefId {
        for name in CORE_LIBRARY_NAMES {
            if let Some(id) = self.find_assembly_ref(name) {
                return id;
            }
        }
        self.add_assembly_ref(AssemblyRef::new("System.Runtime", Version::new(8, 0, 0, 0)))
    }

    /// Imports a type of the core library.
    pub fn core_type(&mut self, namespace: &str, name: &str, is_value_type: bool) -> TypeSig {
        let scope = ResolutionScope::Assembly(self.core_library());
        TypeSig::Ref(self.add_type_ref(TypeRef {
            scope,
            namespace: namespace.to_string(),
            name: name.to_string(),
            is_value_type,
        }))
    }

    /// Returns a handle for `name` on `parent`.
    ///
    /// Methods of non-generic local definitions are addressed directly; everything else gets a
    /// member reference.
    ///
    /// # Errors
    /// Returns [`Error::MemberNotFound`] if `parent` is a local definition without matching
    /// method.
    pub fn method_on(&mut self, parent: &TypeSig, name: &str, sig: MethodSig) -> Result<MethodHandle> {
        if let TypeSig::Def(owner) = parent {
            return self
                .find_method(*owner, name, Some(&sig))
                .map(MethodHandle::Def)
                .ok_or_else(|| Error::MemberNotFound {
                    owner: self.type_full_name(*owner),
                    member: name.to_string(),
                });
        }
        Ok(MethodHandle::Ref(self.add_member_ref(MemberRef {
            parent: parent.clone(),
            name: name.to_string(),
            signature: MemberSig::Method(sig),
        })))
    }

    /// Signature of the method a handle addresses, with method type arguments bound.
    #[must_use]
    pub fn method_sig(&self, handle: &MethodHandle) -> Option<MethodSig> {
        match handle {
            MethodHandle::Def(id) => Some(self.method(*id).signature.clone()),
            MethodHandle::Ref(id) => self.member_ref(*id).method_sig().cloned(),
            MethodHandle::Spec { method, args } => {
                self.method_sig(method).map(|sig| sig.substitute(&[], args))
            }
        }
    }

    /// Name of the method a handle addresses.
    #[must_use]
    pub fn method_name(&self, handle: &MethodHandle) -> Option<&str> {
        match handle.open() {
            MethodHandle::Def(id) => Some(&self.method(*id).name),
            MethodHandle::Ref(id) => Some(&self.member_ref(*id).name),
            MethodHandle::Spec { .. } => None,
        }
    }

    /// Declaring type of the method a handle addresses.
    #[must_use]
    pub fn method_parent(&self, handle: &MethodHandle) -> Option<TypeSig> {
        match handle.open() {
            MethodHandle::Def(id) => Some(TypeSig::Def(self.method(*id).owner)),
            MethodHandle::Ref(id) => Some(self.member_ref(*id).parent.clone()),
            MethodHandle::Spec { .. } => None,
        }
    }

    /// Type name of the attribute class a custom attribute instantiates.
    #[must_use]
    pub fn attribute_type(&self, attribute: &CustomAttribute) -> Option<TypeName<'_>> {
        match attribute.constructor.open() {
            MethodHandle::Def(id) => {
                let owner = self.ty(self.method(*id).owner);
                Some(TypeName {
                    namespace: &owner.namespace,
                    name: &owner.name,
                })
            }
            MethodHandle::Ref(id) => self.type_name(&self.member_ref(*id).parent),
            MethodHandle::Spec { .. } => None,
        }
    }

    /// Finds custom attributes of class `namespace.name` in `attributes`.
    pub fn attributes_of<'a>(
        &'a self,
        attributes: &'a [CustomAttribute],
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a CustomAttribute> + 'a {
        attributes.iter().filter(move |attribute| {
            self.attribute_type(attribute)
                .is_some_and(|ty| ty.is(namespace, name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{attributes::TypeAttributes, members::TypeDef};

    #[test]
    fn nested_types_are_linked_and_named() {
        let mut module = Module::new("Test.dll", "Test");
        let outer = module.add_type(TypeDef::new("Ns", "Outer", TypeAttributes::PUBLIC, None));
        let mut inner = TypeDef::new("", "Inner", TypeAttributes::NESTED_PUBLIC, None);
        inner.enclosing = Some(outer);
        let inner = module.add_type(inner);

        assert_eq!(module.ty(outer).nested, vec![inner]);
        assert_eq!(module.type_full_name(inner), "Ns.Outer/Inner");
        assert_eq!(module.find_type("Ns", "Outer"), Some(outer));
        assert_eq!(module.find_type("", "Inner"), None);
        assert_eq!(module.find_nested(outer, "Inner"), Some(inner));
    }

    #[test]
    fn references_are_deduplicated() {
        let mut module = Module::new("Test.dll", "Test");
        let a = module.core_type("System", "Object", false);
        let b = module.core_type("System", "Object", false);
        assert_eq!(a, b);
        assert_eq!(module.assembly_refs.len(), 1);
        assert_eq!(module.add_module_ref("libc"), module.add_module_ref("libc"));

        let sig = MethodSig::new_instance(TypeSig::Void, vec![]);
        let first = module.method_on(&a, ".ctor", sig.clone());
        let second = module.method_on(&a, ".ctor", sig);
        assert_eq!(first.ok(), second.ok());
        assert_eq!(module.member_refs.len(), 1);
    }

    #[test]
    fn value_types_follow_the_base_type() {
        let mut module = Module::new("Test.dll", "Test");
        let value_type = module.core_type("System", "ValueType", false);
        let object = module.core_type("System", "Object", false);
        let s = module.add_type(TypeDef::new("Ns", "S", TypeAttributes::PUBLIC, Some(value_type)));
        let c = module.add_type(TypeDef::new("Ns", "C", TypeAttributes::PUBLIC, Some(object)));
        assert!(module.is_value_type(&TypeSig::Def(s)));
        assert!(!module.is_value_type(&TypeSig::Def(c)));
        assert!(module.is_value_type(&TypeSig::I));
        assert!(!module.is_value_type(&TypeSig::String));
    }
}
