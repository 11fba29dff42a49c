//! Translation of signatures, handles and references into the destination.

use crate::{
    cloner::Cloner,
    metadata::{
        customattributes::{AttributeArgument, CustomAttribute, NamedArgument},
        marshalling::{CustomMarshalerSpec, MarshalInfo},
        module::Module,
        references::{FieldHandle, MemberRef, MemberSig, MethodHandle, ResolutionScope, TypeRef},
        token::{MemberRefId, MethodId, TypeId, TypeRefId},
        typesystem::{MethodSig, TypeSig},
    },
    Error, Result,
};

impl Cloner<'_> {
    /// Translates a type signature, cloning or referencing the definitions it names.
    pub(crate) fn import_sig(&mut self, dest: &mut Module, sig: &TypeSig) -> Result<TypeSig> {
        Ok(match sig {
            TypeSig::Def(id) => self.ensure_type(dest, *id)?,
            TypeSig::Ref(id) => self.import_type_ref(dest, *id)?,
            TypeSig::Ptr(inner) => TypeSig::Ptr(Box::new(self.import_sig(dest, inner)?)),
            TypeSig::ByRef(inner) => TypeSig::ByRef(Box::new(self.import_sig(dest, inner)?)),
            TypeSig::Pinned(inner) => TypeSig::Pinned(Box::new(self.import_sig(dest, inner)?)),
            TypeSig::SzArray(inner) => TypeSig::SzArray(Box::new(self.import_sig(dest, inner)?)),
            TypeSig::ModOpt { modifier, inner } => TypeSig::ModOpt {
                modifier: Box::new(self.import_sig(dest, modifier)?),
                inner: Box::new(self.import_sig(dest, inner)?),
            },
            TypeSig::ModReq { modifier, inner } => TypeSig::ModReq {
                modifier: Box::new(self.import_sig(dest, modifier)?),
                inner: Box::new(self.import_sig(dest, inner)?),
            },
            TypeSig::GenericInst {
                generic,
                args,
                value_type,
            } => {
                let generic = Box::new(self.import_sig(dest, generic)?);
                let mut imported = Vec::with_capacity(args.len());
                for arg in args {
                    imported.push(self.import_sig(dest, arg)?);
                }
                TypeSig::GenericInst {
                    generic,
                    args: imported,
                    value_type: *value_type,
                }
            }
            TypeSig::FnPtr(method) => TypeSig::FnPtr(Box::new(self.import_method_sig(dest, method)?)),
            primitive => primitive.clone(),
        })
    }

    pub(crate) fn import_method_sig(&mut self, dest: &mut Module, sig: &MethodSig) -> Result<MethodSig> {
        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            params.push(self.import_sig(dest, param)?);
        }
        Ok(MethodSig {
            ret: self.import_sig(dest, &sig.ret)?,
            params,
            ..sig.clone()
        })
    }

    fn import_type_ref(&mut self, dest: &mut Module, id: TypeRefId) -> Result<TypeSig> {
        if let Some(sig) = self.type_refs.get(&id) {
            return Ok(sig.clone());
        }
        let source = self.source;
        let reference = source.type_ref(id);
        let sig = match reference.scope {
            ResolutionScope::Nested(enclosing) => match self.import_type_ref(dest, enclosing)? {
                TypeSig::Def(outer) => dest
                    .find_nested(outer, &reference.name)
                    .map(TypeSig::Def)
                    .ok_or_else(|| Error::TypeNotFound(source.type_ref_full_name(id)))?,
                TypeSig::Ref(outer) => TypeSig::Ref(dest.add_type_ref(TypeRef {
                    scope: ResolutionScope::Nested(outer),
                    ..reference.clone()
                })),
                other => other,
            },
            ResolutionScope::CurrentModule => {
                let local = source
                    .find_type(&reference.namespace, &reference.name)
                    .ok_or_else(|| Error::TypeNotFound(source.type_ref_full_name(id)))?;
                self.ensure_type(dest, local)?
            }
            ResolutionScope::Assembly(assembly) if source.assembly_ref(assembly).name == dest.assembly_name() => {
                dest.find_type(&reference.namespace, &reference.name)
                    .map(TypeSig::Def)
                    .ok_or_else(|| Error::TypeNotFound(source.type_ref_full_name(id)))?
            }
            ResolutionScope::Assembly(assembly) => {
                let assembly = dest.add_assembly_ref(source.assembly_ref(assembly).clone());
                TypeSig::Ref(dest.add_type_ref(TypeRef {
                    scope: ResolutionScope::Assembly(assembly),
                    ..reference.clone()
                }))
            }
            ResolutionScope::Module(_) => {
                let assembly = self.source_assembly(dest);
                TypeSig::Ref(dest.add_type_ref(TypeRef {
                    scope: ResolutionScope::Assembly(assembly),
                    ..reference.clone()
                }))
            }
        };
        self.type_refs.insert(id, sig.clone());
        Ok(sig)
    }

    /// Translates a method handle.
    pub(crate) fn import_method(&mut self, dest: &mut Module, handle: &MethodHandle) -> Result<MethodHandle> {
        match handle {
            MethodHandle::Def(id) => self.ensure_method(dest, *id),
            MethodHandle::Ref(id) => match self.import_member_ref(dest, *id)? {
                Imported::Method(handle) => Ok(handle),
                Imported::Field(_) => Err(Error::Error(format!(
                    "{} is a field used as a method",
                    self.source.member_ref(*id).name
                ))),
            },
            MethodHandle::Spec { method, args } => {
                let method = Box::new(self.import_method(dest, method)?);
                let mut imported = Vec::with_capacity(args.len());
                for arg in args {
                    imported.push(self.import_sig(dest, arg)?);
                }
                Ok(MethodHandle::Spec {
                    method,
                    args: imported,
                })
            }
        }
    }

    /// Translates a field handle.
    pub(crate) fn import_field(&mut self, dest: &mut Module, handle: FieldHandle) -> Result<FieldHandle> {
        match handle {
            FieldHandle::Def(id) => self.ensure_field(dest, id),
            FieldHandle::Ref(id) => match self.import_member_ref(dest, id)? {
                Imported::Field(handle) => Ok(handle),
                Imported::Method(_) => Err(Error::Error(format!(
                    "{} is a method used as a field",
                    self.source.member_ref(id).name
                ))),
            },
        }
    }

    fn import_member_ref(&mut self, dest: &mut Module, id: MemberRefId) -> Result<Imported> {
        let source = self.source;
        let reference = source.member_ref(id);

        // members of plain source definitions go through the definition memo
        if let TypeSig::Def(owner) = &reference.parent {
            return match &reference.signature {
                MemberSig::Method(sig) => {
                    let method = unique_method(source, *owner, &reference.name, sig)?;
                    Ok(Imported::Method(self.ensure_method(dest, method)?))
                }
                MemberSig::Field(_) => {
                    let field = source.find_field(*owner, &reference.name).ok_or_else(|| {
                        Error::MemberNotFound {
                            owner: source.type_full_name(*owner),
                            member: reference.name.clone(),
                        }
                    })?;
                    Ok(Imported::Field(self.ensure_field(dest, field)?))
                }
            };
        }

        let parent = self.import_sig(dest, &reference.parent)?;
        let signature = match &reference.signature {
            MemberSig::Method(sig) => MemberSig::Method(self.import_method_sig(dest, sig)?),
            MemberSig::Field(ty) => MemberSig::Field(self.import_sig(dest, ty)?),
        };

        if let TypeSig::Def(owner) = &parent {
            return match &signature {
                MemberSig::Method(sig) => Ok(Imported::Method(MethodHandle::Def(unique_method(
                    dest,
                    *owner,
                    &reference.name,
                    sig,
                )?))),
                MemberSig::Field(_) => dest
                    .find_field(*owner, &reference.name)
                    .map(|field| Imported::Field(FieldHandle::Def(field)))
                    .ok_or_else(|| Error::MemberNotFound {
                        owner: dest.type_full_name(*owner),
                        member: reference.name.clone(),
                    }),
            };
        }

        let is_method = matches!(signature, MemberSig::Method(_));
        let added = dest.add_member_ref(MemberRef {
            parent,
            name: reference.name.clone(),
            signature,
        });
        Ok(if is_method {
            Imported::Method(MethodHandle::Ref(added))
        } else {
            Imported::Field(FieldHandle::Ref(added))
        })
    }

    pub(crate) fn clone_attributes(
        &mut self,
        dest: &mut Module,
        attributes: &[CustomAttribute],
    ) -> Result<Vec<CustomAttribute>> {
        let mut cloned = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            cloned.push(self.clone_attribute(dest, attribute)?);
        }
        Ok(cloned)
    }

    /// Translates a custom attribute, including type-valued arguments.
    pub(crate) fn clone_attribute(&mut self, dest: &mut Module, attribute: &CustomAttribute) -> Result<CustomAttribute> {
        let constructor = self.import_method(dest, &attribute.constructor)?;
        let mut fixed_args = Vec::with_capacity(attribute.fixed_args.len());
        for arg in &attribute.fixed_args {
            fixed_args.push(self.clone_argument(dest, arg)?);
        }
        let mut named_args = Vec::with_capacity(attribute.named_args.len());
        for named in &attribute.named_args {
            named_args.push(NamedArgument {
                is_field: named.is_field,
                name: named.name.clone(),
                value: self.clone_argument(dest, &named.value)?,
            });
        }
        Ok(CustomAttribute {
            constructor,
            fixed_args,
            named_args,
        })
    }

    fn clone_argument(&mut self, dest: &mut Module, argument: &AttributeArgument) -> Result<AttributeArgument> {
        Ok(match argument {
            AttributeArgument::Type(Some(sig)) => AttributeArgument::Type(Some(self.import_sig(dest, sig)?)),
            AttributeArgument::Enum { enum_type, value } => AttributeArgument::Enum {
                enum_type: self.import_sig(dest, enum_type)?,
                value: *value,
            },
            AttributeArgument::Array(Some(items)) => {
                let mut cloned = Vec::with_capacity(items.len());
                for item in items {
                    cloned.push(self.clone_argument(dest, item)?);
                }
                AttributeArgument::Array(Some(cloned))
            }
            other => other.clone(),
        })
    }

    pub(crate) fn clone_marshal(&mut self, dest: &mut Module, marshal: Option<&MarshalInfo>) -> Result<Option<MarshalInfo>> {
        let Some(marshal) = marshal else {
            return Ok(None);
        };
        let custom = match &marshal.custom {
            Some(spec) => Some(CustomMarshalerSpec {
                marshaler: self.import_sig(dest, &spec.marshaler)?,
                cookie: spec.cookie.clone(),
            }),
            None => None,
        };
        Ok(Some(MarshalInfo {
            native_type: marshal.native_type,
            element_type: marshal.element_type,
            custom,
        }))
    }
}

enum Imported {
    Method(MethodHandle),
    Field(FieldHandle),
}

/// Finds the method of `owner` a reference names: exact signature first, then the unique
/// method with matching parameters.
fn unique_method(module: &Module, owner: TypeId, name: &str, sig: &MethodSig) -> Result<MethodId> {
    if let Some(exact) = module.find_method(owner, name, Some(sig)) {
        return Ok(exact);
    }
    let candidates: Vec<MethodId> = module
        .methods_named(owner, name)
        .into_iter()
        .filter(|id| {
            let candidate = &module.method(*id).signature;
            candidate.has_this == sig.has_this && candidate.params == sig.params
        })
        .collect();
    match candidates.as_slice() {
        [single] => Ok(*single),
        [] => Err(Error::MemberNotFound {
            owner: module.type_full_name(owner),
            member: name.to_string(),
        }),
        _ => Err(Error::AmbiguousMatch(format!(
            "{}::{name}",
            module.type_full_name(owner)
        ))),
    }
}
