//! Selection of the declarations to rewrite.
//!
//! A [`FilterStrategy`] decides per type and per method whether the rewriter touches it. The
//! built-in [`FilterPolicy`] reads `ImportFilterAttribute(bool include)`; a method without its
//! own annotation takes the decision of its declaring type, and a nested type the decision of
//! its enclosing type.

use std::str::FromStr;

use strum::{Display, EnumString};

use crate::{
    interop::{IMPORT_FILTER_ATTRIBUTE, INTEROP_NAMESPACE},
    metadata::{
        customattributes::CustomAttribute,
        module::Module,
        token::{MethodId, TypeId},
    },
};

/// Something a filter decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Candidate {
    /// A type and, unless a method says otherwise, all its declarations
    Type(TypeId),
    /// A single declaration
    Method(MethodId),
}

/// Decides which candidates get rewritten.
///
/// Implementations must be shareable across the workers of a batch run.
pub trait FilterStrategy: Send + Sync {
    /// Returns `true` if `candidate` of `module` should be rewritten.
    fn filter(&self, module: &Module, candidate: Candidate) -> bool;
}

/// The annotation driven policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FilterPolicy {
    /// Rewrite everything, annotations are ignored
    All,
    /// Rewrite unless annotated `ImportFilter(false)`
    #[default]
    Exclude,
    /// Rewrite only if annotated `ImportFilter(true)`
    Include,
}

impl FilterPolicy {
    /// Parses a policy name as accepted on the command line.
    ///
    /// # Errors
    /// Returns [`crate::Error::Configuration`] for unknown names.
    pub fn parse(name: &str) -> crate::Result<Self> {
        FilterPolicy::from_str(name).map_err(|_| {
            crate::Error::Configuration(format!(
                "unknown filter policy '{name}', expected all, exclude or include"
            ))
        })
    }
}

/// The value of the first filter annotation in `attributes`.
fn annotation(module: &Module, attributes: &[CustomAttribute]) -> Option<bool> {
    module
        .attributes_of(attributes, INTEROP_NAMESPACE, IMPORT_FILTER_ATTRIBUTE)
        .find_map(|attribute| attribute.fixed_args.first().and_then(|arg| arg.as_bool()))
}

/// The nearest filter annotation on `candidate` or what encloses it.
fn inherited(module: &Module, candidate: Candidate) -> Option<bool> {
    match candidate {
        Candidate::Method(id) => {
            let method = module.method(id);
            annotation(module, &method.custom_attributes)
                .or_else(|| inherited(module, Candidate::Type(method.owner)))
        }
        Candidate::Type(id) => {
            let ty = module.ty(id);
            annotation(module, &ty.custom_attributes).or_else(|| {
                ty.enclosing
                    .and_then(|enclosing| inherited(module, Candidate::Type(enclosing)))
            })
        }
    }
}

impl FilterStrategy for FilterPolicy {
    fn filter(&self, module: &Module, candidate: Candidate) -> bool {
        match self {
            FilterPolicy::All => true,
            FilterPolicy::Exclude => inherited(module, candidate).unwrap_or(true),
            FilterPolicy::Include => inherited(module, candidate).unwrap_or(false),
        }
    }
}

impl<F> FilterStrategy for F
where
    F: Fn(&Module, Candidate) -> bool + Send + Sync,
{
    fn filter(&self, module: &Module, candidate: Candidate) -> bool {
        self(module, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::Support,
        metadata::{
            attributes::{MethodAttributes, TypeAttributes},
            customattributes::AttributeArgument,
            members::{MethodDef, TypeDef},
            references::MethodHandle,
            typesystem::{MethodSig, TypeSig},
        },
        Result,
    };

    struct Fixture {
        module: Module,
        plain: TypeId,
        excluded: TypeId,
        included: TypeId,
        nested: TypeId,
    }

    fn fixture() -> Result<Fixture> {
        let support = Support::builtin()?;
        let mut module = Module::new("App.dll", "App");
        let assembly = module.add_assembly_ref(support.assembly_ref());
        let attribute = module.add_type_ref(crate::metadata::references::TypeRef {
            scope: crate::metadata::references::ResolutionScope::Assembly(assembly),
            namespace: INTEROP_NAMESPACE.to_string(),
            name: IMPORT_FILTER_ATTRIBUTE.to_string(),
            is_value_type: false,
        });
        let ctor = module.method_on(
            &TypeSig::Ref(attribute),
            ".ctor",
            MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Boolean]),
        )?;
        let tagged = |include: bool, ctor: &MethodHandle| {
            CustomAttribute::new(ctor.clone(), vec![AttributeArgument::Bool(include)])
        };

        let plain = module.add_type(TypeDef::new("App", "Plain", TypeAttributes::PUBLIC, None));
        let mut def = TypeDef::new("App", "Excluded", TypeAttributes::PUBLIC, None);
        def.custom_attributes.push(tagged(false, &ctor));
        let excluded = module.add_type(def);
        let mut def = TypeDef::new("App", "Included", TypeAttributes::PUBLIC, None);
        def.custom_attributes.push(tagged(true, &ctor));
        let included = module.add_type(def);
        let mut def = TypeDef::new("", "Inner", TypeAttributes::NESTED_PUBLIC, None);
        def.enclosing = Some(excluded);
        let nested = module.add_type(def);

        let sig = MethodSig::new_static(TypeSig::Void, vec![]);
        let mut opted_in = MethodDef::new(excluded, "OptedIn", MethodAttributes::STATIC, sig.clone());
        opted_in.custom_attributes.push(tagged(true, &ctor));
        module.add_method(opted_in);
        module.add_method(MethodDef::new(excluded, "Inherits", MethodAttributes::STATIC, sig));
        Ok(Fixture {
            module,
            plain,
            excluded,
            included,
            nested,
        })
    }

    #[test]
    fn exclude_policy_truth_table() -> Result<()> {
        let f = fixture()?;
        let policy = FilterPolicy::Exclude;
        assert!(policy.filter(&f.module, Candidate::Type(f.plain)));
        assert!(policy.filter(&f.module, Candidate::Type(f.included)));
        assert!(!policy.filter(&f.module, Candidate::Type(f.excluded)));
        Ok(())
    }

    #[test]
    fn include_policy_truth_table() -> Result<()> {
        let f = fixture()?;
        let policy = FilterPolicy::Include;
        assert!(!policy.filter(&f.module, Candidate::Type(f.plain)));
        assert!(policy.filter(&f.module, Candidate::Type(f.included)));
        assert!(!policy.filter(&f.module, Candidate::Type(f.excluded)));
        Ok(())
    }

    #[test]
    fn members_inherit_unless_annotated() -> Result<()> {
        let f = fixture()?;
        let policy = FilterPolicy::Exclude;
        let opted_in = f.module.find_method(f.excluded, "OptedIn", None).map(Candidate::Method);
        let inherits = f.module.find_method(f.excluded, "Inherits", None).map(Candidate::Method);
        assert_eq!(opted_in.map(|c| policy.filter(&f.module, c)), Some(true));
        assert_eq!(inherits.map(|c| policy.filter(&f.module, c)), Some(false));
        assert!(!policy.filter(&f.module, Candidate::Type(f.nested)));
        Ok(())
    }

    #[test]
    fn all_ignores_annotations_and_closures_filter() -> Result<()> {
        let f = fixture()?;
        assert!(FilterPolicy::All.filter(&f.module, Candidate::Type(f.excluded)));
        let only_plain = |_: &Module, candidate: Candidate| candidate == Candidate::Type(TypeId(0));
        assert!(only_plain.filter(&f.module, Candidate::Type(f.plain)));
        assert!(!only_plain.filter(&f.module, Candidate::Type(f.included)));
        Ok(())
    }

    #[test]
    fn policies_parse_from_their_names() -> Result<()> {
        assert_eq!(FilterPolicy::parse("include")?, FilterPolicy::Include);
        assert_eq!(FilterPolicy::default().to_string(), "exclude");
        assert!(FilterPolicy::parse("some").is_err());
        Ok(())
    }
}
