//! Module and batch drivers.
//!
//! [`ModuleProcessor`] runs the whole pipeline over one module: it embeds the support types
//! (or references the support assembly), lets the [`crate::filter::FilterStrategy`] pick the
//! declarations of every type, hands them to the [`crate::rewriter::Rewriter`], prunes the
//! references nothing uses any more and derives a fresh `mvid`. The work happens on a copy, so
//! a failure leaves the caller's module untouched. [`rewrite_file`] and [`rewrite_files`] add
//! image input and output on top.

mod batch;
mod config;
mod embed;

use sha1::{Digest, Sha1};
use uguid::Guid;

pub use batch::{rewrite_file, rewrite_files};
pub use config::RewriteConfig;
pub use embed::retarget_support_refs;
pub use crate::rewriter::BindingMode;

use crate::{
    filter::Candidate,
    interop::{Imports, Support, INTEROP_NAMESPACE},
    marshal::Injector,
    metadata::{
        module::Module,
        token::{MethodId, TypeId},
        walk::{prune_references, PruneStats},
    },
    rewriter::{Rewriter, TypeReport},
    Result,
};

/// What rewriting one module produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Declarations rewritten
    pub declarations: usize,
    /// Types that had at least one declaration rewritten
    pub types: usize,
    /// Load routines synthesized
    pub libraries: usize,
    /// Parameter and return slots with an inlined marshaler
    pub marshaled_slots: usize,
    /// Declarations left alone by the filter or because they are instance methods
    pub skipped: usize,
    /// Top-level support types embedded
    pub embedded_types: usize,
    /// Support references pointed at embedded definitions
    pub retargeted_refs: usize,
    /// References removed after rewriting
    pub pruned: PruneStats,
}

impl RewriteReport {
    fn add_type(&mut self, report: TypeReport) {
        if report.declarations > 0 {
            self.types += 1;
        }
        self.declarations += report.declarations;
        self.libraries += report.libraries;
        self.marshaled_slots += report.marshaled_slots;
    }

    /// Returns `true` if nothing was rewritten.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.declarations == 0
    }
}

/// Drives the rewrite of single modules against one support module.
pub struct ModuleProcessor<'a> {
    support: &'a Support,
    config: &'a RewriteConfig,
}

impl<'a> ModuleProcessor<'a> {
    /// Creates a processor.
    #[must_use]
    pub fn new(support: &'a Support, config: &'a RewriteConfig) -> Self {
        ModuleProcessor { support, config }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &RewriteConfig {
        self.config
    }

    /// Rewrites `module` in place.
    ///
    /// # Errors
    /// Any cloning, rewriting, marshaling or verification failure. `module` is only replaced
    /// once every step has succeeded.
    pub fn process(&self, module: &mut Module) -> Result<RewriteReport> {
        let mut work = module.clone();
        let mut report = RewriteReport::default();

        let mut imports = Imports::new(self.support, self.config.embed);
        if self.config.embed {
            report.embedded_types = imports.embed_all(&mut work)?;
            report.retargeted_refs = retarget_support_refs(self.support, &mut work);
        }

        let selected = self.select(&work, &mut report);
        let injector = Injector::new(&imports, &work);
        let mut rewriter = Rewriter::new(imports, injector, self.config.binding);
        for (owner, declarations) in selected {
            report.add_type(rewriter.rewrite_type(&mut work, owner, &declarations)?);
        }

        let removable: &[&str] = if self.config.embed {
            &[self.support.assembly_name()]
        } else {
            &[]
        };
        report.pruned = prune_references(&mut work, removable);
        work.mvid = regenerate_mvid(&work)?;

        log::info!(
            "{}: rewrote {} declarations in {} types ({} skipped, {} libraries)",
            work.name,
            report.declarations,
            report.types,
            report.skipped,
            report.libraries
        );
        *module = work;
        Ok(report)
    }

    /// The declarations to rewrite, grouped by declaring type in definition order.
    fn select(&self, module: &Module, report: &mut RewriteReport) -> Vec<(TypeId, Vec<MethodId>)> {
        let filter = self.config.filter.as_ref();
        let mut selected = Vec::new();
        for owner in module.type_ids() {
            if in_support_namespace(module, owner) {
                continue;
            }
            let ty = module.ty(owner);
            let foreign: Vec<MethodId> = ty
                .methods
                .iter()
                .copied()
                .filter(|id| module.method(*id).is_foreign_declaration())
                .collect();
            if foreign.is_empty() {
                continue;
            }
            if !filter.filter(module, Candidate::Type(owner)) {
                report.skipped += foreign.len();
                continue;
            }

            let mut declarations = Vec::with_capacity(foreign.len());
            for id in foreign {
                let method = module.method(id);
                if !method.is_static() {
                    log::warn!(
                        "{}: instance native declarations are not rewritten",
                        module.method_full_name(id)
                    );
                    report.skipped += 1;
                } else if filter.filter(module, Candidate::Method(id)) {
                    declarations.push(id);
                } else {
                    report.skipped += 1;
                }
            }
            if !declarations.is_empty() {
                selected.push((owner, declarations));
            }
        }
        selected
    }
}

/// Returns `true` for the support types and everything nested in them.
fn in_support_namespace(module: &Module, mut id: TypeId) -> bool {
    while let Some(enclosing) = module.ty(id).enclosing {
        id = enclosing;
    }
    module.ty(id).namespace == INTEROP_NAMESPACE
}

/// A name based (version 5) GUID over the encoded module and its previous `mvid`.
///
/// # Errors
/// Returns the encoding failure of [`Module::to_bytes`].
pub fn regenerate_mvid(module: &Module) -> Result<Guid> {
    let mut hasher = Sha1::new();
    hasher.update(module.mvid.to_bytes());
    hasher.update(module.to_bytes()?);
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[7] = (bytes[7] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Ok(Guid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterPolicy,
        interop::{IMPORT_FILTER_ATTRIBUTE, LIB_LOADER},
        metadata::{
            attributes::{MemberAccess, MethodAttributes, MethodImplAttributes, TypeAttributes},
            customattributes::{AttributeArgument, CustomAttribute},
            members::{MethodDef, TypeDef},
            pinvoke::{PInvokeAttributes, PInvokeInfo},
            typesystem::{MethodSig, TypeSig},
        },
        verify::verify_body,
    };

    fn declare(module: &mut Module, owner: TypeId, name: &str, library: &str, is_static: bool) -> MethodId {
        let library = module.add_module_ref(library);
        let mut flags = (MethodAttributes::HIDE_BY_SIG | MethodAttributes::PINVOKE_IMPL).with_access(MemberAccess::Public);
        if is_static {
            flags |= MethodAttributes::STATIC;
        }
        let sig = if is_static {
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4])
        } else {
            MethodSig::new_instance(TypeSig::I4, vec![TypeSig::I4])
        };
        let mut def = MethodDef::new(owner, name, flags, sig);
        def.impl_flags = MethodImplAttributes::PRESERVE_SIG;
        def.pinvoke = Some(PInvokeInfo {
            flags: PInvokeAttributes::CALL_CONV_CDECL,
            entry_point: None,
            module: library,
        });
        module.add_method(def)
    }

    fn app() -> (Module, TypeId) {
        let mut module = Module::new("App.dll", "App");
        let object = module.core_type("System", "Object", false);
        let owner = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, Some(object)));
        declare(&mut module, owner, "abs", "libapp", true);
        declare(&mut module, owner, "labs", "libapp", true);
        (module, owner)
    }

    fn verify_all(module: &Module) -> Result<()> {
        for method in &module.methods {
            if let Some(body) = &method.body {
                verify_body(module, method, body)?;
            }
        }
        Ok(())
    }

    #[test]
    fn embedded_rewrites_are_self_contained() -> Result<()> {
        let support = Support::builtin()?;
        let (mut module, owner) = app();
        let before = module.mvid;

        let config = RewriteConfig::default();
        let report = ModuleProcessor::new(&support, &config).process(&mut module)?;
        assert_eq!(report.declarations, 2);
        assert_eq!(report.types, 1);
        assert_eq!(report.libraries, 1);
        assert!(report.embedded_types > 0);

        assert!(module.find_assembly_ref(support.assembly_name()).is_none());
        assert!(module.find_type(INTEROP_NAMESPACE, LIB_LOADER).is_some());
        assert!(!module.module_refs.iter().any(|m| m.name == "libapp"));
        assert!(module
            .ty(owner)
            .methods
            .iter()
            .all(|id| !module.method(*id).is_foreign_declaration()));
        assert_ne!(module.mvid, before);
        verify_all(&module)
    }

    #[test]
    fn referencing_mode_keeps_the_support_assembly() -> Result<()> {
        let support = Support::builtin()?;
        let (mut module, _) = app();
        let config = RewriteConfig::eager().with_embed(false);
        let report = ModuleProcessor::new(&support, &config).process(&mut module)?;
        assert_eq!(report.declarations, 2);
        assert_eq!(report.embedded_types, 0);
        assert!(module.find_assembly_ref(support.assembly_name()).is_some());
        assert!(module.find_type(INTEROP_NAMESPACE, LIB_LOADER).is_none());
        verify_all(&module)
    }

    #[test]
    fn filtered_and_instance_declarations_are_skipped() -> Result<()> {
        let support = Support::builtin()?;
        let (mut module, owner) = app();
        let instance = declare(&mut module, owner, "get", "libapp", false);

        let object = module.core_type("System", "Object", false);
        let hidden = module.add_type(TypeDef::new("App", "Hidden", TypeAttributes::PUBLIC, Some(object)));
        let untouched = declare(&mut module, hidden, "hidden", "libhidden", true);
        let mut imports = Imports::new(&support, false);
        let attribute = imports.ty(&mut module, IMPORT_FILTER_ATTRIBUTE)?;
        let ctor = module.method_on(&attribute, ".ctor", MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Boolean]))?;
        module
            .ty_mut(hidden)
            .custom_attributes
            .push(CustomAttribute::new(ctor, vec![AttributeArgument::Bool(false)]));

        let config = RewriteConfig::default().with_filter(FilterPolicy::Exclude);
        let report = ModuleProcessor::new(&support, &config).process(&mut module)?;
        assert_eq!(report.declarations, 2);
        assert_eq!(report.skipped, 2);
        assert!(module.method(instance).is_foreign_declaration());
        assert!(module.method(untouched).is_foreign_declaration());
        assert!(module.module_refs.iter().any(|m| m.name == "libhidden"));
        Ok(())
    }

    #[test]
    fn failures_leave_the_module_untouched() -> Result<()> {
        let support = Support::builtin()?;
        let (mut module, owner) = app();
        let broken = declare(&mut module, owner, "broken", "libapp", true);
        if let Some(info) = module.method_mut(broken).pinvoke.as_mut() {
            info.flags = 0x0600;
        }
        let before = module.to_bytes()?;

        let config = RewriteConfig::default();
        assert!(ModuleProcessor::new(&support, &config).process(&mut module).is_err());
        assert_eq!(module.to_bytes()?, before);
        Ok(())
    }

    #[test]
    fn mvids_are_versioned_and_deterministic() -> Result<()> {
        let (module, _) = app();
        let first = regenerate_mvid(&module)?;
        assert_eq!(first, regenerate_mvid(&module)?);
        let bytes = first.to_bytes();
        assert_eq!(bytes[7] >> 4, 5);
        assert_eq!(bytes[8] & 0xc0, 0x80);
        Ok(())
    }
}
