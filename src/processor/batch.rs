//! File level drivers.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::{
    interop::Support,
    metadata::module::Module,
    processor::{ModuleProcessor, RewriteConfig, RewriteReport},
    Result,
};

/// Reads the module image at `input`, rewrites it and writes the result to `output`.
///
/// `input` and `output` may be the same path. Nothing is written unless the rewrite succeeds.
///
/// # Errors
/// Read, decode, rewrite and write failures.
pub fn rewrite_file(input: &Path, output: &Path, support: &Support, config: &RewriteConfig) -> Result<RewriteReport> {
    let mut module = Module::from_file(input)?;
    let report = ModuleProcessor::new(support, config).process(&mut module)?;
    module.write_to(output)?;
    log::debug!("{} -> {}", input.display(), output.display());
    Ok(report)
}

/// Rewrites several `(input, output)` pairs in parallel, one module per worker.
///
/// Every pair succeeds or fails on its own; the results are in the order of `jobs`.
pub fn rewrite_files(jobs: &[(PathBuf, PathBuf)], support: &Support, config: &RewriteConfig) -> Vec<Result<RewriteReport>> {
    jobs.par_iter()
        .map(|(input, output)| rewrite_file(input, output, support, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            attributes::{MemberAccess, MethodAttributes, TypeAttributes},
            members::{MethodDef, TypeDef},
            pinvoke::{PInvokeAttributes, PInvokeInfo},
            typesystem::{MethodSig, TypeSig},
        },
        Error,
    };

    fn write_app(path: &Path) -> Result<()> {
        let mut module = Module::new("App.dll", "App");
        let object = module.core_type("System", "Object", false);
        let owner = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, Some(object)));
        let library = module.add_module_ref("libm.so.6");
        let mut def = MethodDef::new(
            owner,
            "cos",
            (MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL).with_access(MemberAccess::Public),
            MethodSig::new_static(TypeSig::R8, vec![TypeSig::R8]),
        );
        def.pinvoke = Some(PInvokeInfo {
            flags: PInvokeAttributes::CALL_CONV_CDECL,
            entry_point: None,
            module: library,
        });
        module.add_method(def);
        module.write_to(path)
    }

    #[test]
    fn rewritten_images_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("App.dbm");
        let output = dir.path().join("App.out.dbm");
        write_app(&input)?;

        let support = Support::builtin()?;
        let report = rewrite_file(&input, &output, &support, &RewriteConfig::default())?;
        assert_eq!(report.declarations, 1);

        let reloaded = Module::from_file(&output)?;
        let owner = reloaded.find_type("App", "Native");
        assert!(owner.is_some_and(|owner| reloaded.find_field(owner, "_<cos_fnptr>").is_some()));
        Ok(())
    }

    #[test]
    fn batches_report_per_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let good = dir.path().join("good.dbm");
        write_app(&good)?;
        let jobs = vec![
            (good.clone(), good.clone()),
            (dir.path().join("missing.dbm"), dir.path().join("missing.out.dbm")),
        ];

        let support = Support::builtin()?;
        let results = rewrite_files(&jobs, &support, &RewriteConfig::eager());
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], Ok(report) if report.declarations == 1));
        assert!(matches!(&results[1], Err(Error::FileError(_))));
        assert!(!dir.path().join("missing.out.dbm").exists());
        Ok(())
    }
}
