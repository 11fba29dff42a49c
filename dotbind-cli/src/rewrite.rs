use anyhow::{bail, Context};
use dotbind::{rewrite_files, Support};

use crate::app::Cli;

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let jobs = cli.jobs()?;
    for (input, _) in &jobs {
        if !input.is_file() {
            bail!("input file not found: {}", input.display());
        }
    }
    let config = cli.config()?;
    let support = match &cli.support {
        Some(path) => Support::from_file(path)
            .with_context(|| format!("failed to load support module: {}", path.display()))?,
        None => Support::builtin().context("failed to build the support module")?,
    };

    let results = rewrite_files(&jobs, &support, &config);
    let mut failed = 0;
    for ((input, output), result) in jobs.iter().zip(results) {
        match result {
            Ok(report) => log::debug!(
                "{} -> {}: {} declarations, {} marshaled slots",
                input.display(),
                output.display(),
                report.declarations,
                report.marshaled_slots
            ),
            Err(error) => {
                failed += 1;
                log::error!("{}: {error}", input.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} modules failed to rewrite", jobs.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use dotbind::prelude::*;

    use super::*;

    fn write_app(path: &std::path::Path) -> dotbind::Result<()> {
        let mut module = Module::new("App.dll", "App");
        let object = module.core_type("System", "Object", false);
        let owner = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, Some(object)));
        let library = module.add_module_ref("libc.so.6");
        let mut def = MethodDef::new(
            owner,
            "getpid",
            (MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL).with_access(MemberAccess::Public),
            MethodSig::new_static(TypeSig::I4, vec![]),
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
    fn rewrites_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("App.dbm");
        write_app(&input)?;
        let before = std::fs::read(&input)?;

        let cli = Cli::try_parse_from(["dotbind", "-i", input.to_str().unwrap_or_default()])?;
        run(&cli)?;
        assert_ne!(std::fs::read(&input)?, before);
        let module = Module::from_file(&input)?;
        assert!(module.find_type("DotBind.Interop", "LibLoader").is_some());
        Ok(())
    }

    #[test]
    fn missing_inputs_fail_without_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("missing.dbm");
        let output = dir.path().join("out.dbm");
        let cli = Cli::try_parse_from([
            "dotbind",
            "-i",
            input.to_str().unwrap_or_default(),
            "-o",
            output.to_str().unwrap_or_default(),
        ])?;
        assert!(run(&cli).is_err());
        assert!(!output.exists());
        Ok(())
    }

    #[test]
    fn compiled_assemblies_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("App.dll");
        let mut dos = vec![0u8; 0x80];
        dos[..2].copy_from_slice(b"MZ");
        std::fs::write(&input, &dos)?;
        let cli = Cli::try_parse_from(["dotbind", "-i", input.to_str().unwrap_or_default()])?;
        assert!(run(&cli).is_err());
        assert_eq!(std::fs::read(&input)?, dos);
        let error = Module::from_file(&input).err().map(|e| e.to_string());
        assert!(error.is_some_and(|message| message.contains("PE/CLI")));
        Ok(())
    }

    #[test]
    fn unreadable_images_fail() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("garbage.dbm");
        std::fs::write(&input, b"not a module image")?;
        let output = dir.path().join("out.dbm");
        let cli = Cli::try_parse_from([
            "dotbind",
            "-i",
            input.to_str().unwrap_or_default(),
            "-o",
            output.to_str().unwrap_or_default(),
        ])?;
        assert!(run(&cli).is_err());
        assert!(!output.exists());
        Ok(())
    }
}
