use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use dotbind::{processor::BindingMode, FilterPolicy, RewriteConfig};

/// dotbind - rewrites native declarations of compiled modules into lazily bound call sites
#[derive(Debug, Parser)]
#[command(
    name = "dotbind",
    version,
    about,
    long_about = None,
    after_help = "Inputs and outputs are dotbind metadata images (.dbm), the serialized metadata \
                  graph of a module. PE/CLI assemblies are not read or written directly."
)]
pub struct Cli {
    /// Metadata images to rewrite. PE/CLI assemblies are rejected.
    #[arg(short = 'i', long = "input", value_name = "FILE", num_args = 1.., required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output paths, matched to the inputs by position. Inputs without one are rewritten in place.
    #[arg(short = 'o', long = "output", value_name = "FILE", num_args = 1..)]
    pub outputs: Vec<PathBuf>,

    /// Declaration filter: all, exclude or include.
    #[arg(long, default_value = "exclude")]
    pub filter: String,

    /// Reference the support assembly instead of embedding its types.
    #[arg(long)]
    pub no_embed: bool,

    /// Resolve every symbol in the static constructor instead of on first call.
    #[arg(long)]
    pub eager: bool,

    /// Support module image to use instead of the built-in one.
    #[arg(long, value_name = "FILE")]
    pub support: Option<PathBuf>,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// The `(input, output)` pairs to process.
    pub fn jobs(&self) -> anyhow::Result<Vec<(PathBuf, PathBuf)>> {
        if self.outputs.len() > self.inputs.len() {
            bail!(
                "{} output files given for {} input files",
                self.outputs.len(),
                self.inputs.len()
            );
        }
        Ok(self
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let output = self.outputs.get(index).unwrap_or(input);
                (input.clone(), output.clone())
            })
            .collect())
    }

    /// The rewrite configuration selected by the flags.
    pub fn config(&self) -> anyhow::Result<RewriteConfig> {
        let binding = if self.eager {
            BindingMode::Eager
        } else {
            BindingMode::Lazy
        };
        Ok(RewriteConfig::default()
            .with_filter(FilterPolicy::parse(&self.filter)?)
            .with_embed(!self.no_embed)
            .with_binding(binding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dotbind").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn outputs_default_to_the_inputs() {
        let cli = parse(&["-i", "a.dbm", "b.dbm", "-o", "a.out.dbm"]);
        let jobs = cli.jobs().unwrap();
        assert_eq!(
            jobs,
            vec![
                (PathBuf::from("a.dbm"), PathBuf::from("a.out.dbm")),
                (PathBuf::from("b.dbm"), PathBuf::from("b.dbm")),
            ]
        );
    }

    #[test]
    fn more_outputs_than_inputs_are_rejected() {
        let cli = parse(&["-i", "a.dbm", "-o", "x.dbm", "y.dbm"]);
        assert!(cli.jobs().is_err());
    }

    #[test]
    fn inputs_are_required() {
        assert!(Cli::try_parse_from(["dotbind", "--eager"]).is_err());
    }

    #[test]
    fn flags_map_onto_the_config() {
        let config = parse(&["-i", "a.dbm", "--no-embed", "--eager", "--filter", "include"])
            .config()
            .unwrap();
        assert!(!config.embed);
        assert_eq!(config.binding, BindingMode::Eager);

        let defaults = parse(&["-i", "a.dbm"]).config().unwrap();
        assert!(defaults.embed);
        assert_eq!(defaults.binding, BindingMode::Lazy);

        assert!(parse(&["-i", "a.dbm", "--filter", "some"]).config().is_err());
    }

    #[test]
    fn help_names_the_image_format() {
        use clap::CommandFactory;

        let help = Cli::command().render_help().to_string();
        assert!(help.contains("metadata images"));
        assert!(help.contains("PE/CLI"));
    }
}
