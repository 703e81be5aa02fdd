//! Kiln CLI: inspection and verification tools for the kernel cache.
//!
//! Provides `kiln inspect` for dumping a cache metadata file, `kiln hash` for
//! printing the dependency digests of input files, and `kiln verify` for
//! checking whether a cached kernel is still valid for a set of sources.

#![warn(missing_docs)]

mod hash;
mod inspect;
mod project;
mod verify;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

/// Kiln: a persistent cache for compiled kernels.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln kernel cache tools")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Control colored output.
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Path to a custom `kiln.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode and print a `.info` metadata file.
    Inspect(InspectArgs),
    /// Print the SHA-1 digest of each file.
    Hash(HashArgs),
    /// Check whether a cached kernel is valid for the given sources.
    Verify(VerifyArgs),
}

/// Arguments for the `kiln inspect` subcommand.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Path to the `.info` file.
    pub info: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Arguments for the `kiln hash` subcommand.
#[derive(Parser, Debug)]
pub struct HashArgs {
    /// Files to hash.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Arguments for the `kiln verify` subcommand.
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Cache directory (default: `cache.dir` from `kiln.toml`).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Kernel name, the stem of its cache files.
    #[arg(long)]
    pub name: String,

    /// Source inputs, in the order they were compiled.
    #[arg(long = "source", required = true, num_args = 1..)]
    pub sources: Vec<PathBuf>,

    /// Output format for diagnostics.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Controls whether colored output is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    /// Detect from terminal capabilities.
    Auto,
    /// Always produce colored output.
    Always,
    /// Never produce colored output.
    Never,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to use colored output.
    pub color: bool,
    /// Optional path to a custom config file.
    pub config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let color = match cli.color {
        ColorChoice::Auto => std::env::var_os("TERM").is_some(),
        ColorChoice::Always => true,
        ColorChoice::Never => false,
    };

    let global = GlobalArgs {
        quiet: cli.quiet,
        color,
        config: cli.config,
    };

    let result = match cli.command {
        Command::Inspect(ref args) => inspect::run(args, &global),
        Command::Hash(ref args) => hash::run(args, &global),
        Command::Verify(ref args) => verify::run(args, &global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inspect_default() {
        let cli = Cli::parse_from(["kiln", "inspect", "cache/blur.info"]);
        match cli.command {
            Command::Inspect(ref args) => {
                assert_eq!(args.info, PathBuf::from("cache/blur.info"));
                assert_eq!(args.format, ReportFormat::Text);
            }
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn parse_inspect_json() {
        let cli = Cli::parse_from(["kiln", "inspect", "k.info", "--format", "json"]);
        match cli.command {
            Command::Inspect(ref args) => assert_eq!(args.format, ReportFormat::Json),
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn parse_hash_files() {
        let cli = Cli::parse_from(["kiln", "hash", "a.bc", "b.bc"]);
        match cli.command {
            Command::Hash(ref args) => {
                assert_eq!(args.files, vec![PathBuf::from("a.bc"), PathBuf::from("b.bc")]);
            }
            _ => panic!("expected Hash command"),
        }
    }

    #[test]
    fn hash_requires_files() {
        assert!(Cli::try_parse_from(["kiln", "hash"]).is_err());
    }

    #[test]
    fn parse_verify() {
        let cli = Cli::parse_from([
            "kiln",
            "verify",
            "--cache-dir",
            "/var/cache/kiln",
            "--name",
            "blur",
            "--source",
            "blur.bc",
            "common.bc",
        ]);
        match cli.command {
            Command::Verify(ref args) => {
                assert_eq!(args.cache_dir, Some(PathBuf::from("/var/cache/kiln")));
                assert_eq!(args.name, "blur");
                assert_eq!(args.sources.len(), 2);
                assert_eq!(args.format, ReportFormat::Text);
            }
            _ => panic!("expected Verify command"),
        }
    }

    #[test]
    fn verify_requires_name_and_source() {
        assert!(Cli::try_parse_from(["kiln", "verify", "--source", "a.bc"]).is_err());
        assert!(Cli::try_parse_from(["kiln", "verify", "--name", "blur"]).is_err());
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::parse_from([
            "kiln",
            "--quiet",
            "--color",
            "never",
            "--config",
            "/etc/kiln.toml",
            "hash",
            "a.bc",
        ]);
        assert!(cli.quiet);
        assert_eq!(cli.color, ColorChoice::Never);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/kiln.toml")));
    }

    #[test]
    fn parse_color_default_is_auto() {
        let cli = Cli::parse_from(["kiln", "hash", "a.bc"]);
        assert_eq!(cli.color, ColorChoice::Auto);
    }
}
