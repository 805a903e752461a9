use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;

use aur_native::{ManifestUnit, Target};

#[derive(Parser)]
#[command(name = "aur-native")]
#[command(about = "Aurora manifest to native x86-64 executable assembler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    Linux,
    Windows,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Linux => Target::Linux,
            TargetArg::Windows => Target::Windows,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a textual manifest (.aurs) into a native executable.
    Assemble {
        #[arg(help = "Input manifest file")]
        input: PathBuf,

        #[arg(short, long, help = "Output executable path")]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "linux")]
        target: TargetArg,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Assemble {
            input,
            output,
            target,
        } => {
            let text = fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let unit = ManifestUnit::parse(&text)
                .with_context(|| format!("Failed to parse manifest {}", input.display()))?;
            let image = aur_native::assemble(&unit, target.into())
                .context("Encoding failed")?;
            fs::write(&output, &image)
                .with_context(|| format!("Failed to write output to {}", output.display()))?;
            println!(
                "Assembled {} -> {} ({} bytes)",
                input.display(),
                output.display(),
                image.len()
            );
        }
    }

    Ok(())
}
