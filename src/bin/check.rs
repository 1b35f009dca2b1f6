//! Schema Check CLI
//!
//! Runs the registry's compatibility checks on local schema files, without a
//! log or a running registry.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use schemalog::compatibility::previous_for_mode;
use schemalog::formats::{self, ParsedSchema};
use schemalog::{CompatibilityMode, NewSchema, RegistryConfig, SchemaFormat, Version};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-check")]
#[command(about = "Check schema files for compatibility the way the registry does")]
struct Cli {
    /// Config file (defaults to schemalog.toml lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a candidate against earlier versions, oldest first
    Compat {
        /// Candidate schema file
        candidate: PathBuf,
        /// Earlier versions, oldest first
        #[arg(required = true)]
        previous: Vec<PathBuf>,
        /// Compatibility mode (defaults to the configured one)
        #[arg(short, long)]
        mode: Option<CompatibilityMode>,
        /// Schema format (defaults to the file extension)
        #[arg(short, long)]
        format: Option<SchemaFormat>,
        /// Treat lints as breaking
        #[arg(long)]
        strict: bool,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the canonical form and fingerprint of a schema file
    Fingerprint {
        file: PathBuf,
        #[arg(short, long)]
        format: Option<SchemaFormat>,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

/// Returns whether the checked schemas passed.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = RegistryConfig::load_from(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Compat {
            candidate,
            previous,
            mode,
            format,
            strict,
            json,
        } => {
            let mode = mode.unwrap_or(config.registry.default_compatibility);
            let checker = config.checker().with_strict(strict || config.compatibility.strict);

            let (_, candidate_parsed) = load(&candidate, format)?;
            let mut parsed: Vec<(Version, ParsedSchema)> = Vec::with_capacity(previous.len());
            for (index, path) in previous.iter().enumerate() {
                let (_, schema) = load(path, format)?;
                parsed.push((Version::new(index as u32 + 1), schema));
            }
            let selected: Vec<(Version, &ParsedSchema)> = previous_for_mode(mode, &parsed)
                .iter()
                .map(|(version, schema)| (*version, schema))
                .collect();
            debug!(%mode, previous = selected.len(), "Checking candidate");

            let result = checker.check(&candidate_parsed, &selected, mode);
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(result.is_compatible);
            }

            println!("🔍 Checking {} under {}", candidate.display(), mode);
            for change in &result.changes {
                let marker = if change.is_breaking { "❌" } else { "✅" };
                let against = change.version.map(|v| format!(" (v{})", v)).unwrap_or_default();
                println!("  {} {}{}", marker, change.description, against);
            }
            println!();
            if result.is_compatible {
                println!("✅ Compatible");
            } else {
                println!("❌ Incompatible: {}", result.summary);
            }
            Ok(result.is_compatible)
        }

        Commands::Fingerprint { file, format } => {
            let (schema, _) = load(&file, format)?;
            println!("{}", schema.fingerprint);
            println!("{}", schema.text);
            Ok(true)
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(true)
        }
    }
}

fn load(path: &Path, format: Option<SchemaFormat>) -> anyhow::Result<(schemalog::Schema, ParsedSchema)> {
    let format = match format {
        Some(format) => format,
        None => format_for(path)?,
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    formats::prepare(&NewSchema::new(format, text), &[]).with_context(|| format!("parsing {}", path.display()))
}

fn format_for(path: &Path) -> anyhow::Result<SchemaFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("avsc") => Ok(SchemaFormat::Avro),
        Some("json") => Ok(SchemaFormat::Json),
        Some("proto") => Ok(SchemaFormat::Protobuf),
        _ => bail!("cannot tell the format of {}; pass --format", path.display()),
    }
}
