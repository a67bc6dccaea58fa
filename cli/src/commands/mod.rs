//! CLI command definitions and dispatch.

mod run;
mod validate;

use std::collections::HashMap;

use clap::{Parser, Subcommand};

/// Imagetest — declarative test orchestration for container images.
#[derive(Parser)]
#[command(name = "imagetest", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run a test suite from a spec file
    Run(run::RunArgs),
    /// Parse and validate a spec file without running it
    Validate(validate::ValidateArgs),
}

/// Parse repeated `key=value` label arguments into a map.
pub(crate) fn parse_labels(
    pairs: &[String],
) -> Result<HashMap<String, String>, Box<dyn std::error::Error>> {
    let mut labels = HashMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                labels.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(format!(
                    "invalid label '{}': expected key=value",
                    pair
                )
                .into());
            }
        }
    }
    Ok(labels)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Validate(args) => validate::execute(args).await,
    }
}
