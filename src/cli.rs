use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "cachegate",
    about = "Checks a cachegate configuration and policy and prints the effective engine settings"
)]
pub struct Cli {
    /// Path to the settings file (defaults to ./cachegate.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Policy file to use instead of the one named in the settings file.
    #[arg(long)]
    pub policy: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
