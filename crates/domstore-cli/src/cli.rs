use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "domstore",
    about = "domstore -- inspect and edit origin-partitioned key-value storage",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Database directory. Overrides `directory` from the config file.
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// TOML file holding a context configuration.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print raw database rows
    Dump(DumpArgs),
    /// List recorded (namespace, origin, map) bindings
    Usage,
    /// Read a key from an area
    Get(GetArgs),
    /// Write a key into an area
    Put(PutArgs),
    /// Copy a namespace, sharing its maps
    CloneNamespace(CloneNamespaceArgs),
    /// Delete a namespace and release its maps
    DeleteNamespace(DeleteNamespaceArgs),
    /// Check the database for schema and metadata problems
    Verify,
}

#[derive(Args)]
pub struct DumpArgs {
    /// Only rows whose key starts with this prefix
    #[arg(short, long, default_value = "")]
    pub prefix: String,
    /// Print keys and values as hex
    #[arg(long)]
    pub hex: bool,
}

/// Selects an area by persistent namespace id and origin.
#[derive(Args)]
pub struct AreaArgs {
    /// Persistent namespace id (`local` for the local namespace)
    #[arg(short, long, default_value = "local")]
    pub namespace: String,
    /// Origin owning the area, e.g. https://example.com
    #[arg(short, long)]
    pub origin: String,
}

#[derive(Args)]
pub struct GetArgs {
    #[command(flatten)]
    pub area: AreaArgs,
    /// Key to read; all keys when omitted
    pub key: Option<String>,
}

#[derive(Args)]
pub struct PutArgs {
    #[command(flatten)]
    pub area: AreaArgs,
    pub key: String,
    pub value: String,
    /// Source tag delivered to observers
    #[arg(long, default_value = "domstore-cli")]
    pub source: String,
}

#[derive(Args)]
pub struct CloneNamespaceArgs {
    /// Persistent id of the namespace to copy
    pub source: String,
    /// Persistent id of the new namespace
    pub target: String,
}

#[derive(Args)]
pub struct DeleteNamespaceArgs {
    pub namespace: String,
}
