use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vmcp",
    about = "Inspect vmcp machine checkpoint stores",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file with checkpoint settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Checkpoint directory (overrides the config file)
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

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
    /// List keys with a saved machine
    Keys,
    /// Show the snapshot saved under a key
    Machine(KeyArgs),
    /// Show a stored value and its reference count
    Value(ValueArgs),
    /// Show the range of saved versions
    Versions,
    /// Show one saved version
    Version(VersionArgs),
    /// List event chains
    Chains,
    /// Show an event chain and the state of each record
    Chain(KeyArgs),
}

#[derive(Args)]
pub struct KeyArgs {
    /// Key as UTF-8, or hex with a `0x` prefix
    pub key: String,
}

#[derive(Args)]
pub struct ValueArgs {
    /// 64-character hex hash
    pub hash: String,
}

#[derive(Args)]
pub struct VersionArgs {
    pub version: u64,
}
