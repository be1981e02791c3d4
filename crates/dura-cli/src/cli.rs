use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dura", about = "Drive the dura durable-object engine", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Walk one repository through close, cache, reopen, and expiry
    Scenario(ScenarioArgs),
    /// Churn many repositories from several threads
    Soak(SoakArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ScenarioArgs {
    #[arg(long, default_value_t = 5)]
    pub ttl_secs: u64,
    #[arg(long, default_value_t = 100)]
    pub updates: u64,
    /// Sleep past the deadline instead of cleaning with a later clock
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args)]
pub struct SoakArgs {
    #[arg(long, default_value_t = 4)]
    pub threads: usize,
    #[arg(long, default_value_t = 500)]
    pub iterations: usize,
    #[arg(long, default_value_t = 16)]
    pub repos: usize,
    /// Seed for the churn; random when absent
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Configuration file to read instead of the global `--config`
    #[arg(long)]
    pub path: Option<PathBuf>,
}
