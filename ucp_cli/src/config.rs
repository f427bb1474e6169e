use clap::{Args, Parser, Subcommand};
use libucp::ProgressMode;
use std::path::PathBuf;

/// Transport lifecycle tools.
///
/// Inspect the transport configuration and benchmark the in-process loopback engine.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the settings file. The default is `$HOME/.ucp/settings.yml`. A missing file means default settings.
    #[arg(long = "settings", short = 's', env = "UCP_CLI_SETTINGS", global = true)]
    pub settings_file: Option<PathBuf>,
    /// Let transport options set in the environment override the ones in the settings file.
    #[arg(long = "env-precedence", short = 'e', default_value_t = false, global = true)]
    pub env_precedence: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Print the transport engine version.
    #[command(name = "version")]
    Version,
    /// Print the effective transport configuration.
    #[command(name = "config", alias = "cfg")]
    Config(ConfigCommand),
    /// Run a ping-pong benchmark over a loopback connection.
    #[command(name = "bench")]
    Bench(BenchCommand),
}

#[derive(Debug, Args)]
pub struct ConfigCommand {
    /// Write the effective configuration to this settings file.
    #[arg(long = "save")]
    pub save: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BenchCommand {
    /// Message size in bytes.
    #[arg(long = "size", short = 'n', default_value_t = 4096)]
    pub size: usize,
    /// Number of round trips.
    #[arg(long = "iterations", short = 'i', default_value_t = 1000)]
    pub iterations: usize,
    /// Progress mode: manual, polling, notification or auto. Overrides the settings file.
    #[arg(long = "mode", short = 'm')]
    pub mode: Option<ProgressMode>,
    /// Print the report as JSON.
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

pub struct GlobalOptions {
    pub settings_file: Option<PathBuf>,
    pub env_precedence: bool,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions { settings_file: self.settings_file, env_precedence: self.env_precedence };
        (global, self.command)
    }
}
