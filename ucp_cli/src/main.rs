mod bench;
mod config;
mod error;
mod settings;

use crate::bench::{run_bench, BenchOptions};
use crate::config::{BenchCommand, CliCommand, Config, ConfigCommand, GlobalOptions};
use crate::settings::{load_or_default, Settings};
use clap::Parser;
use log::*;
use tokio::task::LocalSet;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let config: Config = Config::parse();
    let (global_options, command) = config.to_parts();

    // Transport contexts are single-threaded, so everything runs on one LocalSet.
    let local = LocalSet::new();
    let result = local
        .run_until(async move {
            match command {
                CliCommand::Version => exec_version(),
                CliCommand::Config(cmd) => exec_config(cmd, global_options),
                CliCommand::Bench(cmd) => exec_bench(cmd, global_options).await,
            }
        })
        .await;

    if let Err(err) = result {
        eprintln!("** Error ** \n {err}");
        std::process::exit(1);
    }
}

fn exec_version() -> Result<(), anyhow::Error> {
    let version = libucp::get_version()?;
    println!("ucp {} (transport engine {version})", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn exec_config(cmd: ConfigCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_or_default(options.settings_file.as_ref())?;
    let effective = if settings.options.is_empty() {
        libucp::get_config()?
    } else {
        // Explicit options can only be validated by creating a context with them.
        libucp::init(settings.options.clone(), options.env_precedence)?;
        let effective = libucp::get_config();
        libucp::reset()?;
        effective?
    };
    let mut keys: Vec<_> = effective.keys().collect();
    keys.sort();
    for key in keys {
        println!("{key} = {}", effective[key]);
    }
    if let Some(path) = cmd.save {
        let saved = Settings { progress_mode: settings.progress_mode, options: effective };
        saved.save(&path)?;
        println!("Configuration saved to {}", path.display());
    }
    Ok(())
}

async fn exec_bench(cmd: BenchCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_or_default(options.settings_file.as_ref())?;
    let opts = BenchOptions {
        size: cmd.size,
        iterations: cmd.iterations,
        mode: cmd.mode.unwrap_or(settings.progress_mode),
        options: settings.options,
        env_precedence: options.env_precedence,
    };
    info!("Starting benchmark");
    let report = run_bench(opts).await?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}
