mod app;
mod event;

use catalog_sync::{config, logging};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(about = "Offline-tolerant view of a remote document store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/catalog-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Follow a configured resource and print its state as JSON lines
  Watch { resource: String },
  /// Check connectivity to the remote store once
  Probe,
  /// Inspect or reset the fallback cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Print the cached payload (or the default) of a resource
  Show { resource: String },
  /// Remove one resource, or every resource when none is given
  Clear { resource: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let app = app::App::new(config)?;
  match args.command {
    Command::Watch { resource } => app.watch(&resource).await?,
    Command::Probe => app.probe().await?,
    Command::Cache { action } => match action {
      CacheAction::Show { resource } => app.cache_show(&resource)?,
      CacheAction::Clear { resource } => app.cache_clear(resource.as_deref())?,
    },
  }

  Ok(())
}
