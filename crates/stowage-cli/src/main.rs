use std::{path::Path, sync::Arc};

use clap::Parser;
use cli::{Args, Commands};
use events::LogSink;
use logging::setup_logging;
use nu_ansi_term::Color::{Cyan, Green};
use serde_json::Value;
use stowage_config::{
    config::{config_path, generate_default_config, Config},
    error::ConfigError,
};
use stowage_core::{
    error::{ErrorContext, StoreError},
    storage::{PackageStorage, StorageEngine},
    StoreResult,
};
use stowage_events::EventSinkHandle;
use stowage_operations::{
    add_version, publish_package, remove_tarball, un_publish_package, upload_package_tarball,
    Outcome,
};
use stowage_utils::path::resolve_path;
use tracing::{debug, info};
use utils::{read_json, set_color, Colored};

mod cli;
mod events;
mod logging;
mod utils;

async fn handle_cli() -> StoreResult<()> {
    let args = Args::parse();

    setup_logging(&args);

    if args.no_color {
        set_color(false);
    }

    let config_file = match args.config {
        Some(ref path) => resolve_path(path).map_err(ConfigError::from)?,
        None => config_path(),
    };
    debug!("using config file {}", config_file.display());

    match args.command {
        Commands::DefConfig => {
            generate_default_config(&config_file)?;
            return Ok(());
        }
        Commands::Env => {
            let config = Config::load(&config_file)?;
            info!("STOWAGE_CONFIG={}", config_file.display());
            info!("STOWAGE_STORAGE={}", config.get_storage_path()?.display());
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(&config_file)?;
    let events: EventSinkHandle = Arc::new(LogSink);
    let engine = StorageEngine::open(&config, events).await?;

    let outcome = match args.command {
        Commands::DefConfig | Commands::Env => return Ok(()),
        Commands::Publish {
            manifest,
            name,
            rev,
        } => {
            let body = read_json(&manifest)?;
            let name = match name {
                Some(name) => name,
                None => manifest_name(&body, &manifest)?,
            };
            publish_package(&engine, &name, body, rev.as_deref()).await?
        }
        Commands::AddVersion {
            package,
            pkg_version,
            metadata,
            tag,
        } => {
            let body = read_json(&metadata)?;
            add_version(&engine, &package, &pkg_version, body, &tag).await?
        }
        Commands::Upload {
            package,
            tarball,
            filename,
        } => {
            let filename = match filename {
                Some(filename) => filename,
                None => {
                    tarball
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .ok_or_else(|| {
                            StoreError::InvalidFilename {
                                filename: tarball.display().to_string(),
                                reason: "path has no file name",
                            }
                        })?
                }
            };
            let inbound = tokio::fs::File::open(&tarball)
                .await
                .with_context(|| format!("opening {}", tarball.display()))?;
            upload_package_tarball(&engine, &package, &filename, inbound).await?
        }
        Commands::RmTarball {
            package,
            filename,
            rev,
        } => remove_tarball(&engine, &package, &filename, &rev).await?,
        Commands::Unpublish { package } => un_publish_package(&engine, &package).await?,
        Commands::Show { package } => {
            let document = engine.get_package(&package).await?;
            println!("{}", serde_json::to_string_pretty(&document)?);
            return Ok(());
        }
        Commands::Recover => {
            let removed = engine.recover().await?;
            info!(
                "Removed {} leftover file(s) from {}",
                Colored(Cyan, removed),
                engine.root().display()
            );
            return Ok(());
        }
    };

    report(&outcome, args.json)
}

/// Falls back to the manifest's own `name` when none is given on the command line.
fn manifest_name(body: &Value, manifest: &Path) -> StoreResult<String> {
    body.get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            StoreError::BadPackageData(format!(
                "{} has no package name; pass --name",
                manifest.display()
            ))
        })
}

fn report(outcome: &Outcome, json: bool) -> StoreResult<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
    } else {
        info!(
            "{} ({})",
            Colored(Green, outcome.message()),
            outcome.status.code()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    if let Err(err) = handle_cli().await {
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(1);
    }
}
