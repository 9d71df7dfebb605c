//! Scratch command - inspect and remove scratch spaces

use crate::cli::args::{OutputFormat, ScratchAction, ScratchArgs};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::error::BuildEnvResult;
use crate::scratch::ScratchSpacePool;
use console::style;

/// Execute the scratch command
pub async fn execute(args: ScratchArgs, config: &Config) -> BuildEnvResult<()> {
    let pool = ScratchSpacePool::new(Cluster::from_config(config));

    match args.action {
        ScratchAction::List { format } => list(&pool, format).await,
        ScratchAction::Snapshots { name } => snapshots(&pool, &name).await,
        ScratchAction::Delete { name } => delete(&pool, &name).await,
    }
}

async fn list(pool: &ScratchSpacePool, format: OutputFormat) -> BuildEnvResult<()> {
    let volumes = pool.list().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&volumes)?),
        OutputFormat::Plain => {
            for volume in &volumes {
                println!("{}", volume);
            }
        }
        OutputFormat::Table if volumes.is_empty() => {
            println!("{}", style("No scratch volumes").dim());
        }
        OutputFormat::Table => {
            println!("{}", style("VOLUME").bold());
            println!("{}", "-".repeat(70));
            for volume in &volumes {
                println!("{}", volume);
            }
            println!();
            println!("{} scratch volume(s)", volumes.len());
        }
    }
    Ok(())
}

async fn snapshots(pool: &ScratchSpacePool, name: &str) -> BuildEnvResult<()> {
    let space = pool.get_or_create(name, false, None).await?;
    let snapshots = space.list_snapshots().await?;
    space.close().await?;

    for snapshot in snapshots {
        println!("{}", snapshot);
    }
    Ok(())
}

async fn delete(pool: &ScratchSpacePool, name: &str) -> BuildEnvResult<()> {
    if pool.delete_scratch_space(name).await? {
        println!("{} Deleted scratch space {}", style("[OK]").green(), name);
    } else {
        println!("{} Scratch space {} does not exist", style("[SKIP]").dim(), name);
    }
    Ok(())
}
