//! Image command - inspect, publish and delete images

use crate::catalog::ImageRecord;
use crate::cli::args::{ImageAction, ImageArgs, OutputFormat};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::constraint::DependencyList;
use crate::error::BuildEnvResult;
use crate::image::{ImageId, ImageMatch, ImagePool, ImageState};
use crate::lock::LockMode;
use crate::package::PackageFilter;
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::collections::BTreeSet;

/// Execute the image command
pub async fn execute(args: ImageArgs, config: &Config) -> BuildEnvResult<()> {
    let pool = ImagePool::new(Cluster::from_config(config));
    pool.init().await?;

    match args.action {
        ImageAction::List { format } => list(&pool, format).await,
        ImageAction::Find {
            requirements,
            format,
        } => find(&pool, &requirements, format).await,
        ImageAction::Packages { id } => packages(&pool, &id.parse()?).await,
        ImageAction::Publish { id } => publish(&pool, &id.parse()?).await,
        ImageAction::Unpublish { id } => unpublish(&pool, &id.parse()?).await,
        ImageAction::Delete { id } => delete(&pool, &id.parse()?).await,
    }
}

#[derive(Debug, Serialize)]
struct ImageRow {
    id: ImageId,
    state: ImageState,
    parent: Option<ImageId>,
    comment: Option<String>,
    packages: usize,
    created_at: DateTime<Utc>,
}

impl ImageRow {
    fn new(record: ImageRecord, published: &BTreeSet<ImageId>) -> Self {
        let state = if published.contains(&record.id) {
            ImageState::Published
        } else {
            ImageState::Private
        };
        Self {
            state,
            packages: record.packages.len(),
            id: record.id,
            parent: record.parent,
            comment: record.comment,
            created_at: record.created_at,
        }
    }
}

async fn list(pool: &ImagePool, format: OutputFormat) -> BuildEnvResult<()> {
    let published = pool.published().await?;
    let rows: Vec<ImageRow> = pool
        .list()
        .await?
        .into_iter()
        .map(|record| ImageRow::new(record, &published))
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}", row.id);
            }
        }
        OutputFormat::Table if rows.is_empty() => {
            println!("{}", style("No images").dim());
        }
        OutputFormat::Table => print_table(&rows),
    }
    Ok(())
}

fn print_table(rows: &[ImageRow]) {
    println!(
        "{:<38} {:<11} {:>8} {:<17} {}",
        style("ID").bold(),
        style("STATE").bold(),
        style("PACKAGES").bold(),
        style("CREATED").bold(),
        style("COMMENT").bold()
    );
    println!("{}", "-".repeat(90));

    for row in rows {
        let state = match row.state {
            ImageState::Published => style("published").green(),
            ImageState::Private => style("private").dim(),
        };
        println!(
            "{:<38} {:<11} {:>8} {:<17} {}",
            row.id,
            state,
            row.packages,
            row.created_at.format("%Y-%m-%d %H:%M").to_string(),
            row.comment.as_deref().unwrap_or("")
        );
    }

    println!();
    println!("{} image(s)", rows.len());
}

async fn find(pool: &ImagePool, requirements: &[String], format: OutputFormat) -> BuildEnvResult<()> {
    let requirements = DependencyList::from_requirements(requirements.iter().map(String::as_str))?;
    let found = pool.find_image(&requirements).await?;

    match (format, found) {
        (OutputFormat::Json, found) => println!("{}", serde_json::to_string_pretty(&found)?),
        (OutputFormat::Plain, Some(found)) => println!("{}", found.id),
        (OutputFormat::Plain, None) => {}
        (OutputFormat::Table, None) => println!("{}", style("No published images").dim()),
        (OutputFormat::Table, Some(found)) => print_match(&found),
    }
    Ok(())
}

fn print_match(found: &ImageMatch) {
    let verdict = if found.cost.is_exact() {
        style("exact").green()
    } else {
        style("partial").yellow()
    };
    println!("{} {} ({}, cost {})", style("Best:").bold(), found.id, verdict, found.cost);

    for key in &found.missing {
        println!("  {} {}", style("missing").red(), key);
    }
    for package in &found.disruptive {
        println!("  {} {}", style("conflict").red(), package);
    }
    for key in &found.extras {
        println!("  {} {}", style("extra").dim(), key);
    }
}

async fn packages(pool: &ImagePool, id: &ImageId) -> BuildEnvResult<()> {
    let image = pool.open(id, LockMode::Shared).await?;
    let packages = image.query_packages(&PackageFilter::default()).await?;
    image.close().await?;

    for package in packages {
        println!("{}", package);
    }
    Ok(())
}

async fn publish(pool: &ImagePool, id: &ImageId) -> BuildEnvResult<()> {
    let mut image = pool.open(id, LockMode::Exclusive).await?;
    image.publish().await?;
    image.close().await?;

    println!("{} Published {}", style("[OK]").green(), id);
    Ok(())
}

async fn unpublish(pool: &ImagePool, id: &ImageId) -> BuildEnvResult<()> {
    if pool.unpublish(id).await? {
        println!("{} Unpublished {}", style("[OK]").green(), id);
    } else {
        println!("{} {} was not published", style("[SKIP]").dim(), id);
    }
    Ok(())
}

async fn delete(pool: &ImagePool, id: &ImageId) -> BuildEnvResult<()> {
    if pool.delete(id).await? {
        println!("{} Deleted {}", style("[OK]").green(), id);
    } else {
        println!("{} {} does not exist", style("[SKIP]").dim(), id);
    }
    Ok(())
}
