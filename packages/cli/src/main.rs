#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `geoharvest` command-line entry point.
//!
//! Runs harvest requests described in TOML files and inspects the
//! endpoint registry. Logging goes through
//! [`geoharvest_cli_utils::init_logger`] so log lines and progress bars
//! share the terminal cleanly. Ctrl-C cancels a run at its next
//! checkpoint.

mod harvest;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use geoharvest_export::ExportFormat;
use geoharvest_service::registry::LayerKind;
use geoharvest_service::resolve::{EndpointQuery, EndpointResolver};

#[derive(Parser)]
#[command(name = "geoharvest", about = "Polygon harvester for WFS feature services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a harvest request
    Run {
        /// Request file (TOML)
        #[arg(long, short)]
        config: PathBuf,
        /// Output file, overriding `output.path`
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Output format (`shapefile`/`shp` or `flatgeobuf`/`fgb`),
        /// overriding `output.format`
        #[arg(long)]
        format: Option<ExportFormat>,
    },
    /// List the registered endpoints
    Endpoints {
        /// Only show this family (e.g. "prodes")
        #[arg(long)]
        family: Option<String>,
    },
    /// Resolve a dataset to its service URL and type name
    Resolve {
        /// Dataset family (e.g. "prodes")
        family: String,
        /// Region (e.g. "cerrado")
        region: String,
        /// Layer kind (e.g. "yearly")
        kind: LayerKind,
        /// Service URL overriding the registry
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = geoharvest_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            format,
        } => harvest::run(&multi, &config, output, format).await?,
        Commands::Endpoints { family } => list_endpoints(family.as_deref()),
        Commands::Resolve {
            family,
            region,
            kind,
            url,
        } => {
            let endpoint = EndpointResolver::builtin().resolve(&EndpointQuery {
                family,
                region,
                kind,
                url,
            })?;
            println!("url:        {}", endpoint.url);
            println!("type name:  {}", endpoint.type_name);
            if let Some(field) = &endpoint.year_field {
                println!("year field: {field}");
            }
            if let Some(field) = &endpoint.date_field {
                println!("date field: {field}");
            }
            if let Some(field) = &endpoint.class_field {
                println!("class:      {field}");
            }
            if let Some(crs) = endpoint.native_crs {
                println!("crs:        {crs}");
            }
        }
    }

    Ok(())
}

fn list_endpoints(family: Option<&str>) {
    let resolver = EndpointResolver::builtin();
    let definitions = resolver
        .definitions()
        .iter()
        .filter(|d| family.is_none_or(|f| d.family.eq_ignore_ascii_case(f)));

    println!("{:<12} {:<16} {:<14} URL", "FAMILY", "REGION", "KIND");
    let mut count = 0usize;
    for definition in definitions {
        println!(
            "{:<12} {:<16} {:<14} {}",
            definition.family,
            definition.entry.region,
            definition.entry.kind.as_ref(),
            definition.entry.url
        );
        count += 1;
    }
    println!();
    println!("{count} endpoints");
}
