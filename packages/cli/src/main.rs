#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Drivers and workers of the replication and bucket manifest jobs.
//!
//! Drivers (`replicate`, `bucket-manifest`, `bucket-replicate`) run on an
//! operator machine and submit jobs. Workers (`transfer`, `object-metadata`,
//! `bucket-copy`) run inside those jobs and read their parameters from the
//! environment the driver set.
//!
//! Uses `indicatif-log-bridge` (via [`replicator_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

mod bucket_manifest;
mod bucket_replicate;
mod replicate;
mod transfer;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "replicator",
    about = "Replicates data repository objects into S3 and builds bucket manifests"
)]
struct Cli {
    /// AWS region (defaults to the standard AWS configuration chain)
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one transfer job per manifest row and write outcome manifests
    Replicate(replicate::Args),
    /// Replicate one object (runs inside a transfer job)
    Transfer(transfer::Args),
    /// List a bucket, compute every object's MD5 through metadata jobs and
    /// upload a manifest
    BucketManifest(bucket_manifest::Args),
    /// Compute one object's MD5 and size (runs inside a metadata job)
    ObjectMetadata(bucket_manifest::WorkerArgs),
    /// Submit one copy job per object of a bucket or per copy manifest row
    BucketReplicate(bucket_replicate::Args),
    /// Copy one object between buckets (runs inside a copy job)
    BucketCopy(bucket_replicate::WorkerArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = replicator_cli_utils::init_logger();
    let cli = Cli::parse();

    let sdk_config = replicator_storage::load_sdk_config(cli.region.as_deref()).await;

    match cli.command {
        Commands::Replicate(args) => replicate::run(args, &sdk_config, &multi).await?,
        Commands::Transfer(args) => transfer::run(args, &sdk_config, &multi).await?,
        Commands::BucketManifest(args) => bucket_manifest::run(args, &sdk_config, &multi).await?,
        Commands::ObjectMetadata(args) => bucket_manifest::run_worker(args, &sdk_config).await?,
        Commands::BucketReplicate(args) => {
            bucket_replicate::run(args, &sdk_config, &multi).await?;
        }
        Commands::BucketCopy(args) => {
            bucket_replicate::run_worker(args, &sdk_config, &multi).await?;
        }
    }

    Ok(())
}
