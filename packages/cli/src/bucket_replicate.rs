//! `bucket-replicate` driver and `bucket-copy` worker commands.

use std::sync::Arc;
use std::time::Instant;

use aws_config::SdkConfig;
use replicator_cli_utils::{IndicatifProgress, MultiProgress};
use replicator_dispatch::bucket_replicate::{
    self, CopyJob, CopyJobConfig, CopyOutcome, copy_object, env,
};
use replicator_dispatch::replicate::ManifestSource;
use replicator_queue::BatchJobQueue;
use replicator_storage::{ObjectStore, S3Store};
use replicator_transfer::MultipartTransfer;

use crate::transfer::EngineArgs;

#[derive(clap::Args)]
pub struct Args {
    /// Bucket to copy from
    #[arg(long)]
    source_bucket: String,
    /// Only copy keys under this prefix (whole bucket copies)
    #[arg(long, default_value = "")]
    prefix: String,
    /// Bucket to copy every object to
    #[arg(long, required_unless_present = "manifest", conflicts_with = "manifest")]
    destination_bucket: Option<String>,
    /// Copy manifest with `project_id` and `url` columns (local path or
    /// `s3://bucket/key`)
    #[arg(long, requires = "mapping")]
    manifest: Option<String>,
    /// JSON map of `project_id` to destination bucket (local path or
    /// `s3://bucket/key`)
    #[arg(long, requires = "manifest")]
    mapping: Option<String>,
    /// Job queue receiving the copy jobs
    #[arg(long, env = "JOB_QUEUE")]
    job_queue: String,
    /// Job definition of the copy jobs
    #[arg(long, env = "JOB_DEFINITION")]
    job_definition: String,
    /// Jobs submitted concurrently
    #[arg(long, default_value_t = replicator_dispatch::dispatcher::DEFAULT_WORKERS)]
    workers: usize,
}

#[derive(clap::Args)]
pub struct WorkerArgs {
    /// Object key, the same in both buckets
    #[arg(long, env = env::KEY)]
    key: String,
    /// Bucket to copy from
    #[arg(long, env = env::SOURCE_BUCKET)]
    source_bucket: String,
    /// Bucket to copy to
    #[arg(long, env = env::DESTINATION_BUCKET)]
    destination_bucket: String,
    #[command(flatten)]
    engine: EngineArgs,
}

pub async fn run(
    args: Args,
    sdk_config: &SdkConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let store = S3Store::new(sdk_config);
    let jobs = BatchJobQueue::new(sdk_config);
    let config = CopyJobConfig {
        workers: args.workers,
        ..CopyJobConfig::new(&args.job_queue, &args.job_definition)
    };
    let progress = IndicatifProgress::records_bar(multi, "Submitting copy jobs");

    let summary = match (&args.destination_bucket, &args.manifest, &args.mapping) {
        (Some(destination), _, _) => {
            bucket_replicate::replicate_bucket(
                &store,
                &jobs,
                &config,
                &args.source_bucket,
                &args.prefix,
                destination,
                progress.as_ref(),
            )
            .await?
        }
        (None, Some(manifest), Some(mapping)) => {
            bucket_replicate::replicate_mapped(
                &store,
                &jobs,
                &config,
                &args.source_bucket,
                &ManifestSource::parse(manifest)?,
                &ManifestSource::parse(mapping)?,
                progress.as_ref(),
            )
            .await?
        }
        _ => {
            return Err("either --destination-bucket or --manifest with --mapping is required".into());
        }
    };

    log::info!(
        "Bucket replication of {} submitted in {:.1}s: {summary}",
        args.source_bucket,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

pub async fn run_worker(
    args: WorkerArgs,
    sdk_config: &SdkConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(sdk_config));
    let engine = MultipartTransfer::new(Arc::clone(&store), args.engine.config());
    let job = CopyJob {
        source_bucket: args.source_bucket,
        destination_bucket: args.destination_bucket,
        key: args.key,
    };
    let progress = IndicatifProgress::bytes_bar(multi, &job.key);

    match copy_object(store, &engine, &job, progress.as_ref()).await? {
        CopyOutcome::Copied { parts } => log::info!(
            "Copied s3://{}/{} to {} in {parts} parts ({:.1}s)",
            job.source_bucket,
            job.key,
            job.destination_bucket,
            start.elapsed().as_secs_f64()
        ),
        CopyOutcome::AlreadyPresent => log::info!(
            "s3://{}/{} already holds the object",
            job.destination_bucket,
            job.key
        ),
    }

    Ok(())
}
