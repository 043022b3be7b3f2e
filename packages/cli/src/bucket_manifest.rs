//! `bucket-manifest` driver and `object-metadata` worker commands.

use std::time::Instant;

use aws_config::SdkConfig;
use replicator_cli_utils::{IndicatifProgress, MultiProgress};
use replicator_dispatch::bucket_manifest::{self, ManifestJobConfig};
use replicator_dispatch::metadata::{self, env};
use replicator_queue::{BatchJobQueue, SqsQueue};
use replicator_retry::RetryPolicy;
use replicator_storage::S3Store;

#[derive(clap::Args)]
pub struct Args {
    /// Bucket to describe
    #[arg(long)]
    bucket: String,
    /// Only describe keys under this prefix
    #[arg(long, default_value = "")]
    prefix: String,
    /// Job queue receiving the metadata jobs
    #[arg(long, env = "JOB_QUEUE")]
    job_queue: String,
    /// Job definition of the metadata jobs
    #[arg(long, env = "JOB_DEFINITION")]
    job_definition: String,
    /// Results queue name or URL
    #[arg(long)]
    sqs_name: String,
    /// Bucket receiving the manifest
    #[arg(long)]
    out_bucket: String,
    /// Jobs submitted concurrently
    #[arg(long, default_value_t = replicator_dispatch::dispatcher::DEFAULT_WORKERS)]
    workers: usize,
}

#[derive(clap::Args)]
pub struct WorkerArgs {
    /// Bucket holding the object
    #[arg(long, env = env::BUCKET)]
    bucket: String,
    /// Object key, possibly form-encoded
    #[arg(long, env = env::KEY)]
    key: String,
    /// Results queue name or URL
    #[arg(long, env = env::SQS_NAME)]
    sqs_name: String,
    /// Attempts for reading the object and for sending the result
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
}

pub async fn run(
    args: Args,
    sdk_config: &SdkConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let store = S3Store::new(sdk_config);
    let jobs = BatchJobQueue::new(sdk_config);
    let results = SqsQueue::connect(sdk_config, &args.sqs_name).await?;

    let config = ManifestJobConfig {
        prefix: args.prefix,
        workers: args.workers,
        ..ManifestJobConfig::new(
            &args.bucket,
            &args.job_queue,
            &args.job_definition,
            &args.sqs_name,
            &args.out_bucket,
        )
    };

    let progress = IndicatifProgress::records_bar(multi, "Submitting metadata jobs");
    let report = bucket_manifest::run(
        &store,
        &jobs,
        &results,
        &config,
        &chrono::Local::now(),
        progress.as_ref(),
    )
    .await?;

    if !report.complete {
        log::warn!(
            "Manifest s3://{}/{} covers {} of {} objects",
            config.out_bucket,
            report.manifest_key,
            report.rows.len(),
            report.keys
        );
    }
    log::info!(
        "Bucket manifest of {} finished in {:.1}s: {} objects, {} jobs submitted, {} failed",
        config.bucket,
        start.elapsed().as_secs_f64(),
        report.keys,
        report.submitted,
        report.failed
    );

    Ok(())
}

pub async fn run_worker(
    args: WorkerArgs,
    sdk_config: &SdkConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = S3Store::new(sdk_config);
    let results = SqsQueue::connect(sdk_config, &args.sqs_name).await?;
    let policy = RetryPolicy::submission().with_max_attempts(args.max_attempts);

    let message = metadata::run(&store, &results, &args.bucket, &args.key, &policy).await?;
    if let Some(error) = message.error {
        log::warn!("Reported error for s3://{}/{}: {error}", args.bucket, args.key);
    }

    Ok(())
}
