//! `replicate` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use aws_config::SdkConfig;
use replicator_bucket_map::{BucketMapping, Settings};
use replicator_cli_utils::{IndicatifProgress, MultiProgress};
use replicator_dispatch::replicate::{ManifestSource, load_manifest, publish_outcomes};
use replicator_dispatch::{DispatchConfig, Dispatcher};
use replicator_queue::BatchJobQueue;
use replicator_storage::{ObjectStore, S3Store};
use replicator_transfer::planner::{DEFAULT_CHUNK_SIZE, MIB};

#[derive(clap::Args)]
pub struct Args {
    /// Input manifest (local path or `s3://bucket/key`)
    #[arg(long)]
    manifest: String,
    /// Project map JSON (`{"<project_id>": {"aws_bucket_prefix": ...}}`)
    #[arg(long)]
    project_map: PathBuf,
    /// Settings JSON with `GDC_TOKEN` and the postfix exception lists
    #[arg(long)]
    settings: PathBuf,
    /// Job queue receiving the transfer jobs
    #[arg(long, env = "JOB_QUEUE")]
    job_queue: String,
    /// Job definition of the transfer jobs
    #[arg(long, env = "JOB_DEFINITION")]
    job_definition: String,
    /// Directory receiving the outcome manifests
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// Bucket the outcome manifests are also uploaded to
    #[arg(long)]
    out_bucket: Option<String>,
    /// Records dispatched concurrently
    #[arg(long, default_value_t = replicator_dispatch::dispatcher::DEFAULT_WORKERS)]
    workers: usize,
    /// Part size in MiB the transfer jobs plan with (at least 5)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE / MIB)]
    chunk_size_mib: u64,
}

pub async fn run(
    args: Args,
    sdk_config: &SdkConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let settings = Settings::load(&args.settings)?;
    let mapping = BucketMapping::load(&args.project_map, &settings)?;
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(sdk_config));

    let source = ManifestSource::parse(&args.manifest)?;
    let mut parsed = load_manifest(store.as_ref(), &source).await?;

    let config = DispatchConfig {
        workers: args.workers,
        chunk_size_mib: args.chunk_size_mib,
        ..DispatchConfig::new(&args.job_queue, &args.job_definition, &settings.source_token)
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::new(BatchJobQueue::new(sdk_config)),
        mapping,
        config,
    );

    let progress = IndicatifProgress::records_bar(multi, "Dispatching");
    let report = dispatcher
        .dispatch(std::mem::take(&mut parsed.records), progress.as_ref())
        .await?;

    let published = publish_outcomes(
        store.as_ref(),
        &report,
        &parsed.rejected,
        &args.output_dir,
        &source.stem(),
        args.out_bucket.as_deref(),
    )
    .await?;

    for manifest in &published.outcomes {
        log::info!(
            "{}: {} rows in {}",
            manifest.outcome,
            manifest.rows,
            manifest.path.display()
        );
    }
    log::info!(
        "rejected: {} rows in {}",
        published.rejected.rows,
        published.rejected.path.display()
    );
    log::info!(
        "Replication dispatch finished in {:.1}s: {} ({} rows rejected)",
        start.elapsed().as_secs_f64(),
        report.summary,
        parsed.rejected.len()
    );

    Ok(())
}
