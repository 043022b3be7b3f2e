//! `transfer` command: the worker of a replication job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aws_config::SdkConfig;
use replicator_cli_utils::{IndicatifProgress, MultiProgress};
use replicator_retry::RetryPolicy;
use replicator_storage::S3Store;
use replicator_transfer::engine::{DEFAULT_PART_WORKERS, DEFAULT_DEADLINE};
use replicator_transfer::planner::{DEFAULT_CHUNK_SIZE, MIB};
use replicator_transfer::worker::{self, DEFAULT_DATA_ENDPOINT, env};
use replicator_transfer::{MultipartTransfer, TransferConfig, TransferJob};

#[derive(clap::Args)]
pub struct Args {
    /// Object id in the source repository
    #[arg(long, env = env::ID)]
    id: String,
    /// File name of the object
    #[arg(long, env = env::FILE_NAME)]
    file_name: String,
    /// Object size in bytes
    #[arg(long, env = env::SIZE)]
    size: u64,
    /// Destination bucket
    #[arg(long, env = env::DESTINATION_BUCKET)]
    destination_bucket: String,
    /// Destination key (defaults to `<id>/<file_name>`)
    #[arg(long, env = env::KEY)]
    key: Option<String>,
    /// Source repository token
    #[arg(long, env = env::GDC_TOKEN, hide_env_values = true)]
    token: String,
    /// Source repository data endpoint; the object id is appended
    #[arg(long, env = "DATA_ENDPOINT", default_value = DEFAULT_DATA_ENDPOINT)]
    endpoint: String,
    #[command(flatten)]
    engine: EngineArgs,
}

/// Multipart engine settings shared by the transfer and copy workers.
#[derive(clap::Args)]
pub struct EngineArgs {
    /// Part size in MiB (at least 5)
    #[arg(long, env = env::CHUNK_SIZE_MIB, default_value_t = DEFAULT_CHUNK_SIZE / MIB)]
    chunk_size_mib: u64,
    /// Parts transferred concurrently
    #[arg(long, default_value_t = DEFAULT_PART_WORKERS)]
    part_workers: usize,
    /// Attempts per part download, upload and completion
    #[arg(long, default_value_t = RetryPolicy::transfer().max_attempts)]
    max_attempts: u32,
    /// Overall time limit in seconds (0 disables it)
    #[arg(long, default_value_t = DEFAULT_DEADLINE.as_secs())]
    deadline_secs: u64,
}

impl Args {
    fn job(&self) -> TransferJob {
        TransferJob {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            size: self.size,
            destination_bucket: self.destination_bucket.clone(),
            key: self
                .key
                .clone()
                .unwrap_or_else(|| format!("{}/{}", self.id, self.file_name)),
            token: self.token.clone(),
        }
    }
}

impl EngineArgs {
    pub fn config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size_mib.saturating_mul(MIB),
            part_workers: self.part_workers,
            retry: RetryPolicy::transfer().with_max_attempts(self.max_attempts),
            deadline: (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs)),
        }
    }
}

pub async fn run(
    args: Args,
    sdk_config: &SdkConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let job = args.job();

    let engine = MultipartTransfer::new(
        Arc::new(S3Store::new(sdk_config)),
        args.engine.config(),
    );
    let progress = IndicatifProgress::bytes_bar(multi, &job.key);

    let parts = worker::run(
        &job,
        &args.endpoint,
        reqwest::Client::new(),
        &engine,
        progress.as_ref(),
    )
    .await?;

    log::info!(
        "Replicated {} to s3://{}/{} in {} parts ({:.1}s)",
        job.id,
        job.destination_bucket,
        job.key,
        parts.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}
