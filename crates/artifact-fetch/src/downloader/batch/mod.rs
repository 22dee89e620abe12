//! Batch download coordination and metrics
//!
//! A batch is all-or-nothing: either every artifact ends up in the target
//! directory, or none of the files the batch downloaded are left behind.

pub mod metrics;

// Re-export for convenience
pub use metrics::{DownloadMetrics, DownloadMetricsSnapshot, DownloadTelemetry};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::files::{assign_file_names, discard, persist, remove_quietly};
use crate::downloader::core::{
    ArtifactDescriptor, DownloadContext, DownloadError, DownloadOutcome, FileOperation, ProgressTracker, Result,
};
use crate::downloader::file::{FileOutcome, PerFileDownloader};
use crate::downloader::pool::WorkerPool;

/// Lifecycle of one `download_all` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Running,
    Succeeded,
    BatchFailed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::BatchFailed | BatchState::Cancelled)
    }

    pub fn can_transition_to(self, next: BatchState) -> bool {
        match (self, next) {
            (BatchState::Pending, BatchState::Running) => true,
            (BatchState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Result of a successful batch
#[derive(Debug)]
pub struct BatchResult {
    /// One outcome per descriptor, in input order
    pub outcomes: Vec<DownloadOutcome>,
    /// Wire bytes fetched by this batch; files already present count zero
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub metrics: DownloadMetricsSnapshot,
}

/// What a spawned task hands back to the coordinator
enum TaskOutcome {
    File(FileOutcome),
    /// Not started because a sibling had already failed
    Skipped,
}

struct BatchRun {
    state: BatchState,
    total: usize,
}

impl BatchRun {
    fn new(total: usize) -> Self {
        Self {
            state: BatchState::Pending,
            total,
        }
    }

    fn transition(&mut self, next: BatchState) {
        debug_assert!(self.state.can_transition_to(next), "{:?} -> {:?}", self.state, next);
        debug!("Batch of {} artifacts: {:?} -> {:?}", self.total, self.state, next);
        self.state = next;
    }
}

/// Downloads many artifacts concurrently into one directory
#[derive(Debug, Clone)]
pub struct DownloadCoordinator {
    downloader: Arc<PerFileDownloader>,
    pool: WorkerPool,
}

impl DownloadCoordinator {
    /// Coordinator with its own worker pool sized by `max_concurrent_downloads`
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let pool = WorkerPool::new(config.max_concurrent_downloads);
        let downloader = PerFileDownloader::new(config)?;
        Ok(Self::with_pool(Arc::new(downloader), pool))
    }

    /// Coordinator drawing workers from a pool shared with other users
    pub fn with_pool(downloader: Arc<PerFileDownloader>, pool: WorkerPool) -> Self {
        Self { downloader, pool }
    }

    pub fn downloader(&self) -> &Arc<PerFileDownloader> {
        &self.downloader
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Fetch every descriptor into `target_dir`
    ///
    /// Fails with [`DownloadError::Cancelled`] when the context is cancelled
    /// and with [`DownloadError::BatchFailed`] when any artifact cannot be
    /// fetched or the directory cannot be created. In both cases every temp
    /// file of the batch is removed.
    ///
    /// Descriptors sharing a default file name are stored as `name.ext`,
    /// `name_1.ext`, ... in input order, and each of those files is what the
    /// existing-file check of the next run looks at.
    pub async fn download_all(
        &self,
        descriptors: Vec<ArtifactDescriptor>,
        target_dir: &Path,
        context: &DownloadContext,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let total = descriptors.len();
        let mut batch = BatchRun::new(total);

        batch.transition(BatchState::Running);
        if let Err(source) = tokio::fs::create_dir_all(target_dir).await {
            batch.transition(BatchState::BatchFailed);
            return Err(DownloadError::BatchFailed {
                failed: total,
                total,
                source: Box::new(DownloadError::FileSystem {
                    path: target_dir.to_path_buf(),
                    operation: FileOperation::CreateDir,
                    source,
                }),
            });
        }

        info!("Downloading {} artifacts into {}", total, target_dir.display());
        let destinations = assign_file_names(target_dir, descriptors.iter().map(|d| d.default_file_name()));

        let metrics = Arc::new(DownloadMetrics::default());
        let progress = Arc::new(ProgressTracker::new(
            context.total_expected_count(),
            self.downloader.config().progress_offset,
            context.progress_callback().cloned(),
        ));
        let telemetry = DownloadTelemetry::new(metrics.clone(), progress);
        let aborted = Arc::new(AtomicBool::new(false));

        let mut tasks = JoinSet::new();
        for (index, (descriptor, destination)) in descriptors.iter().cloned().zip(destinations.clone()).enumerate() {
            let downloader = self.downloader.clone();
            let pool = self.pool.clone();
            let target_dir = target_dir.to_path_buf();
            let context = context.clone();
            let telemetry = telemetry.clone();
            let aborted = aborted.clone();

            tasks.spawn(async move {
                let outcome = run_task(
                    &downloader,
                    &pool,
                    &descriptor,
                    &destination,
                    &target_dir,
                    &context,
                    &telemetry,
                    &aborted,
                )
                .await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<FileOutcome>> = (0..total).map(|_| None).collect();
        let mut first_failure: Option<DownloadError> = None;
        let mut failed = 0;

        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok((_, TaskOutcome::File(FileOutcome::Failed(error)))) => error,
                Ok((_, TaskOutcome::File(FileOutcome::Cancelled))) | Ok((_, TaskOutcome::Skipped)) => continue,
                Ok((index, TaskOutcome::File(outcome))) => {
                    slots[index] = Some(outcome);
                    continue;
                }
                Err(join_error) => {
                    aborted.store(true, Ordering::Release);
                    DownloadError::TaskPanicked {
                        reason: join_error.to_string(),
                    }
                }
            };

            failed += 1;
            if first_failure.is_none() {
                first_failure = Some(error);
            } else {
                warn!("Another artifact of the batch failed: {}", error);
            }
        }

        if context.is_cancelled() {
            discard_downloads(slots);
            batch.transition(BatchState::Cancelled);
            info!("Batch of {} artifacts cancelled", total);
            return Err(DownloadError::Cancelled { url: None });
        }

        if let Some(source) = first_failure {
            discard_downloads(slots);
            batch.transition(BatchState::BatchFailed);
            warn!("Batch failed: {} of {} artifacts failed", failed, total);
            return Err(DownloadError::BatchFailed {
                failed,
                total,
                source: Box::new(source),
            });
        }

        let total_bytes: u64 = slots
            .iter()
            .map(|slot| match slot {
                Some(FileOutcome::Downloaded(artifact)) => artifact.wire_bytes,
                _ => 0,
            })
            .sum();

        let outcomes = match place_downloads(&descriptors, &destinations, slots).await {
            Ok(outcomes) => outcomes,
            Err(source) => {
                batch.transition(BatchState::BatchFailed);
                return Err(DownloadError::BatchFailed {
                    failed: 1,
                    total,
                    source: Box::new(source),
                });
            }
        };

        batch.transition(BatchState::Succeeded);
        let elapsed = started.elapsed();
        info!("Fetched {} artifacts ({} bytes) in {:?}", total, total_bytes, elapsed);

        Ok(BatchResult {
            outcomes,
            total_bytes,
            elapsed,
            metrics: metrics.snapshot(),
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    downloader: &PerFileDownloader,
    pool: &WorkerPool,
    descriptor: &ArtifactDescriptor,
    destination: &Path,
    target_dir: &Path,
    context: &DownloadContext,
    telemetry: &DownloadTelemetry,
    aborted: &AtomicBool,
) -> TaskOutcome {
    // Only the wait for a worker is raced against cancellation; a running
    // download observes the token on its own.
    let _permit = tokio::select! {
        _ = context.cancellation_token().cancelled() => return TaskOutcome::File(FileOutcome::Cancelled),
        permit = pool.acquire() => match permit {
            Ok(permit) => permit,
            Err(error) => return TaskOutcome::File(FileOutcome::Failed(error)),
        },
    };

    if aborted.load(Ordering::Acquire) {
        debug!("Skipping {}, the batch already failed", descriptor.download_url());
        return TaskOutcome::Skipped;
    }

    let outcome = downloader
        .download(descriptor, Some(destination), target_dir, context, telemetry)
        .await;

    if matches!(outcome, FileOutcome::Failed(_)) {
        aborted.store(true, Ordering::Release);
    }
    TaskOutcome::File(outcome)
}

fn discard_downloads(slots: Vec<Option<FileOutcome>>) {
    for slot in slots {
        if let Some(FileOutcome::Downloaded(artifact)) = slot {
            discard(artifact.temp_path);
        }
    }
}

/// Move every temp file to its assigned name, in descriptor order
///
/// If a move fails, everything this batch moved or downloaded is removed
/// again. Files reused as already present are left alone.
async fn place_downloads(
    descriptors: &[ArtifactDescriptor],
    destinations: &[PathBuf],
    slots: Vec<Option<FileOutcome>>,
) -> Result<Vec<DownloadOutcome>> {
    let mut outcomes = Vec::with_capacity(descriptors.len());
    let mut moved: Vec<PathBuf> = Vec::new();
    let mut remaining = slots.into_iter().zip(descriptors).zip(destinations);

    while let Some(((slot, descriptor), destination)) = remaining.next() {
        let placed = match slot {
            Some(FileOutcome::AlreadyPresent { path, .. }) => Ok((path, true)),
            Some(FileOutcome::Downloaded(artifact)) => {
                persist(artifact.temp_path, destination).map(|()| (destination.clone(), false))
            }
            _ => Err(DownloadError::TaskPanicked {
                reason: format!("no outcome recorded for {}", descriptor.download_url()),
            }),
        };

        match placed {
            Ok((local_file, was_already_present)) => {
                if !was_already_present {
                    moved.push(local_file.clone());
                }
                outcomes.push(DownloadOutcome {
                    local_file,
                    descriptor: descriptor.clone(),
                    was_already_present,
                });
            }
            Err(error) => {
                warn!("Placing {} failed: {}", destination.display(), error);
                for path in &moved {
                    remove_quietly(path).await;
                }
                discard_downloads(remaining.map(|((slot, _), _)| slot).collect());
                return Err(error);
            }
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_state_transitions() {
        assert!(BatchState::Pending.can_transition_to(BatchState::Running));
        assert!(BatchState::Running.can_transition_to(BatchState::Succeeded));
        assert!(BatchState::Running.can_transition_to(BatchState::Cancelled));
        assert!(!BatchState::Pending.can_transition_to(BatchState::Succeeded));
        assert!(!BatchState::Succeeded.can_transition_to(BatchState::Running));
        assert!(!BatchState::Running.is_terminal());
    }
}
