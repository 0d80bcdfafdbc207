//! Outbox worker: drains the upload queue with retry and backoff.
//!
//! The orchestrator only ever enqueues; this worker owns every transfer
//! attempt. A capture whose upload keeps failing stays visible in the outbox
//! instead of disappearing into a fire-and-forget call.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::UploadConfig;
use crate::db::{CaptureStore, OutboxEntry};
use crate::upload::{AccessLevel, RemoteUploader};

/// How many due rows one pass will pick up.
const BATCH_LIMIT: usize = 10;

/// Exponent cap so the backoff shift cannot overflow.
const MAX_BACKOFF_SHIFT: i64 = 10;

/// Retry delay in milliseconds after `attempts` failed tries.
pub fn backoff_delay_ms(attempts: i64, base_secs: u64) -> i64 {
    let shift = attempts.clamp(0, MAX_BACKOFF_SHIFT) as u32;
    (base_secs as i64) * 1000 * (1i64 << shift)
}

#[derive(Clone)]
pub struct UploadWorker {
    store: Arc<CaptureStore>,
    uploader: Arc<dyn RemoteUploader>,
    access: AccessLevel,
    max_attempts: i64,
    backoff_base_secs: u64,
    poll_interval: Duration,
}

impl UploadWorker {
    pub fn new(
        store: Arc<CaptureStore>,
        uploader: Arc<dyn RemoteUploader>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            store,
            uploader,
            access: config.access,
            max_attempts: config.max_attempts as i64,
            backoff_base_secs: config.backoff_base_secs,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Poll the outbox until the task is aborted.
    pub async fn run(&self) {
        info!(
            "upload worker polling every {}s",
            self.poll_interval.as_secs()
        );
        loop {
            let worker = self.clone();
            match tokio::task::spawn_blocking(move || worker.process_due()).await {
                Ok(0) => {}
                Ok(n) => info!("upload worker processed {} transfer(s)", n),
                Err(e) => error!("upload worker task failed: {}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Attempt every due outbox row once. Returns how many rows were
    /// attempted; store errors are logged, never raised.
    pub fn process_due(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let due = match self.store.due_uploads(now, BATCH_LIMIT) {
            Ok(entries) => entries,
            Err(e) => {
                error!("could not read upload outbox: {}", e);
                return 0;
            }
        };

        let mut processed = 0;
        for entry in due {
            self.attempt(&entry);
            processed += 1;
        }
        processed
    }

    /// One transfer attempt. On confirmed acknowledgment the staging copy is
    /// deleted; on failure the row is rescheduled with exponential backoff
    /// until it runs out of attempts.
    pub fn attempt(&self, entry: &OutboxEntry) -> bool {
        if let Err(e) = self.store.mark_uploading(entry.id) {
            error!("could not mark outbox row {} uploading: {}", entry.id, e);
            return false;
        }

        match self
            .uploader
            .upload(&entry.staging_path, &entry.object_key, self.access)
        {
            Ok(stored_key) => {
                info!("uploaded {}", stored_key);
                // The staging copy exists solely for the transfer.
                if let Err(e) = std::fs::remove_file(&entry.staging_path) {
                    warn!(
                        "could not remove staging copy {}: {}",
                        entry.staging_path.display(),
                        e
                    );
                }
                if let Err(e) = self.store.mark_uploaded(entry.id) {
                    error!("could not mark outbox row {} uploaded: {}", entry.id, e);
                }
                true
            }
            Err(e) => {
                let attempts_after = entry.attempts + 1;
                let terminal = attempts_after >= self.max_attempts;
                let next = chrono::Utc::now().timestamp_millis()
                    + backoff_delay_ms(entry.attempts, self.backoff_base_secs);
                error!(
                    "upload of {} failed (attempt {}/{}): {}",
                    entry.object_key, attempts_after, self.max_attempts, e
                );
                if let Err(e) =
                    self.store
                        .mark_upload_failed(entry.id, &e.to_string(), next, terminal)
                {
                    error!("could not reschedule outbox row {}: {}", entry.id, e);
                }
                false
            }
        }
    }
}
