//! Capture orchestrator.
//!
//! Sequences one capture action through location fetch, capture, watermark
//! compositing, local persistence, and upload hand-off. Every step failure is
//! terminal for the attempt and surfaces as a transient notice; a new
//! user-initiated action starts over at `Idle`. A single-slot guard rejects a
//! second action while one is in flight.

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::annotate::{self, Annotate};
use crate::capture::{CaptureEngine, CaptureOutput, CaptureTarget};
use crate::db::{CaptureRecord, CaptureStore, UploadStatus};
use crate::error::PipelineError;
use crate::geocode::{ReverseGeocoder, UNKNOWN_LOCATION};
use crate::location::LocationProvider;
use crate::upload::{object_key, UploadWorker};

/// Stages of one capture action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    LocatingInFlight,
    CapturingInFlight,
    AnnotatingInFlight,
    PersistingLocal,
    UploadingRemote,
    Done,
    Aborted,
}

/// Transient status messages, the moral equivalent of the platform toasts.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    AlreadyInFlight,
    FetchingLocation,
    LocationUnavailable,
    CaptureFailed(String),
    Watermarking,
    AddressResolved(String),
    SavedLocally { capture_id: i64 },
    SaveFailed(String),
    StagingFailed(String),
    UploadQueued { object_key: String },
    UploadComplete { object_key: String },
    UploadFailed { object_key: String, error: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::AlreadyInFlight => write!(f, "A capture is already in progress."),
            Notice::FetchingLocation => write!(f, "Fetching location..."),
            Notice::LocationUnavailable => write!(f, "Location not available."),
            Notice::CaptureFailed(e) => write!(f, "Failed to capture photo: {e}"),
            Notice::Watermarking => write!(f, "Watermarking..."),
            Notice::AddressResolved(a) => write!(f, "Address: {a}"),
            Notice::SavedLocally { capture_id } => {
                write!(f, "Saved capture #{capture_id} to the local library.")
            }
            Notice::SaveFailed(e) => write!(f, "Failed to save photo: {e}"),
            Notice::StagingFailed(e) => {
                write!(f, "Photo saved, but could not be staged for upload: {e}")
            }
            Notice::UploadQueued { object_key } => write!(f, "Upload queued as {object_key}."),
            Notice::UploadComplete { object_key } => {
                write!(f, "Successfully uploaded {object_key}.")
            }
            Notice::UploadFailed { object_key, error } => {
                write!(f, "Upload of {object_key} failed: {error} (kept in outbox)")
            }
        }
    }
}

/// Terminal result of one capture action.
#[derive(Debug)]
pub enum CaptureOutcome {
    Done {
        capture_id: i64,
        gallery_path: PathBuf,
    },
    Aborted(PipelineError),
    /// Rejected by the single-slot guard; another action was in flight.
    Rejected,
}

pub struct Orchestrator {
    store: Arc<CaptureStore>,
    engine: Arc<dyn CaptureEngine>,
    locator: Arc<dyn LocationProvider>,
    geocoder: Arc<dyn ReverseGeocoder>,
    annotator: Arc<dyn Annotate>,
    worker: Option<UploadWorker>,
    pictures_dir: PathBuf,
    staging_dir: PathBuf,
    notices: mpsc::Sender<Notice>,
    in_flight: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CaptureStore>,
        engine: Arc<dyn CaptureEngine>,
        locator: Arc<dyn LocationProvider>,
        geocoder: Arc<dyn ReverseGeocoder>,
        annotator: Arc<dyn Annotate>,
        worker: Option<UploadWorker>,
        pictures_dir: &Path,
        staging_dir: &Path,
        notices: mpsc::Sender<Notice>,
    ) -> Self {
        Self {
            store,
            engine,
            locator,
            geocoder,
            annotator,
            worker,
            pictures_dir: pictures_dir.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            notices,
            in_flight: AtomicBool::new(false),
        }
    }

    fn notify(&self, notice: Notice) {
        // The receiver outliving the pipeline is the caller's concern.
        let _ = self.notices.send(notice);
    }

    /// Run one user-initiated capture action end to end.
    ///
    /// Steps execute in strict sequence; no step is retried. Overlapping
    /// requests are rejected rather than interleaved.
    pub async fn run_capture(&self) -> CaptureOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.notify(Notice::AlreadyInFlight);
            return CaptureOutcome::Rejected;
        }
        let outcome = self.capture_action().await;
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn capture_action(&self) -> CaptureOutcome {
        let mut state = CaptureState::Idle;

        // Idle -> LocatingInFlight
        advance(&mut state, CaptureState::LocatingInFlight);
        self.notify(Notice::FetchingLocation);
        let locator = self.locator.clone();
        let fix = tokio::task::spawn_blocking(move || locator.current_location()).await;
        let point = match fix {
            Ok(Ok(Some(point))) => point,
            Ok(Ok(None)) => {
                advance(&mut state, CaptureState::Aborted);
                self.notify(Notice::LocationUnavailable);
                return CaptureOutcome::Aborted(PipelineError::LocationUnavailable);
            }
            Ok(Err(e)) => {
                advance(&mut state, CaptureState::Aborted);
                error!("location fetch failed: {}", e);
                self.notify(Notice::LocationUnavailable);
                return CaptureOutcome::Aborted(e);
            }
            Err(e) => {
                advance(&mut state, CaptureState::Aborted);
                error!("location task failed: {}", e);
                self.notify(Notice::LocationUnavailable);
                return CaptureOutcome::Aborted(PipelineError::LocationUnavailable);
            }
        };

        // LocatingInFlight -> CapturingInFlight
        advance(&mut state, CaptureState::CapturingInFlight);
        let engine = self.engine.clone();
        let captured =
            tokio::task::spawn_blocking(move || engine.capture(&CaptureTarget::Memory)).await;
        let frame = match captured {
            Ok(Ok(CaptureOutput::Frame(frame))) => frame,
            Ok(Ok(CaptureOutput::SavedFile(_))) => {
                advance(&mut state, CaptureState::Aborted);
                let err = PipelineError::CaptureFailed(
                    "engine produced a file for an in-memory target".into(),
                );
                self.notify(Notice::CaptureFailed(err.to_string()));
                return CaptureOutcome::Aborted(err);
            }
            Ok(Err(e)) => {
                advance(&mut state, CaptureState::Aborted);
                self.notify(Notice::CaptureFailed(e.to_string()));
                return CaptureOutcome::Aborted(e);
            }
            Err(e) => {
                advance(&mut state, CaptureState::Aborted);
                let err = PipelineError::CaptureFailed(e.to_string());
                self.notify(Notice::CaptureFailed(err.to_string()));
                return CaptureOutcome::Aborted(err);
            }
        };

        let captured_at = Utc::now().timestamp_millis();

        // CapturingInFlight -> AnnotatingInFlight
        advance(&mut state, CaptureState::AnnotatingInFlight);
        self.notify(Notice::Watermarking);
        let geocoder = self.geocoder.clone();
        let geo_point = point;
        let address = tokio::task::spawn_blocking(move || geocoder.address(&geo_point))
            .await
            .unwrap_or_default()
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
        self.notify(Notice::AddressResolved(address.clone()));

        let annotator = self.annotator.clone();
        let timestamp_text = annotate::timestamp_line(captured_at);
        let annotated = match tokio::task::spawn_blocking(move || {
            annotator.annotate(&frame, &address, &point, &timestamp_text)
        })
        .await
        {
            Ok(image) => image,
            Err(e) => {
                advance(&mut state, CaptureState::Aborted);
                let err = PipelineError::CaptureFailed(e.to_string());
                self.notify(Notice::CaptureFailed(err.to_string()));
                return CaptureOutcome::Aborted(err);
            }
        };

        // AnnotatingInFlight -> PersistingLocal
        advance(&mut state, CaptureState::PersistingLocal);
        let store = self.store.clone();
        let pictures_dir = self.pictures_dir.clone();
        let staging_dir = self.staging_dir.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            persist_capture(&store, &pictures_dir, &staging_dir, annotated, point, captured_at)
        })
        .await;
        let persisted = match persisted {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                advance(&mut state, CaptureState::Aborted);
                self.notify(Notice::SaveFailed(e.to_string()));
                return CaptureOutcome::Aborted(e);
            }
            Err(e) => {
                advance(&mut state, CaptureState::Aborted);
                let err = PipelineError::LocalPersistFailed(e.to_string());
                self.notify(Notice::SaveFailed(err.to_string()));
                return CaptureOutcome::Aborted(err);
            }
        };

        // Local success is announced before any upload work happens.
        self.notify(Notice::SavedLocally {
            capture_id: persisted.capture_id,
        });
        match &persisted.staging {
            Ok(_) => {}
            Err(e) => self.notify(Notice::StagingFailed(e.to_string())),
        }

        // PersistingLocal -> UploadingRemote -> Done. Upload is best-effort:
        // its failure is surfaced but never rolls back the local record.
        advance(&mut state, CaptureState::UploadingRemote);
        if let (Some(worker), Ok(staging_path)) = (&self.worker, &persisted.staging) {
            self.upload_stage(worker, persisted.capture_id, staging_path, captured_at)
                .await;
        }

        advance(&mut state, CaptureState::Done);
        CaptureOutcome::Done {
            capture_id: persisted.capture_id,
            gallery_path: persisted.gallery_path,
        }
    }

    /// Enqueue the staged copy in the durable outbox and give it one
    /// immediate attempt. Retries belong to the background worker.
    async fn upload_stage(
        &self,
        worker: &UploadWorker,
        capture_id: i64,
        staging_path: &Path,
        captured_at: i64,
    ) {
        let key = object_key(captured_at);
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self
            .store
            .enqueue_upload(capture_id, staging_path, &key, now)
        {
            error!("could not enqueue upload for capture {}: {}", capture_id, e);
            self.notify(Notice::UploadFailed {
                object_key: key,
                error: e.to_string(),
            });
            return;
        }
        self.notify(Notice::UploadQueued {
            object_key: key.clone(),
        });

        let inline = worker.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || inline.process_due()).await {
            error!("inline upload attempt failed to run: {}", e);
        }

        match self.store.outbox_for_capture(capture_id) {
            Ok(Some(entry)) if entry.status == UploadStatus::Uploaded => {
                self.notify(Notice::UploadComplete { object_key: key });
            }
            Ok(Some(entry)) => {
                self.notify(Notice::UploadFailed {
                    object_key: key,
                    error: entry
                        .last_error
                        .unwrap_or_else(|| "not yet acknowledged".to_string()),
                });
            }
            Ok(None) => warn!("outbox row for capture {} vanished", capture_id),
            Err(e) => error!("could not read outbox for capture {}: {}", capture_id, e),
        }
    }
}

fn advance(state: &mut CaptureState, next: CaptureState) {
    debug!("capture action: {:?} -> {:?}", state, next);
    *state = next;
}

struct Persisted {
    capture_id: i64,
    gallery_path: PathBuf,
    /// Staging is best-effort: a failure here skips the upload but leaves
    /// the local save intact.
    staging: Result<PathBuf, PipelineError>,
}

/// Write the gallery JPEG, insert the capture record, and stage a private
/// copy for upload.
fn persist_capture(
    store: &CaptureStore,
    pictures_dir: &Path,
    staging_dir: &Path,
    annotated: RgbaImage,
    point: crate::location::GeoPoint,
    captured_at: i64,
) -> Result<Persisted, PipelineError> {
    std::fs::create_dir_all(pictures_dir)
        .map_err(|e| PipelineError::LocalPersistFailed(e.to_string()))?;
    let gallery_path = pictures_dir.join(format!("Watermarked_{captured_at}.jpg"));
    write_jpeg_max_quality(&gallery_path, annotated)
        .map_err(|e| PipelineError::LocalPersistFailed(e.to_string()))?;

    let record = CaptureRecord::new(
        gallery_path.to_string_lossy(),
        point.latitude,
        point.longitude,
        captured_at,
    );
    let capture_id = store
        .insert(&record)
        .map_err(|e| PipelineError::LocalPersistFailed(e.to_string()))?
        .ok_or_else(|| PipelineError::LocalPersistFailed("capture record ignored".into()))?;

    let staging = stage_for_upload(&gallery_path, staging_dir, captured_at);
    if let Err(e) = &staging {
        error!("could not stage capture {} for upload: {}", capture_id, e);
    }

    Ok(Persisted {
        capture_id,
        gallery_path,
        staging,
    })
}

fn write_jpeg_max_quality(path: &Path, image: RgbaImage) -> anyhow::Result<()> {
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, 100);
    rgb.write_with_encoder(encoder)?;
    Ok(())
}

/// Copy the finished image into the private staging area. The copy exists
/// solely for the transfer and is deleted by the worker after confirmed
/// acknowledgment.
fn stage_for_upload(
    gallery_path: &Path,
    staging_dir: &Path,
    captured_at: i64,
) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(staging_dir)
        .map_err(|e| PipelineError::UriConversionFailed(e.to_string()))?;
    let staging_path = staging_dir.join(object_key(captured_at));
    std::fs::copy(gallery_path, &staging_path)
        .map_err(|e| PipelineError::UriConversionFailed(e.to_string()))?;
    Ok(staging_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::geocode::NoGeocoder;
    use crate::location::{FixedLocation, GeoPoint};
    use crate::upload::{AccessLevel, RemoteUploader};
    use std::time::Duration;

    struct TestEngine {
        delay: Duration,
    }

    impl CaptureEngine for TestEngine {
        fn capture(&self, _target: &CaptureTarget) -> Result<CaptureOutput, PipelineError> {
            std::thread::sleep(self.delay);
            Ok(CaptureOutput::Frame(DynamicImage::new_rgb8(64, 48)))
        }
    }

    struct BrokenEngine;

    impl CaptureEngine for BrokenEngine {
        fn capture(&self, _target: &CaptureTarget) -> Result<CaptureOutput, PipelineError> {
            Err(PipelineError::CaptureFailed("sensor timeout".into()))
        }
    }

    struct PassthroughAnnotator;

    impl Annotate for PassthroughAnnotator {
        fn annotate(
            &self,
            frame: &DynamicImage,
            _location_text: &str,
            _point: &GeoPoint,
            _timestamp_text: &str,
        ) -> RgbaImage {
            frame.to_rgba8()
        }
    }

    struct StubUploader {
        fail: bool,
    }

    impl RemoteUploader for StubUploader {
        fn upload(
            &self,
            _file: &Path,
            key: &str,
            _access: AccessLevel,
        ) -> Result<String, PipelineError> {
            if self.fail {
                Err(PipelineError::RemoteUploadFailed("503".into()))
            } else {
                Ok(key.to_string())
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<CaptureStore>,
        notices: mpsc::Receiver<Notice>,
        staging_dir: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(
        engine: Arc<dyn CaptureEngine>,
        fix: Option<GeoPoint>,
        uploader: Option<StubUploader>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CaptureStore::open_in_memory().unwrap());
        store.initialize().unwrap();
        let staging_dir = dir.path().join("staging");

        let worker = uploader.map(|u| {
            UploadWorker::new(store.clone(), Arc::new(u), &UploadConfig::default())
        });
        let (tx, rx) = mpsc::channel();
        let orchestrator = Orchestrator::new(
            store.clone(),
            engine,
            Arc::new(FixedLocation::new(fix)),
            Arc::new(NoGeocoder),
            Arc::new(PassthroughAnnotator),
            worker,
            &dir.path().join("pictures"),
            &staging_dir,
            tx,
        );
        Harness {
            orchestrator,
            store,
            notices: rx,
            staging_dir,
            _dir: dir,
        }
    }

    fn some_fix() -> Option<GeoPoint> {
        Some(GeoPoint::new(48.85837, 2.29448))
    }

    #[tokio::test]
    async fn test_location_failure_never_reaches_persistence() {
        let h = harness(Arc::new(TestEngine { delay: Duration::ZERO }), None, None);
        let outcome = h.orchestrator.run_capture().await;

        assert!(matches!(
            outcome,
            CaptureOutcome::Aborted(PipelineError::LocationUnavailable)
        ));
        assert_eq!(h.store.capture_count().unwrap(), 0);
        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices.contains(&Notice::LocationUnavailable));
    }

    #[tokio::test]
    async fn test_capture_failure_aborts_with_notice() {
        let h = harness(Arc::new(BrokenEngine), some_fix(), None);
        let outcome = h.orchestrator.run_capture().await;

        assert!(matches!(
            outcome,
            CaptureOutcome::Aborted(PipelineError::CaptureFailed(_))
        ));
        assert_eq!(h.store.capture_count().unwrap(), 0);
        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::CaptureFailed(_))));
    }

    #[tokio::test]
    async fn test_successful_capture_persists_record() {
        let h = harness(Arc::new(TestEngine { delay: Duration::ZERO }), some_fix(), None);
        let outcome = h.orchestrator.run_capture().await;

        let CaptureOutcome::Done {
            capture_id,
            gallery_path,
        } = outcome
        else {
            panic!("expected Done, got {outcome:?}");
        };
        assert!(gallery_path.exists());

        let rows = h.store.list_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, capture_id);
        assert_eq!(rows[0].image_uri, gallery_path.to_string_lossy());
        assert_eq!(rows[0].latitude, 48.85837);
        assert_eq!(rows[0].longitude, 2.29448);

        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices.contains(&Notice::SavedLocally { capture_id }));
        // Geocoding degraded to the placeholder without aborting anything.
        assert!(notices.contains(&Notice::AddressResolved(UNKNOWN_LOCATION.to_string())));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_record() {
        let h = harness(
            Arc::new(TestEngine { delay: Duration::ZERO }),
            some_fix(),
            Some(StubUploader { fail: true }),
        );
        let outcome = h.orchestrator.run_capture().await;

        let CaptureOutcome::Done { capture_id, .. } = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        assert_eq!(h.store.capture_count().unwrap(), 1);

        // The failure stays observable in the outbox instead of vanishing.
        let entry = h.store.outbox_for_capture(capture_id).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.status, UploadStatus::Pending);
        assert!(entry.staging_path.exists());

        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::UploadFailed { .. })));
    }

    #[tokio::test]
    async fn test_confirmed_upload_deletes_staging_copy() {
        let h = harness(
            Arc::new(TestEngine { delay: Duration::ZERO }),
            some_fix(),
            Some(StubUploader { fail: false }),
        );
        let outcome = h.orchestrator.run_capture().await;

        let CaptureOutcome::Done { capture_id, .. } = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        let entry = h.store.outbox_for_capture(capture_id).unwrap().unwrap();
        assert_eq!(entry.status, UploadStatus::Uploaded);
        assert!(!entry.staging_path.exists());
        // Only the staging copy is removed; the gallery file stays.
        assert_eq!(std::fs::read_dir(&h.staging_dir).unwrap().count(), 0);

        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::UploadComplete { .. })));
    }

    #[tokio::test]
    async fn test_overlapping_capture_is_rejected() {
        let h = harness(
            Arc::new(TestEngine {
                delay: Duration::from_millis(150),
            }),
            some_fix(),
            None,
        );
        let (a, b) = tokio::join!(h.orchestrator.run_capture(), h.orchestrator.run_capture());

        let rejected = matches!(a, CaptureOutcome::Rejected) as u8
            + matches!(b, CaptureOutcome::Rejected) as u8;
        assert_eq!(rejected, 1, "exactly one action must hit the guard");
        assert_eq!(h.store.capture_count().unwrap(), 1);

        let notices: Vec<Notice> = h.notices.try_iter().collect();
        assert!(notices.contains(&Notice::AlreadyInFlight));
    }
}
