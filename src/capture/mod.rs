//! Capture engine adapter.
//!
//! The platform camera sits behind [`CaptureEngine`]; the shipped adapter
//! shells out to a still-capture command (libcamera-still, fswebcam, ...)
//! that writes a JPEG to a path of our choosing. Exactly one of
//! {in-memory frame, saved file} is produced per successful call, selected
//! by the capture target.

use chrono::Utc;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::config::CameraConfig;
use crate::error::PipelineError;
use crate::location::GeoPoint;

/// Placeholder in the configured argument list replaced by the output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Which output the orchestrator wants from this capture.
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    /// Deliver a decoded pixel buffer for further processing.
    Memory,
    /// Write a JPEG straight into the shared pictures collection, optionally
    /// recording the capture location alongside it.
    SharedStorage { geotag: Option<GeoPoint> },
}

/// Result of a successful capture.
#[derive(Debug)]
pub enum CaptureOutput {
    Frame(DynamicImage),
    SavedFile(PathBuf),
}

pub trait CaptureEngine: Send + Sync {
    /// Take one still. Failure is terminal for the attempt; the engine never
    /// retries on its own, and any transient buffer it held is released on
    /// every path out.
    fn capture(&self, target: &CaptureTarget) -> Result<CaptureOutput, PipelineError>;
}

/// Adapter that runs an external capture command.
#[derive(Debug)]
pub struct CommandCamera {
    program: String,
    args: Vec<String>,
    pictures_dir: PathBuf,
}

impl CommandCamera {
    pub fn from_config(config: &CameraConfig, pictures_dir: &Path) -> Result<Self, PipelineError> {
        let program = config
            .command
            .clone()
            .ok_or_else(|| PipelineError::CaptureFailed("no capture command configured".into()))?;
        Ok(Self {
            program,
            args: config.args.clone(),
            pictures_dir: pictures_dir.to_path_buf(),
        })
    }

    pub fn new(program: &str, args: &[&str], pictures_dir: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            pictures_dir: pictures_dir.to_path_buf(),
        }
    }

    /// Run the capture command with the placeholder substituted.
    fn run(&self, output: &Path) -> Result<(), PipelineError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &output.to_string_lossy()))
            .collect();
        debug!("running capture command: {} {:?}", self.program, args);

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(PipelineError::from_capture_io)?;
        if !status.success() {
            return Err(PipelineError::CaptureFailed(format!(
                "{} exited with {}",
                self.program, status
            )));
        }
        Ok(())
    }
}

impl CaptureEngine for CommandCamera {
    fn capture(&self, target: &CaptureTarget) -> Result<CaptureOutput, PipelineError> {
        // The temp file is removed on drop, so the transient buffer is
        // released along the error paths too.
        let scratch = tempfile::Builder::new()
            .prefix("geoshot_")
            .suffix(".jpg")
            .tempfile()
            .map_err(PipelineError::from_capture_io)?;

        self.run(scratch.path())?;

        match target {
            CaptureTarget::Memory => {
                let frame = image::open(scratch.path())
                    .map_err(|e| PipelineError::CaptureFailed(e.to_string()))?;
                Ok(CaptureOutput::Frame(frame))
            }
            CaptureTarget::SharedStorage { geotag } => {
                std::fs::create_dir_all(&self.pictures_dir)
                    .map_err(PipelineError::from_capture_io)?;
                let millis = Utc::now().timestamp_millis();
                let dest = self.pictures_dir.join(format!("IMG_{millis}.jpg"));
                std::fs::copy(scratch.path(), &dest).map_err(PipelineError::from_capture_io)?;
                if let Some(point) = geotag {
                    write_geotag_sidecar(&dest, point)?;
                }
                Ok(CaptureOutput::SavedFile(dest))
            }
        }
    }
}

/// Record the capture location next to a directly-saved image as a small
/// JSON sidecar (`IMG_x.jpg.json`).
fn write_geotag_sidecar(image_path: &Path, point: &GeoPoint) -> Result<(), PipelineError> {
    let mut sidecar = image_path.as_os_str().to_owned();
    sidecar.push(".json");
    let body = serde_json::to_string_pretty(point)
        .map_err(|e| PipelineError::CaptureFailed(e.to_string()))?;
    std::fs::write(sidecar, body).map_err(PipelineError::from_capture_io)?;
    Ok(())
}
