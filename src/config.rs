use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::upload::AccessLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub location: LocationConfig,

    #[serde(default)]
    pub geocoder: GeocoderConfig,

    #[serde(default)]
    pub annotate: AnnotateConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Shared pictures collection where finished captures land.
    #[serde(default = "default_pictures_dir")]
    pub pictures_dir: PathBuf,

    /// Private staging area for transient upload copies.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_pictures_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| PathBuf::from("Pictures"))
        .join("Geoshot")
}

fn default_staging_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("geoshot/staging")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pictures_dir: default_pictures_dir(),
            staging_dir: default_staging_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CameraConfig {
    /// Still-capture command, e.g. "libcamera-still" or "fswebcam".
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for the command; `{output}` is replaced by the path the
    /// JPEG must be written to.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Fixed,
    #[default]
    GeoIp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub source: LocationSource,

    #[serde(default)]
    pub fixed_latitude: Option<f64>,

    #[serde(default)]
    pub fixed_longitude: Option<f64>,

    #[serde(default = "default_geoip_endpoint")]
    pub geoip_endpoint: String,
}

fn default_geoip_endpoint() -> String {
    "http://ip-api.com/json".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            source: LocationSource::default(),
            fixed_latitude: None,
            fixed_longitude: None,
            geoip_endpoint: default_geoip_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_enabled")]
    pub enabled: bool,

    #[serde(default = "default_geocoder_endpoint")]
    pub endpoint: String,
}

fn default_geocoder_enabled() -> bool {
    true
}

fn default_geocoder_endpoint() -> String {
    "https://nominatim.openstreetmap.org/reverse".to_string()
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            enabled: default_geocoder_enabled(),
            endpoint: default_geocoder_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotateConfig {
    /// TrueType font for the banner text; well-known system locations are
    /// probed when unset.
    #[serde(default)]
    pub font_path: Option<PathBuf>,

    #[serde(default = "default_text_size")]
    pub text_size: f32,

    #[serde(default = "default_padding")]
    pub padding: u32,

    #[serde(default = "default_bottom_margin")]
    pub bottom_margin: u32,
}

fn default_text_size() -> f32 {
    40.0
}

fn default_padding() -> u32 {
    20
}

fn default_bottom_margin() -> u32 {
    100
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            text_size: default_text_size(),
            padding: default_padding(),
            bottom_margin: default_bottom_margin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Object-store endpoint. Uploads stay disabled while unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default)]
    pub access: AccessLevel,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

fn default_bucket() -> String {
    "captures".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            access: AccessLevel::default(),
            token: None,
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("geoshot")
        .join("geoshot.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            output: OutputConfig::default(),
            camera: CameraConfig::default(),
            location: LocationConfig::default(),
            geocoder: GeocoderConfig::default(),
            annotate: AnnotateConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("geoshot")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.upload.max_attempts, config.upload.max_attempts);
        assert_eq!(parsed.location.source, LocationSource::GeoIp);
        assert_eq!(parsed.annotate.text_size, 40.0);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [location]
            source = "fixed"
            fixed_latitude = 1.5
            fixed_longitude = -2.5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.location.source, LocationSource::Fixed);
        assert_eq!(parsed.location.fixed_latitude, Some(1.5));
        assert_eq!(parsed.upload.poll_interval_secs, 60);
        assert!(parsed.upload.endpoint.is_none());
        assert!(parsed.camera.command.is_none());
    }
}
