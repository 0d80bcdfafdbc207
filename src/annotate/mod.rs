//! Watermark compositing.
//!
//! Burns a three-line banner (address, coordinates, timestamp) into the
//! bottom margin of a captured frame. The input image is never mutated;
//! the annotated copy always has the same pixel dimensions as the input.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use std::path::PathBuf;

use crate::config::AnnotateConfig;
use crate::location::GeoPoint;

/// Banner background alpha out of 255 (roughly 50% black).
const BANNER_ALPHA: u16 = 128;

/// Lines rendered into the banner: address, coordinates, timestamp.
const BANNER_LINES: u32 = 3;

/// Well-known font locations probed when the config names none.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Seam between the orchestrator and the concrete compositor, so tests can
/// run the pipeline without a font on disk.
pub trait Annotate: Send + Sync {
    fn annotate(
        &self,
        frame: &DynamicImage,
        location_text: &str,
        point: &GeoPoint,
        timestamp_text: &str,
    ) -> RgbaImage;
}

/// Format the coordinate banner line, 5 decimal places.
pub fn coordinate_line(point: &GeoPoint) -> String {
    format!("Lat {:.5}, Long {:.5}", point.latitude, point.longitude)
}

/// Format a capture timestamp for the banner, e.g. `15/03/2026 09:30:05 AM`.
pub fn timestamp_line(epoch_millis: i64) -> String {
    match Local.timestamp_millis_opt(epoch_millis).single() {
        Some(dt) => dt.format("%d/%m/%Y %I:%M:%S %p").to_string(),
        None => String::new(),
    }
}

/// Probe well-known system locations for a usable TrueType font.
pub fn find_system_font() -> Option<PathBuf> {
    FONT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

pub struct Annotator {
    font: FontArc,
    text_size: f32,
    padding: u32,
    bottom_margin: u32,
}

impl Annotator {
    /// Load the font named in the config, falling back to system discovery.
    pub fn load(config: &AnnotateConfig) -> Result<Self> {
        let font_path = match &config.font_path {
            Some(path) => path.clone(),
            None => find_system_font()
                .ok_or_else(|| anyhow!("no usable font found; set annotate.font_path"))?,
        };
        let bytes = std::fs::read(&font_path)
            .with_context(|| format!("failed to read font {}", font_path.display()))?;
        Self::from_font_bytes(bytes, config)
    }

    pub fn from_font_bytes(bytes: Vec<u8>, config: &AnnotateConfig) -> Result<Self> {
        let font = FontArc::try_from_vec(bytes).context("font data unreadable")?;
        Ok(Self {
            font,
            text_size: config.text_size,
            padding: config.padding,
            bottom_margin: config.bottom_margin,
        })
    }

    /// Banner rectangle as `(top, bottom)` rows for the given image height
    /// and measured line height. Clamped so small frames still get a banner
    /// without the geometry going negative.
    fn banner_rows(&self, height: u32, line_height: u32) -> (u32, u32) {
        let bottom = height.saturating_sub(self.bottom_margin).max(1).min(height);
        let banner_height = BANNER_LINES * (line_height + self.padding) + self.padding;
        let top = bottom.saturating_sub(banner_height);
        (top, bottom)
    }
}

impl Annotate for Annotator {
    fn annotate(
        &self,
        frame: &DynamicImage,
        location_text: &str,
        point: &GeoPoint,
        timestamp_text: &str,
    ) -> RgbaImage {
        let mut canvas = frame.to_rgba8();
        let (width, height) = canvas.dimensions();

        let scale = PxScale::from(self.text_size);
        let measured = text_size(scale, &self.font, location_text).1;
        // Empty address still reserves a full line.
        let line_height = measured.max(self.text_size as u32);

        let (top, bottom) = self.banner_rows(height, line_height);
        darken_band(&mut canvas, self.padding, width.saturating_sub(self.padding), top, bottom);

        let white = Rgba([255u8, 255, 255, 255]);
        let text_x = (self.padding * 2) as i32;
        let coordinate_text = coordinate_line(point);
        let lines: [&str; 3] = [location_text, &coordinate_text, timestamp_text];
        for (i, line) in lines.iter().enumerate() {
            let y = top + self.padding + i as u32 * (line_height + self.padding);
            if y >= height {
                break;
            }
            draw_text_mut(&mut canvas, white, text_x, y as i32, scale, &self.font, line);
        }

        canvas
    }
}

/// Blend a semi-transparent black band over the given pixel range.
fn darken_band(canvas: &mut RgbaImage, x0: u32, x1: u32, y0: u32, y1: u32) {
    let (width, height) = canvas.dimensions();
    let keep = 255 - BANNER_ALPHA;
    for y in y0..y1.min(height) {
        for x in x0..x1.min(width) {
            let pixel = canvas.get_pixel_mut(x, y);
            for channel in &mut pixel.0[..3] {
                *channel = ((*channel as u16 * keep) / 255) as u8;
            }
        }
    }
}
