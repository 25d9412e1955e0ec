//! Image validation, color normalization and resizing.
//!
//! Derived images are written next to their source with a suffix
//! (`_rgb`, `_resized`, `_thumb`). Conversions that fail fall back to the
//! input path so a bad derivative never blocks analysis of the original.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, warn};

use colloquy_core::config::MediaConfig;
use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::types::MediaAsset;

use crate::resolve_temp_dir;

/// Extensions accepted by [`ImageProcessor::validate`], lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff"];

const JPEG_QUALITY: u8 = 95;

/// Prepares images for model analysis.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    max_dimensions: (u32, u32),
    thumbnail_size: (u32, u32),
    temp_dir: PathBuf,
}

impl ImageProcessor {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            max_dimensions: (config.max_width, config.max_height),
            thumbnail_size: (config.thumbnail_size, config.thumbnail_size),
            temp_dir: resolve_temp_dir(config),
        }
    }

    pub fn max_dimensions(&self) -> (u32, u32) {
        self.max_dimensions
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// True iff `path` is an existing file with a supported extension.
    ///
    /// Only the extension is checked; the file is not opened.
    pub fn validate(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Convert a non-RGB image to RGB, written as `<stem>_rgb.jpg`.
    ///
    /// Returns the input path when it is already 8-bit RGB or when the
    /// conversion fails.
    pub fn normalize_color(&self, path: &Path) -> PathBuf {
        match self.try_normalize_color(path) {
            Ok(out) => out,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Color normalization failed");
                path.to_path_buf()
            }
        }
    }

    fn try_normalize_color(&self, path: &Path) -> Result<PathBuf> {
        let img = open_image(path)?;
        if img.color() == ColorType::Rgb8 {
            return Ok(path.to_path_buf());
        }

        let out = derived_path(path, "_rgb", Some("jpg"));
        write_jpeg(&img, &out)?;
        debug!(from = %path.display(), to = %out.display(), "Converted image to RGB");
        Ok(out)
    }

    /// Shrink to fit within `max`, preserving aspect ratio, written as
    /// `<stem>_resized.<ext>`. Never upscales.
    ///
    /// Returns the input path when the image cannot be processed.
    pub fn resize(&self, path: &Path, max: (u32, u32)) -> PathBuf {
        let out = derived_path(path, "_resized", None);
        match self.write_fitted(path, &out, max) {
            Ok(()) => out,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Image resize failed");
                path.to_path_buf()
            }
        }
    }

    /// Write a thumbnail as `<stem>_thumb.<ext>`.
    pub fn create_thumbnail(&self, path: &Path) -> Result<PathBuf> {
        let out = derived_path(path, "_thumb", None);
        self.write_fitted(path, &out, self.thumbnail_size)?;
        Ok(out)
    }

    fn write_fitted(&self, path: &Path, out: &Path, max: (u32, u32)) -> Result<()> {
        let img = open_image(path)?;
        let fitted = if img.width() > max.0 || img.height() > max.1 {
            img.resize(max.0, max.1, FilterType::Lanczos3)
        } else {
            img
        };
        save_image(&fitted, out)
    }

    /// Decode an image and describe it.
    pub fn image_info(&self, path: &Path) -> Result<MediaAsset> {
        let reader = ImageReader::open(path)?
            .with_guessed_format()
            .map_err(|e| ColloquyError::InvalidImage(format!("{}: {}", path.display(), e)))?;
        let format = reader
            .format()
            .map(format_name)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let img = reader
            .decode()
            .map_err(|e| ColloquyError::InvalidImage(format!("{}: {}", path.display(), e)))?;

        Ok(MediaAsset {
            path: path.display().to_string(),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format,
            color_mode: color_mode(img.color()).to_string(),
            width: img.width(),
            height: img.height(),
            byte_size: std::fs::metadata(path)?.len(),
        })
    }

    /// Validate, normalize color and downsize an image for the model.
    ///
    /// Fails with `InvalidImage` before touching the filesystem when the path
    /// does not pass [`validate`](Self::validate).
    pub fn prepare_for_analysis(&self, path: &Path) -> Result<PathBuf> {
        if !self.validate(path) {
            return Err(ColloquyError::InvalidImage(format!(
                "Invalid image file: {}",
                path.display()
            )));
        }

        let normalized = self.normalize_color(path);
        let (width, height) = image::image_dimensions(&normalized)
            .map_err(|e| ColloquyError::InvalidImage(format!("{}: {}", normalized.display(), e)))?;

        let (max_w, max_h) = self.max_dimensions;
        if width > max_w || height > max_h {
            Ok(self.resize(&normalized, self.max_dimensions))
        } else {
            Ok(normalized)
        }
    }

    /// Delete the given files that live under the temp directory. Returns
    /// how many were removed.
    pub fn cleanup_temp_files(&self, paths: &[PathBuf]) -> usize {
        let mut removed = 0;
        for path in paths {
            if !path.starts_with(&self.temp_dir) || !path.is_file() {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
        removed
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path)
        .map_err(|e| ColloquyError::InvalidImage(format!("Failed to load {}: {}", path.display(), e)))
}

/// `dir/stem{suffix}.{ext}`, keeping the source extension unless overridden.
fn derived_path(path: &Path, suffix: &str, ext: Option<&str>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = ext
        .map(str::to_string)
        .or_else(|| path.extension().map(|e| e.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "png".to_string());
    path.with_file_name(format!("{}{}.{}", stem, suffix, ext))
}

pub(crate) fn write_jpeg(img: &DynamicImage, out: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(out)?);
    let mut encoder = JpegEncoder::new_with_quality(file, JPEG_QUALITY);
    encoder
        .encode_image(&img.to_rgb8())
        .map_err(|e| ColloquyError::InvalidImage(format!("Failed to encode JPEG: {}", e)))
}

/// Save by extension; JPEG output is flattened to RGB first.
fn save_image(img: &DynamicImage, out: &Path) -> Result<()> {
    match ImageFormat::from_path(out) {
        Ok(ImageFormat::Jpeg) => write_jpeg(img, out),
        _ => img
            .save(out)
            .map_err(|e| ColloquyError::InvalidImage(format!("Failed to save {}: {}", out.display(), e))),
    }
}

fn format_name(format: ImageFormat) -> String {
    format.extensions_str().first().map_or_else(
        || format!("{:?}", format).to_uppercase(),
        |ext| ext.to_uppercase(),
    )
}

fn color_mode(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "OTHER",
    }
}
