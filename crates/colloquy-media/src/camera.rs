//! Camera capture.
//!
//! Provides the `FrameSource` trait for reading RGB frames from a capture
//! device, a `MockFrameSource` for testing, `CameraCapture` for the headless
//! and interactive capture flows, and `CameraManager` for device discovery.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::Local;
use image::{DynamicImage, RgbImage};
use tracing::{info, warn};

use colloquy_core::config::CameraConfig;
use colloquy_core::error::{ColloquyError, Result};

use crate::ffmpeg::FfmpegCamera;
use crate::processor::write_jpeg;

/// Highest device index tried by [`CameraManager::list_cameras`], exclusive.
const MAX_LISTED_DEVICES: u32 = 5;

/// A device that produces RGB frames.
pub trait FrameSource: Send {
    /// Acquire the device.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame. `Ok(None)` means the device stopped producing
    /// frames.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Release the device. Safe to call more than once.
    fn release(&mut self);
}

/// What an interactive capture should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureAction {
    /// Keep showing frames.
    Continue,
    /// Save the current frame.
    Capture,
    /// Stop without saving.
    Cancel,
}

/// Decides when an interactive capture fires, e.g. by polling a key press.
pub trait CaptureTrigger {
    fn poll(&mut self, frame: &RgbImage) -> CaptureAction;
}

impl<F> CaptureTrigger for F
where
    F: FnMut(&RgbImage) -> CaptureAction,
{
    fn poll(&mut self, frame: &RgbImage) -> CaptureAction {
        self(frame)
    }
}

/// Receives live frames during an interactive capture.
pub trait PreviewSink {
    fn show(&mut self, frame: &RgbImage);
}

// =============================================================================
// Mock
// =============================================================================

/// Mock frame source for testing.
///
/// Yields a fixed queue of frames, then `None`.
#[derive(Debug, Clone, Default)]
pub struct MockFrameSource {
    frames: VecDeque<RgbImage>,
    unavailable: bool,
    opened: bool,
    frames_read: usize,
}

impl MockFrameSource {
    /// `count` frames of the given size, each filled with its index as the
    /// red channel so tests can tell them apart.
    pub fn with_frames(count: usize, width: u32, height: u32) -> Self {
        let frames = (0..count)
            .map(|i| RgbImage::from_pixel(width, height, image::Rgb([i as u8, 0, 0])))
            .collect();
        Self {
            frames,
            ..Self::default()
        }
    }

    /// A device that fails to open.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn frames_read(&self) -> usize {
        self.frames_read
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }
}

impl FrameSource for MockFrameSource {
    fn open(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(ColloquyError::Camera("Mock camera unavailable".to_string()));
        }
        self.opened = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.opened {
            return Err(ColloquyError::Camera("Camera not open".to_string()));
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        self.opened = false;
    }
}

// =============================================================================
// Capture flows
// =============================================================================

/// Captures a still image from a frame source.
pub struct CameraCapture {
    source: Box<dyn FrameSource>,
    warmup_frames: u32,
    output_dir: PathBuf,
}

impl CameraCapture {
    pub fn new(source: Box<dyn FrameSource>, warmup_frames: u32, output_dir: PathBuf) -> Self {
        Self {
            source,
            warmup_frames,
            output_dir,
        }
    }

    /// Capture without user interaction.
    ///
    /// Discards the warm-up frames so exposure can settle, then saves the
    /// next frame. Returns `None` if the device cannot be opened or stops
    /// producing frames.
    pub fn capture_headless(&mut self, save_path: Option<PathBuf>) -> Option<PathBuf> {
        if let Err(e) = self.source.open() {
            warn!(error = %e, "Could not open camera");
            return None;
        }
        let result = self.headless_inner(save_path);
        self.source.release();

        match result {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Headless capture failed");
                None
            }
        }
    }

    fn headless_inner(&mut self, save_path: Option<PathBuf>) -> Result<Option<PathBuf>> {
        for _ in 0..self.warmup_frames {
            if self.source.read_frame()?.is_none() {
                return Ok(None);
            }
        }
        match self.source.read_frame()? {
            Some(frame) => self.save(&frame, save_path).map(Some),
            None => Ok(None),
        }
    }

    /// Show frames until the trigger fires.
    ///
    /// Every frame goes to `preview` (if any) and then to `trigger`.
    /// `Capture` saves the current frame; `Cancel` or a failed read
    /// returns `None`.
    pub fn capture_interactive(
        &mut self,
        save_path: Option<PathBuf>,
        trigger: &mut dyn CaptureTrigger,
        mut preview: Option<&mut dyn PreviewSink>,
    ) -> Option<PathBuf> {
        if let Err(e) = self.source.open() {
            warn!(error = %e, "Could not open camera");
            return None;
        }

        let mut result = None;
        loop {
            let frame = match self.source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read camera frame");
                    break;
                }
            };
            if let Some(sink) = preview.as_deref_mut() {
                sink.show(&frame);
            }
            match trigger.poll(&frame) {
                CaptureAction::Continue => continue,
                CaptureAction::Cancel => {
                    info!("Camera capture cancelled");
                    break;
                }
                CaptureAction::Capture => {
                    match self.save(&frame, save_path) {
                        Ok(path) => result = Some(path),
                        Err(e) => warn!(error = %e, "Failed to save camera frame"),
                    }
                    break;
                }
            }
        }

        self.source.release();
        result
    }

    fn save(&self, frame: &RgbImage, save_path: Option<PathBuf>) -> Result<PathBuf> {
        let path = match save_path {
            Some(path) => path,
            None => {
                std::fs::create_dir_all(&self.output_dir)?;
                self.output_dir.join(capture_file_name())
            }
        };
        write_jpeg(&DynamicImage::ImageRgb8(frame.clone()), &path)?;
        info!(path = %path.display(), "Camera image saved");
        Ok(path)
    }
}

/// `camera_capture_YYYYmmdd_HHMMSS.jpg` in local time.
pub fn capture_file_name() -> String {
    format!("camera_capture_{}.jpg", Local::now().format("%Y%m%d_%H%M%S"))
}

// =============================================================================
// Discovery
// =============================================================================

type SourceFactory = dyn Fn(u32) -> Box<dyn FrameSource> + Send + Sync;

/// Creates frame sources by device index and checks which ones work.
pub struct CameraManager {
    factory: Box<SourceFactory>,
    default_index: u32,
    warmup_frames: u32,
    output_dir: PathBuf,
}

impl CameraManager {
    pub fn new<F>(factory: F, default_index: u32, warmup_frames: u32, output_dir: PathBuf) -> Self
    where
        F: Fn(u32) -> Box<dyn FrameSource> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            default_index,
            warmup_frames,
            output_dir,
        }
    }

    /// Manager backed by ffmpeg device capture.
    pub fn ffmpeg(config: &CameraConfig, output_dir: PathBuf) -> Self {
        let config = config.clone();
        let default_index = config.device_index;
        let warmup = config.warmup_frames;
        Self::new(
            move |index| Box::new(FfmpegCamera::new(index, &config)) as Box<dyn FrameSource>,
            default_index,
            warmup,
            output_dir,
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Capture session on the configured device.
    pub fn capture(&self) -> CameraCapture {
        self.capture_on(self.default_index)
    }

    pub fn capture_on(&self, index: u32) -> CameraCapture {
        CameraCapture::new(
            (self.factory)(index),
            self.warmup_frames,
            self.output_dir.clone(),
        )
    }

    /// True if the device opens and yields a frame.
    pub fn test_camera(&self, index: u32) -> bool {
        let mut source = (self.factory)(index);
        let ok = source.open().is_ok() && matches!(source.read_frame(), Ok(Some(_)));
        source.release();
        ok
    }

    /// Whether the configured device works.
    pub fn is_available(&self) -> bool {
        self.test_camera(self.default_index)
    }

    /// Indices of working devices among the first few.
    pub fn list_cameras(&self) -> Vec<u32> {
        (0..MAX_LISTED_DEVICES)
            .filter(|&index| self.test_camera(index))
            .collect()
    }
}

impl std::fmt::Debug for CameraManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraManager")
            .field("default_index", &self.default_index)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}
