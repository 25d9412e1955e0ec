//! Colloquy Media crate - image preparation and camera capture.
//!
//! `ImageProcessor` validates, color-normalizes and downsizes images before
//! they are sent to the model. The camera module abstracts frame capture
//! behind the `FrameSource` trait with an ffmpeg-backed implementation and a
//! mock for tests.

pub mod camera;
pub mod ffmpeg;
pub mod processor;

use std::path::PathBuf;

use colloquy_core::config::MediaConfig;

pub use camera::{
    CameraCapture, CameraManager, CaptureAction, CaptureTrigger, FrameSource, MockFrameSource,
    PreviewSink,
};
pub use ffmpeg::FfmpegCamera;
pub use processor::{ImageProcessor, SUPPORTED_EXTENSIONS};

/// Directory for derived images and captures.
///
/// An empty `temp_dir` resolves to `<os temp>/colloquy`.
pub fn resolve_temp_dir(config: &MediaConfig) -> PathBuf {
    if config.temp_dir.is_empty() {
        std::env::temp_dir().join("colloquy")
    } else {
        PathBuf::from(&config.temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_temp_dir() {
        let mut config = MediaConfig::default();
        assert_eq!(resolve_temp_dir(&config), std::env::temp_dir().join("colloquy"));

        config.temp_dir = "/var/tmp/chat".to_string();
        assert_eq!(resolve_temp_dir(&config), PathBuf::from("/var/tmp/chat"));
    }
}
