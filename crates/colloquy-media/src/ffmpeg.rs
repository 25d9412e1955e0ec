//! Camera frames via an ffmpeg child process.
//!
//! ffmpeg reads the platform capture device and writes raw `rgb24` frames
//! to stdout, one `width * height * 3` byte block per frame.

use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use image::RgbImage;
use tracing::{debug, warn};

use colloquy_core::config::CameraConfig;
use colloquy_core::error::{ColloquyError, Result};

use crate::camera::FrameSource;

/// ffmpeg input format for the local capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureInput {
    /// Video4Linux2, `/dev/video<index>`.
    V4l2,
    /// AVFoundation, device by index.
    AvFoundation,
    /// DirectShow, device by name (`video=<name>`).
    DirectShow,
    /// Let ffmpeg guess from the input string.
    Auto,
}

impl CaptureInput {
    pub fn platform() -> Self {
        if cfg!(target_os = "linux") {
            CaptureInput::V4l2
        } else if cfg!(target_os = "macos") {
            CaptureInput::AvFoundation
        } else if cfg!(target_os = "windows") {
            CaptureInput::DirectShow
        } else {
            CaptureInput::Auto
        }
    }

    pub fn needs_device_name(self) -> bool {
        self == CaptureInput::DirectShow
    }

    /// Input arguments for device `index` at `size` (`WxH`).
    ///
    /// `device_name` is only used by DirectShow, which cannot open a device
    /// by number.
    pub fn args(self, index: u32, size: &str, device_name: Option<&str>) -> Vec<String> {
        match self {
            CaptureInput::V4l2 => vec![
                "-f".into(),
                "v4l2".into(),
                "-video_size".into(),
                size.into(),
                "-i".into(),
                format!("/dev/video{}", index),
            ],
            CaptureInput::AvFoundation => vec![
                "-f".into(),
                "avfoundation".into(),
                "-framerate".into(),
                "30".into(),
                "-video_size".into(),
                size.into(),
                "-i".into(),
                index.to_string(),
            ],
            CaptureInput::DirectShow => vec![
                "-f".into(),
                "dshow".into(),
                "-video_size".into(),
                size.into(),
                "-i".into(),
                format!("video={}", device_name.unwrap_or_default()),
            ],
            CaptureInput::Auto => vec!["-i".into(), index.to_string()],
        }
    }
}

/// Video device names from `ffmpeg -list_devices true -f dshow -i dummy`.
///
/// Handles both the `"Name" (video)` form of newer builds and the older
/// sectioned listing. Alternative names are skipped.
pub fn parse_dshow_devices(listing: &str) -> Vec<String> {
    let mut in_video_section = false;
    let mut names = Vec::new();
    for line in listing.lines() {
        if line.contains("DirectShow video devices") {
            in_video_section = true;
            continue;
        }
        if line.contains("DirectShow audio devices") {
            in_video_section = false;
            continue;
        }
        if line.contains("Alternative name") {
            continue;
        }
        let quoted = line
            .split_once('"')
            .and_then(|(_, rest)| rest.split_once('"'));
        let Some((name, tail)) = quoted else { continue };
        let is_video = if tail.contains("(video)") {
            true
        } else if tail.contains("(audio)") {
            false
        } else {
            in_video_section
        };
        if is_video && !name.is_empty() {
            names.push(name.to_string());
        }
    }
    names
}

/// Frame source that spawns ffmpeg on `open` and kills it on `release`.
#[derive(Debug)]
pub struct FfmpegCamera {
    program: String,
    input: CaptureInput,
    index: u32,
    device_name: Option<String>,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
}

impl FfmpegCamera {
    pub fn new(index: u32, config: &CameraConfig) -> Self {
        Self::with_input(CaptureInput::platform(), index, config)
    }

    pub fn with_input(input: CaptureInput, index: u32, config: &CameraConfig) -> Self {
        Self {
            program: config.ffmpeg_program.clone(),
            input,
            index,
            device_name: Some(config.device_name.clone()).filter(|n| !n.trim().is_empty()),
            width: config.width,
            height: config.height,
            child: None,
            stdout: None,
        }
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn command_args(&self, device_name: Option<&str>) -> Vec<String> {
        let size = format!("{}x{}", self.width, self.height);
        let mut args = vec!["-loglevel".to_string(), "error".to_string()];
        args.extend(self.input.args(self.index, &size, device_name));
        args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-vf"].map(String::from));
        args.push(format!("scale={}:{}", self.width, self.height));
        args.push("-".to_string());
        args
    }

    /// Configured device name, or the `index`-th DirectShow video device.
    fn resolve_device_name(&self) -> Result<String> {
        if let Some(name) = &self.device_name {
            return Ok(name.clone());
        }
        let output = Command::new(&self.program)
            .args(["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ColloquyError::Camera(format!("Failed to start {}: {}", self.program, e)))?;
        // ffmpeg prints the listing on stderr and exits non-zero for `dummy`.
        let listing = String::from_utf8_lossy(&output.stderr);
        parse_dshow_devices(&listing)
            .into_iter()
            .nth(self.index as usize)
            .ok_or_else(|| {
                ColloquyError::Camera(format!("No video capture device at index {}", self.index))
            })
    }
}

impl FrameSource for FfmpegCamera {
    fn open(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let device_name = if self.input.needs_device_name() {
            Some(self.resolve_device_name()?)
        } else {
            None
        };
        let args = self.command_args(device_name.as_deref());
        debug!(program = %self.program, ?args, "Starting camera process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ColloquyError::Camera(format!("Failed to start {}: {}", self.program, e)))?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let len = self.frame_len();
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| ColloquyError::Camera("Camera not open".to_string()))?;

        let mut buf = vec![0u8; len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => Ok(RgbImage::from_raw(self.width, self.height, buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(ColloquyError::Camera(format!("Frame read failed: {}", e))),
        }
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Camera process already exited");
            }
            if let Err(e) = child.wait() {
                warn!(error = %e, "Failed to reap camera process");
            }
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.release();
    }
}
