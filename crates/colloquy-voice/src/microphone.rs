//! Microphone input.
//!
//! Provides the `Microphone` trait for blocking reads of mono PCM chunks,
//! `MicrophoneProvider` for device enumeration, scripted mocks for testing,
//! and `SystemMicrophones` backed by cpal when the `microphone` feature is
//! enabled.

use std::collections::VecDeque;

use colloquy_core::error::{ColloquyError, Result};

/// Sample rate used for recognition.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per chunk handed to the endpointer (100 ms at 16 kHz).
pub const CHUNK_SAMPLES: usize = 1_600;

/// A source of mono f32 PCM in [-1.0, 1.0].
pub trait Microphone: Send {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    /// Block until the next chunk of samples is available.
    fn read_chunk(&mut self) -> Result<Vec<f32>>;
}

/// Enumerates and opens input devices.
pub trait MicrophoneProvider: Send + Sync {
    /// Device names, indexed by position.
    fn list(&self) -> Result<Vec<String>>;

    /// Open a device by index, or the default device for `None`.
    fn open(&self, index: Option<usize>) -> Result<Box<dyn Microphone>>;
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Scripted microphone for testing.
///
/// Plays back queued segments of silence and tone in 100 ms chunks, then
/// silence forever.
#[derive(Debug, Clone)]
pub struct MockMicrophone {
    name: String,
    script: VecDeque<Vec<f32>>,
    failing: bool,
    chunks_read: usize,
}

impl MockMicrophone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: VecDeque::new(),
            failing: false,
            chunks_read: 0,
        }
    }

    /// A microphone whose reads always fail.
    pub fn broken() -> Self {
        Self {
            failing: true,
            ..Self::new("broken")
        }
    }

    /// Queue `secs` of silence.
    pub fn with_silence(self, secs: f32) -> Self {
        self.with_level(secs, 0.0)
    }

    /// Queue `secs` of a constant-amplitude signal, loud enough to count as
    /// speech at the default threshold.
    pub fn with_speech(self, secs: f32) -> Self {
        self.with_level(secs, 0.5)
    }

    /// Queue `secs` of samples at `amplitude`, alternating sign.
    pub fn with_level(mut self, secs: f32, amplitude: f32) -> Self {
        let chunks = (secs * 10.0).round() as usize;
        for _ in 0..chunks {
            let chunk = (0..CHUNK_SAMPLES)
                .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
                .collect();
            self.script.push_back(chunk);
        }
        self
    }

    pub fn chunks_read(&self) -> usize {
        self.chunks_read
    }
}

impl Microphone for MockMicrophone {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        TARGET_SAMPLE_RATE
    }

    fn read_chunk(&mut self) -> Result<Vec<f32>> {
        if self.failing {
            return Err(ColloquyError::Audio("Mock microphone failure".to_string()));
        }
        self.chunks_read += 1;
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| vec![0.0; CHUNK_SAMPLES]))
    }
}

/// Provider over a fixed list of mock devices.
#[derive(Debug, Clone)]
pub struct MockMicrophoneProvider {
    devices: Vec<MockMicrophone>,
}

impl MockMicrophoneProvider {
    pub fn new(devices: Vec<MockMicrophone>) -> Self {
        Self { devices }
    }
}

impl MicrophoneProvider for MockMicrophoneProvider {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.devices.iter().map(|d| d.name.clone()).collect())
    }

    fn open(&self, index: Option<usize>) -> Result<Box<dyn Microphone>> {
        let index = index.unwrap_or(0);
        self.devices
            .get(index)
            .cloned()
            .map(|d| Box::new(d) as Box<dyn Microphone>)
            .ok_or_else(|| ColloquyError::Audio(format!("No microphone at index {}", index)))
    }
}

// =============================================================================
// System devices
// =============================================================================

/// Input devices of the default audio host.
#[derive(Debug, Clone, Default)]
pub struct SystemMicrophones;

#[cfg(not(feature = "microphone"))]
impl MicrophoneProvider for SystemMicrophones {
    fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn open(&self, _index: Option<usize>) -> Result<Box<dyn Microphone>> {
        Err(ColloquyError::Audio(
            "Built without microphone support (enable the `microphone` feature)".to_string(),
        ))
    }
}

#[cfg(feature = "microphone")]
pub use system::CpalMicrophone;

#[cfg(feature = "microphone")]
mod system {
    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::{debug, error, info};

    use colloquy_core::error::{ColloquyError, Result};

    use super::{Microphone, MicrophoneProvider, SystemMicrophones, CHUNK_SAMPLES, TARGET_SAMPLE_RATE};

    /// Longest wait for a chunk before the device is considered stalled.
    const READ_TIMEOUT: Duration = Duration::from_secs(2);
    /// Samples kept when the reader falls behind (5 s).
    const MAX_BUFFERED: usize = TARGET_SAMPLE_RATE as usize * 5;

    /// Samples shared between the cpal callback thread and the reader.
    #[derive(Default)]
    struct SampleQueue {
        samples: Mutex<VecDeque<f32>>,
        ready: Condvar,
    }

    /// Keeps the cpal stream alive; dropping it stops capture.
    struct SendStream(#[allow(dead_code)] cpal::Stream);

    // SAFETY: the stream handle is only stored and dropped, never used from
    // two threads at once; callbacks run on cpal's own audio thread.
    unsafe impl Send for SendStream {}

    /// Microphone capture through cpal, downmixed and resampled to 16 kHz mono.
    pub struct CpalMicrophone {
        name: String,
        queue: Arc<SampleQueue>,
        _stream: SendStream,
    }

    impl CpalMicrophone {
        fn start(device: cpal::Device) -> Result<Self> {
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());
            let supported = device
                .default_input_config()
                .map_err(|e| ColloquyError::Audio(format!("No input config for {}: {}", name, e)))?;
            let config: cpal::StreamConfig = supported.config();
            let device_rate = config.sample_rate.0;
            let channels = config.channels as usize;
            info!(device = %name, device_rate, channels, "Opening microphone");

            let queue = Arc::new(SampleQueue::default());
            let sink = Arc::clone(&queue);
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono = downmix(data, channels);
                        let resampled = resample(&mono, device_rate, TARGET_SAMPLE_RATE);
                        if let Ok(mut buf) = sink.samples.lock() {
                            buf.extend(resampled);
                            if buf.len() > MAX_BUFFERED {
                                let excess = buf.len() - MAX_BUFFERED;
                                buf.drain(..excess);
                            }
                            sink.ready.notify_one();
                        }
                    },
                    |err| error!("Microphone stream error: {}", err),
                    None,
                )
                .map_err(|e| ColloquyError::Audio(format!("Failed to build input stream: {}", e)))?;
            stream
                .play()
                .map_err(|e| ColloquyError::Audio(format!("Failed to start input stream: {}", e)))?;

            Ok(Self {
                name,
                queue,
                _stream: SendStream(stream),
            })
        }
    }

    impl Microphone for CpalMicrophone {
        fn name(&self) -> &str {
            &self.name
        }

        fn sample_rate(&self) -> u32 {
            TARGET_SAMPLE_RATE
        }

        fn read_chunk(&mut self) -> Result<Vec<f32>> {
            let guard = self
                .queue
                .samples
                .lock()
                .map_err(|_| ColloquyError::Audio("Sample queue poisoned".to_string()))?;
            let (mut buf, timeout) = self
                .queue
                .ready
                .wait_timeout_while(guard, READ_TIMEOUT, |buf| buf.len() < CHUNK_SAMPLES)
                .map_err(|_| ColloquyError::Audio("Sample queue poisoned".to_string()))?;
            if timeout.timed_out() {
                return Err(ColloquyError::Audio(format!(
                    "Microphone {} stopped delivering audio",
                    self.name
                )));
            }
            Ok(buf.drain(..CHUNK_SAMPLES).collect())
        }
    }

    fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
        if channels <= 1 {
            return data.to_vec();
        }
        data.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Linear interpolation resampler.
    fn resample(mono: &[f32], from: u32, to: u32) -> Vec<f32> {
        if from == to || mono.is_empty() {
            return mono.to_vec();
        }
        let ratio = from as f64 / to as f64;
        let out_len = (mono.len() as f64 / ratio).ceil() as usize;
        (0..out_len)
            .map(|i| {
                let src = i as f64 * ratio;
                let idx0 = (src.floor() as usize).min(mono.len() - 1);
                let idx1 = (idx0 + 1).min(mono.len() - 1);
                let frac = (src - idx0 as f64) as f32;
                mono[idx0] * (1.0 - frac) + mono[idx1] * frac
            })
            .collect()
    }

    impl MicrophoneProvider for SystemMicrophones {
        fn list(&self) -> Result<Vec<String>> {
            let host = cpal::default_host();
            let devices = host
                .input_devices()
                .map_err(|e| ColloquyError::Audio(format!("Failed to enumerate devices: {}", e)))?;
            Ok(devices
                .map(|d| d.name().unwrap_or_else(|_| "unknown".to_string()))
                .collect())
        }

        fn open(&self, index: Option<usize>) -> Result<Box<dyn Microphone>> {
            let host = cpal::default_host();
            let device = match index {
                None => host
                    .default_input_device()
                    .ok_or_else(|| ColloquyError::Audio("No default input device found".into()))?,
                Some(i) => host
                    .input_devices()
                    .map_err(|e| ColloquyError::Audio(format!("Failed to enumerate devices: {}", e)))?
                    .nth(i)
                    .ok_or_else(|| ColloquyError::Audio(format!("No microphone at index {}", i)))?,
            };
            debug!(?index, "Selected input device");
            Ok(Box::new(CpalMicrophone::start(device)?))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_downmix_stereo() {
            assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        }

        #[test]
        fn test_resample_halves_length() {
            let input = vec![0.0f32; 32_000];
            assert_eq!(resample(&input, 32_000, 16_000).len(), 16_000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_microphone_script_then_silence() {
        let mut mic = MockMicrophone::new("mock").with_speech(0.2);
        let first = mic.read_chunk().unwrap();
        assert_eq!(first.len(), CHUNK_SAMPLES);
        assert_eq!(first[0], 0.5);
        mic.read_chunk().unwrap();
        let after = mic.read_chunk().unwrap();
        assert!(after.iter().all(|s| *s == 0.0));
        assert_eq!(mic.chunks_read(), 3);
    }

    #[test]
    fn test_broken_microphone() {
        let mut mic = MockMicrophone::broken();
        assert!(matches!(mic.read_chunk(), Err(ColloquyError::Audio(_))));
    }

    #[test]
    fn test_mock_provider() {
        let provider = MockMicrophoneProvider::new(vec![
            MockMicrophone::new("Built-in"),
            MockMicrophone::new("USB Headset"),
        ]);
        assert_eq!(provider.list().unwrap(), vec!["Built-in", "USB Headset"]);
        assert_eq!(provider.open(Some(1)).unwrap().name(), "USB Headset");
        assert_eq!(provider.open(None).unwrap().name(), "Built-in");
        assert!(provider.open(Some(5)).is_err());
    }

    #[cfg(not(feature = "microphone"))]
    #[test]
    fn test_system_microphones_without_feature() {
        assert!(SystemMicrophones.list().unwrap().is_empty());
        assert!(SystemMicrophones.open(None).is_err());
    }
}
