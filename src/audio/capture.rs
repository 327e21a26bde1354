//! Microphone capture
//!
//! The cpal stream is built and kept alive on its own thread (streams are not
//! `Send` on every host). The input callback downmixes to mono i16 and pushes
//! straight into the microphone bus. Devices delivering `i16`, `u16` or `f32`
//! are supported.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::engine::SourceFeed;
use crate::error::AudioError;

/// Running microphone capture. Dropping it stops the stream and detaches the bus.
pub struct MicCapture {
    device_name: String,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    samples_captured: Arc<AtomicU64>,
}

impl MicCapture {
    /// Open the device (`input:<name>`, bare name, or default when `None`) and
    /// start feeding `feed`. Returns only once the stream is playing.
    pub fn start(
        device_id: Option<&str>,
        sample_rate: u32,
        mut feed: SourceFeed,
    ) -> Result<Self, AudioError> {
        let device = find_input_device(device_id)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = usize::from(config.channels);
        let sample_format = default_config.sample_format();

        let running = Arc::new(AtomicBool::new(true));
        let samples_captured = Arc::new(AtomicU64::new(0));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_loop = running.clone();
        let counter = samples_captured.clone();
        let handle = thread::Builder::new()
            .name("capture-mic".into())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::I16 => {
                        build_stream::<i16>(&device, &config, channels, feed, counter, error_tx)
                    }
                    SampleFormat::U16 => {
                        build_stream::<u16>(&device, &config, channels, feed, counter, error_tx)
                    }
                    SampleFormat::F32 => {
                        build_stream::<f32>(&device, &config, channels, feed, counter, error_tx)
                    }
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(
            "Capturing from '{}' at {} Hz, {} ch, {:?}",
            device_name,
            sample_rate,
            channels,
            sample_format
        );
        Ok(Self {
            device_name,
            running,
            thread_handle: Some(handle),
            error_rx,
            samples_captured,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Next stream error reported by the host, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Input stream for one native sample type, feeding the bus as mono i16
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut feed: SourceFeed,
    counter: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut mono = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                downmix_to_i16(data, channels, &mut mono);
                counter.fetch_add(mono.len() as u64, Ordering::Relaxed);
                feed.push(&mono, mono.len());
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Names of all input devices on the default host
pub fn input_device_names() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}

fn find_input_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let Some(id) = id else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()));
    };

    let name = id.strip_prefix("input:").unwrap_or(id);
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Average interleaved channels into mono i16
pub fn downmix_to_i16<T>(data: &[T], channels: usize, out: &mut Vec<i16>)
where
    T: Sample,
    f32: FromSample<T>,
{
    out.clear();
    let channels = channels.max(1);
    out.extend(data.chunks(channels).map(|frame| {
        let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
        let v = (sum / frame.len() as f32).clamp(-1.0, 1.0);
        (v * f32::from(i16::MAX)) as i16
    }));
}
