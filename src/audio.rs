//! Microphone acquisition. Wraps the system input device so the rest of the
//! booth can ask for "speech-ready" samples without touching cpal or thinking
//! about sample rates, and turns a finished session into a WAV blob.

use crate::logging::log_debug;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use hound::{SampleFormat as WavSampleFormat, WavSpec, WavWriter};
use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Target format for transcription (mono channel, 16 kHz sample rate).
/// The Whisper model requires mono audio at 16 kHz for accurate transcription.
pub const TARGET_RATE: u32 = 16_000;
pub const TARGET_CHANNELS: u32 = 1;

/// How often the capture thread flushes device samples into the session buffer.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Session audio accumulator shared between the capture thread, the live
/// transcription worker, and the blob encoder.
pub type SharedSamples = Arc<Mutex<Vec<f32>>>;

/// Wraps the system input device abstraction.
pub struct Recorder {
    device: cpal::Device,
}

impl Recorder {
    /// List microphone names so the CLI can expose a human-friendly selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Create a recorder, optionally forcing a specific device so users can
    /// pick the right microphone when a laptop exposes multiple inputs.
    pub fn new(preferred_device: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => {
                let mut devices = host.input_devices().context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };
        Ok(Self { device })
    }

    /// Get the name of the active recording device.
    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }
}

/// The audio half of the media stream: either a real microphone or a
/// deterministic synthetic feed for headless machines and tests.
pub enum AudioFeed {
    Device(Recorder),
    Synthetic,
}

impl AudioFeed {
    pub fn name(&self) -> String {
        match self {
            AudioFeed::Device(recorder) => recorder.device_name(),
            AudioFeed::Synthetic => "synthetic tone".to_string(),
        }
    }

    /// Begin appending 16 kHz mono samples to `sink` until the returned
    /// handle is finalized. Construction failures (no device config, stream
    /// refused) are reported here, not from inside the worker.
    pub fn start_capture(&self, sink: SharedSamples) -> Result<CaptureHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let handle = match self {
            AudioFeed::Device(recorder) => {
                let device = recorder.device.clone();
                let stop_flag = stop.clone();
                thread::spawn(move || device_capture_loop(device, sink, stop_flag, ready_tx))
            }
            AudioFeed::Synthetic => {
                let stop_flag = stop.clone();
                thread::spawn(move || synthetic_capture_loop(sink, stop_flag, ready_tx))
            }
        };

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(CaptureHandle {
                stop,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
                Err(anyhow!("audio capture did not start in time"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(anyhow!("audio capture thread exited before starting"))
            }
        }
    }
}

/// Stop handle for a running capture. `finalize` is the awaited teardown:
/// once it returns, every captured sample has landed in the session buffer.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn finalize(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("audio capture thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn device_capture_loop(
    device: cpal::Device,
    sink: SharedSamples,
    stop: Arc<AtomicBool>,
    ready: Sender<Result<()>>,
) {
    let default_config = match device.default_input_config() {
        Ok(config) => config,
        Err(err) => {
            let _ = ready.send(Err(anyhow!("no default input config: {err}")));
            return;
        }
    };
    let format = default_config.sample_format();
    let device_config: StreamConfig = default_config.into();
    let device_rate = device_config.sample_rate.0;
    let channels = usize::from(device_config.channels.max(1));

    log_debug(&format!(
        "audio capture: format={format:?} sample_rate={device_rate}Hz channels={channels}"
    ));

    // cpal delivers samples on a callback thread; stage them here and drain
    // on our own cadence so the callback stays tiny.
    let pending: SharedSamples = Arc::new(Mutex::new(Vec::new()));
    let err_fn = |err| log_debug(&format!("audio_stream_error: {err}"));

    let stream = {
        let pending = pending.clone();
        let built = match format {
            SampleFormat::F32 => device.build_input_stream(
                &device_config,
                move |data: &[f32], _| {
                    if let Ok(mut buf) = pending.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| sample);
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &device_config,
                move |data: &[i16], _| {
                    if let Ok(mut buf) = pending.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| {
                            sample as f32 / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &device_config,
                move |data: &[u16], _| {
                    if let Ok(mut buf) = pending.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| {
                            (sample as f32 - 32_768.0_f32) / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            ),
            other => {
                let _ = ready.send(Err(anyhow!("unsupported sample format: {other:?}")));
                return;
            }
        };
        match built {
            Ok(stream) => stream,
            Err(err) => {
                let _ = ready.send(Err(anyhow!("failed to open audio stream: {err}")));
                return;
            }
        }
    };

    if let Err(err) = stream.play() {
        let _ = ready.send(Err(anyhow!("failed to start audio stream: {err}")));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(DRAIN_INTERVAL);
        drain_pending(&pending, &sink, device_rate);
    }

    if let Err(err) = stream.pause() {
        log_debug(&format!("failed to pause audio stream: {err}"));
    }
    drop(stream);
    // Final flush so nothing captured before the stop flag is lost.
    drain_pending(&pending, &sink, device_rate);
}

/// Move staged device-rate samples into the shared 16 kHz session buffer.
fn drain_pending(pending: &SharedSamples, sink: &SharedSamples, device_rate: u32) {
    let chunk: Vec<f32> = {
        let mut guard = pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    };
    if chunk.is_empty() {
        return;
    }
    let resampled = resample_to_target_rate(&chunk, device_rate);
    let mut out = sink.lock().unwrap_or_else(|e| e.into_inner());
    out.extend_from_slice(&resampled);
}

/// Deterministic 440 Hz tone feed used by `--synthetic-media` and tests.
fn synthetic_capture_loop(sink: SharedSamples, stop: Arc<AtomicBool>, ready: Sender<Result<()>>) {
    let _ = ready.send(Ok(()));
    let samples_per_slice = (TARGET_RATE as u64 * DRAIN_INTERVAL.as_millis() as u64 / 1000) as usize;
    let mut phase = 0.0_f32;
    let step = 2.0 * PI * 440.0 / TARGET_RATE as f32;
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(DRAIN_INTERVAL);
        let mut slice = Vec::with_capacity(samples_per_slice);
        for _ in 0..samples_per_slice {
            slice.push(phase.sin() * 0.25);
            phase += step;
            if phase > 2.0 * PI {
                phase -= 2.0 * PI;
            }
        }
        let mut out = sink.lock().unwrap_or_else(|e| e.into_inner());
        out.extend_from_slice(&slice);
    }
}

/// Downmix multi-channel input to mono while applying the provided converter
/// so the pipeline receives a single channel regardless of the mic layout.
fn append_downmixed_samples<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    // Average each interleaved frame to produce a mono representation.
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

fn resample_to_target_rate(input: &[f32], device_rate: u32) -> Vec<f32> {
    if device_rate == 0 || input.is_empty() || device_rate == TARGET_RATE {
        return input.to_vec();
    }
    let ratio = TARGET_RATE as f32 / device_rate as f32;
    resample_linear(input, ratio)
}

/// Lightweight linear resampler; works well for short speech snippets where
/// phase accuracy matters less than latency.
fn resample_linear(input: &[f32], ratio: f32) -> Vec<f32> {
    let input_len = input.len();
    let output_len = (input_len as f32 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f32 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = src_idx - idx as f32;

        if idx + 1 < input_len {
            let sample = input[idx] * (1.0 - frac) + input[idx + 1] * frac;
            output.push(sample);
        } else if idx < input_len {
            output.push(input[idx]);
        } else {
            let pad = input.last().copied().unwrap_or(0.0);
            output.push(pad);
        }
    }

    output
}

/// Encode the session samples as a 16-bit PCM WAV container. This is the
/// media blob the submission carries; the visual channel travels separately
/// as the JPEG frame sequence.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: TARGET_CHANNELS as u16,
        sample_rate,
        bits_per_sample: 16,
        sample_format: WavSampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            WavWriter::new(&mut cursor, spec).context("failed to start WAV container")?;
        for &sample in samples {
            let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(clamped)
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV blob")?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmixes_multi_channel_audio() {
        let mut buf = Vec::new();
        let samples = [1.0f32, -1.0, 0.5, 0.5];
        append_downmixed_samples(&mut buf, &samples, 2, |sample| sample);
        assert_eq!(buf, vec![0.0, 0.5]);
    }

    #[test]
    fn preserves_single_channel_audio() {
        let mut buf = Vec::new();
        let samples = [0.1f32, 0.2, 0.3];
        append_downmixed_samples(&mut buf, &samples, 1, |sample| sample);
        assert_eq!(buf, samples);
    }

    #[test]
    fn resample_linear_scales_length() {
        let input = vec![0.0f32, 1.0, 2.0, 3.0];
        let result = resample_linear(&input, 0.5);
        assert!(result.len() < input.len());
        assert!((result.first().copied().unwrap_or_default() - 0.0).abs() < 1e-6);
    }

    #[test]
    fn resample_is_identity_at_target_rate() {
        let input = vec![0.25f32, -0.5, 0.75];
        assert_eq!(resample_to_target_rate(&input, TARGET_RATE), input);
    }

    #[test]
    fn wav_blob_round_trips_sample_count() {
        let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.05).sin()).collect();
        let blob = wav_bytes(&samples, TARGET_RATE).expect("encoding should succeed");
        let reader = hound::WavReader::new(Cursor::new(blob)).expect("blob should parse");
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, TARGET_RATE);
        assert_eq!(reader.len() as usize, samples.len());
    }

    #[test]
    fn synthetic_feed_fills_session_buffer() {
        let buffer: SharedSamples = Arc::new(Mutex::new(Vec::new()));
        let handle = AudioFeed::Synthetic
            .start_capture(buffer.clone())
            .expect("synthetic capture should start");
        thread::sleep(Duration::from_millis(250));
        handle.finalize().expect("finalize should join cleanly");
        let captured = buffer.lock().unwrap();
        assert!(
            !captured.is_empty(),
            "synthetic feed should have produced samples"
        );
    }
}
