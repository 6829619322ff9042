//! Recording controller. Owns the media stream, the live transcription
//! worker, the frame sampler and the elapsed-time ticker, and enforces the
//! start/stop/clear lifecycle of a single answer take.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

use crate::audio::{self, CaptureHandle, SharedSamples};
use crate::config::CapturePipelineConfig;
use crate::face::FaceLocator;
use crate::live::LiveTranscription;
use crate::logging::log_debug;
use crate::media::MediaStream;
use crate::sampler::{
    grab_frame_once, CapturedFrame, FrameRing, FrameSampler, PreviewLoop, PreviewSink,
    SharedFrameRing, SharedLocator,
};
use crate::stt::SpeechEngine;

/// Wait after a mid-recording clear before wiping the audio accumulator,
/// so the transcription worker's in-flight pass lands on the old text
/// first and gets replaced rather than resurrected.
const CLEAR_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Recording,
}

/// Workers bound to one recording take; dropped as a unit on stop.
struct ActiveTake {
    capture: CaptureHandle,
    sampler: FrameSampler,
    ticker: Ticker,
    preview: Option<PreviewLoop>,
    generation: u64,
}

pub struct RecordingController {
    media: Option<MediaStream>,
    engine: Arc<Mutex<dyn SpeechEngine>>,
    locator: SharedLocator,
    config: CapturePipelineConfig,
    live: LiveTranscription,
    audio_buf: SharedSamples,
    ring: SharedFrameRing,
    elapsed_secs: Arc<AtomicU64>,
    manual_text: String,
    last_blob: Option<Vec<u8>>,
    take: Option<ActiveTake>,
}

impl RecordingController {
    /// `media` is `None` when device acquisition failed; the controller
    /// then refuses to record but still supports typed answers.
    pub fn new(
        media: Option<MediaStream>,
        engine: Arc<Mutex<dyn SpeechEngine>>,
        locator: FaceLocator,
        config: CapturePipelineConfig,
    ) -> Self {
        Self {
            media,
            engine,
            locator: Arc::new(Mutex::new(locator)),
            config,
            live: LiveTranscription::new(),
            audio_buf: Arc::new(Mutex::new(Vec::new())),
            ring: Arc::new(Mutex::new(FrameRing::new())),
            elapsed_secs: Arc::new(AtomicU64::new(0)),
            manual_text: String::new(),
            last_blob: None,
            take: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.take.is_some() {
            ControllerState::Recording
        } else {
            ControllerState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.take.is_some()
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_secs.load(Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> usize {
        self.ring.lock().map(|ring| ring.len()).unwrap_or(0)
    }

    /// The text that would be submitted right now: the live transcript while
    /// recording or after a recorded take, the typed text otherwise.
    pub fn answer_text(&self) -> String {
        let transcript = self.live.snapshot();
        if self.is_recording() || !transcript.is_empty() {
            transcript
        } else {
            self.manual_text.clone()
        }
    }

    /// Replace the typed answer. Rejected while recording; the transcript
    /// is the only source of truth for a live take.
    pub fn set_manual_text(&mut self, text: &str) -> Result<()> {
        if self.is_recording() {
            bail!("the answer text is read-only while recording");
        }
        self.manual_text = text.to_string();
        Ok(())
    }

    /// Begin a new take. Everything from the previous take is discarded
    /// before any worker starts.
    pub fn start(&mut self) -> Result<()> {
        if self.is_recording() {
            bail!("already recording");
        }
        let Some(media) = self.media.as_ref() else {
            bail!("microphone and camera are unavailable; check device permissions");
        };

        self.live.reset();
        self.manual_text.clear();
        self.last_blob = None;
        self.elapsed_secs.store(0, Ordering::Relaxed);
        if let Ok(mut buf) = self.audio_buf.lock() {
            buf.clear();
        }
        let generation = {
            let mut ring = self
                .ring
                .lock()
                .map_err(|_| anyhow!("frame ring lock poisoned"))?;
            ring.advance_generation();
            ring.generation()
        };

        let capture = media.audio().start_capture(Arc::clone(&self.audio_buf))?;

        if let Err(err) = self.live.start(
            Arc::clone(&self.engine),
            Arc::clone(&self.audio_buf),
            self.config.lang.clone(),
            Duration::from_millis(self.config.stt_hop_ms),
        ) {
            if let Err(finalize_err) = capture.finalize() {
                log_debug(&format!("Audio capture cleanup failed: {finalize_err:#}"));
            }
            return Err(err);
        }

        let sampler = match FrameSampler::start(
            media.video(),
            Arc::clone(&self.locator),
            Arc::clone(&self.ring),
            self.config.crop_faces,
            generation,
            Duration::from_millis(self.config.sample_interval_ms),
        ) {
            Ok(sampler) => sampler,
            Err(err) => {
                self.live.stop();
                if let Err(finalize_err) = capture.finalize() {
                    log_debug(&format!("Audio capture cleanup failed: {finalize_err:#}"));
                }
                return Err(err);
            }
        };

        let ticker = Ticker::start(Arc::clone(&self.elapsed_secs));

        self.take = Some(ActiveTake {
            capture,
            sampler,
            ticker,
            preview: None,
            generation,
        });
        Ok(())
    }

    /// Attach a preview surface to the running take.
    pub fn attach_preview(&mut self, sink: Box<dyn PreviewSink>) -> Result<()> {
        let Some(take) = self.take.as_mut() else {
            bail!("not recording");
        };
        if take.preview.is_some() {
            bail!("a preview is already attached");
        }
        let Some(media) = self.media.as_ref() else {
            bail!("no media stream");
        };
        let preview = PreviewLoop::start(
            media.video(),
            Arc::clone(&self.locator),
            sink,
            Duration::from_millis(self.config.preview_refresh_ms),
            Duration::from_millis(self.config.preview_detect_ttl_ms),
        )?;
        take.preview = Some(preview);
        Ok(())
    }

    /// End the take: stop the periodic workers first so no new frames or
    /// ticks land while the audio is finalized, grab one last frame, then
    /// close the audio and run the final transcription pass.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut take) = self.take.take() else {
            bail!("not recording");
        };
        take.sampler.stop();
        take.ticker.stop();
        if let Some(mut preview) = take.preview.take() {
            preview.stop();
        }

        // Best effort; a take shorter than the sample interval still ends
        // with the freshest possible frame.
        if let Some(media) = self.media.as_ref() {
            if let Err(err) = grab_frame_once(
                &media.video(),
                &self.locator,
                &self.ring,
                self.config.crop_faces,
                take.generation,
            ) {
                log_debug(&format!("Final frame grab failed: {err:#}"));
            }
        }

        take.capture.finalize()?;

        let samples: Vec<f32> = self
            .audio_buf
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default();
        self.last_blob = if samples.is_empty() {
            None
        } else {
            Some(audio::wav_bytes(&samples, audio::TARGET_RATE)?)
        };

        self.live.stop();
        Ok(())
    }

    /// Take ownership of the recorded audio blob, if any.
    pub fn take_media_blob(&mut self) -> Option<Vec<u8>> {
        self.last_blob.take()
    }

    /// Drain the captured frames, oldest first.
    pub fn drain_frames(&mut self) -> Vec<CapturedFrame> {
        self.ring
            .lock()
            .map(|mut ring| ring.drain())
            .unwrap_or_default()
    }

    pub fn crop_enabled(&self) -> bool {
        self.config.crop_faces
    }

    pub fn detector_label(&self) -> &'static str {
        self.locator
            .lock()
            .map(|locator| locator.detector_label())
            .unwrap_or("none")
    }

    /// Discard the answer so far. Works both mid-recording (the take keeps
    /// running on fresh buffers) and while idle.
    pub fn clear(&mut self) {
        self.live.reset();
        self.manual_text.clear();
        self.last_blob = None;
        self.elapsed_secs.store(0, Ordering::Relaxed);
        if let Ok(mut ring) = self.ring.lock() {
            ring.advance_generation();
        }
        if let Some(take) = self.take.as_mut() {
            // Re-tag the running sampler's generation by restarting it after
            // the ring advanced; simplest is to leave it running and let its
            // stale pushes drop, but then no frames would arrive for the rest
            // of the take. Restart it under the new generation instead.
            take.sampler.stop();
            let new_generation = self
                .ring
                .lock()
                .map(|ring| ring.generation())
                .unwrap_or(take.generation + 1);
            take.generation = new_generation;
            if let Some(media) = self.media.as_ref() {
                match FrameSampler::start(
                    media.video(),
                    Arc::clone(&self.locator),
                    Arc::clone(&self.ring),
                    self.config.crop_faces,
                    new_generation,
                    Duration::from_millis(self.config.sample_interval_ms),
                ) {
                    Ok(sampler) => take.sampler = sampler,
                    Err(err) => log_debug(&format!("Sampler restart failed: {err:#}")),
                }
            }
            // Let any in-flight transcription pass finish against the old
            // audio before the buffer is wiped.
            thread::sleep(CLEAR_SETTLE_DELAY);
            if let Ok(mut buf) = self.audio_buf.lock() {
                buf.clear();
            }
            self.live.reset();
        }
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        if self.is_recording() {
            if let Err(err) = self.stop() {
                log_debug(&format!("Recording teardown failed: {err:#}"));
            }
        }
    }
}

/// Once-per-second elapsed counter for the recording timer display.
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    fn start(elapsed_secs: Arc<AtomicU64>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("elapsed-ticker".into())
            .spawn(move || {
                // Sleep in short slices so a stop request never waits out a
                // full tick; stop() joins this thread while audio capture is
                // still open, and any delay here lengthens the recording.
                'ticking: while !stop_flag.load(Ordering::Relaxed) {
                    let tick_deadline = Instant::now() + Duration::from_secs(1);
                    while Instant::now() < tick_deadline {
                        if stop_flag.load(Ordering::Relaxed) {
                            break 'ticking;
                        }
                        thread::sleep(Duration::from_millis(50));
                    }
                    elapsed_secs.fetch_add(1, Ordering::Relaxed);
                }
            })
            .ok();
        Self {
            stop,
            handle,
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_debug("Elapsed ticker panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFeed;
    use crate::config::CapturePipelineConfig;
    use crate::face::DetectorHandle;
    use crate::media::{SyntheticSource, VideoSource};

    struct EchoEngine;

    impl SpeechEngine for EchoEngine {
        fn transcribe(&self, samples: &[f32], _lang: &str) -> Result<String> {
            Ok(format!("transcript of {} samples", samples.len()))
        }
    }

    fn test_config() -> CapturePipelineConfig {
        CapturePipelineConfig {
            lang: "en".into(),
            sample_interval_ms: 100,
            preview_refresh_ms: 33,
            preview_detect_ttl_ms: 500,
            stt_hop_ms: 200,
            crop_faces: false,
        }
    }

    fn synthetic_controller() -> RecordingController {
        let video: Box<dyn VideoSource> = Box::new(SyntheticSource::new(160, 120));
        let media = MediaStream::from_parts(AudioFeed::Synthetic, video);
        RecordingController::new(
            Some(media),
            Arc::new(Mutex::new(EchoEngine)),
            FaceLocator::new(DetectorHandle::None),
            test_config(),
        )
    }

    #[test]
    fn starts_idle() {
        let controller = synthetic_controller();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.elapsed_secs(), 0);
        assert_eq!(controller.frame_count(), 0);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut controller = synthetic_controller();
        controller.start().unwrap();
        assert!(controller.start().is_err());
        controller.stop().unwrap();
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let mut controller = synthetic_controller();
        assert!(controller.stop().is_err());
    }

    #[test]
    fn start_without_media_fails_and_stays_idle() {
        let mut controller = RecordingController::new(
            None,
            Arc::new(Mutex::new(EchoEngine)),
            FaceLocator::new(DetectorHandle::None),
            test_config(),
        );
        assert!(controller.start().is_err());
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn full_take_produces_transcript_frames_and_blob() {
        let mut controller = synthetic_controller();
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(700));
        controller.stop().unwrap();

        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.frame_count() >= 1);
        let transcript = controller.answer_text();
        assert!(transcript.starts_with("transcript of"));
        let blob = controller.take_media_blob().unwrap();
        assert_eq!(&blob[..4], b"RIFF");
        assert!(controller.take_media_blob().is_none());
    }

    #[test]
    fn manual_text_is_read_only_while_recording() {
        let mut controller = synthetic_controller();
        controller.set_manual_text("typed answer").unwrap();
        assert_eq!(controller.answer_text(), "typed answer");
        controller.start().unwrap();
        assert!(controller.set_manual_text("nope").is_err());
        controller.stop().unwrap();
    }

    #[test]
    fn start_discards_previous_manual_text() {
        let mut controller = synthetic_controller();
        controller.set_manual_text("typed answer").unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        assert_ne!(controller.answer_text(), "typed answer");
    }

    #[test]
    fn clear_while_idle_drops_everything() {
        let mut controller = synthetic_controller();
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(400));
        controller.stop().unwrap();
        controller.clear();
        assert!(controller.answer_text().is_empty());
        assert_eq!(controller.frame_count(), 0);
        assert!(controller.take_media_blob().is_none());
    }

    #[test]
    fn clear_after_stop_resets_elapsed_time() {
        let mut controller = synthetic_controller();
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(1_300));
        controller.stop().unwrap();
        assert!(controller.elapsed_secs() >= 1);
        controller.clear();
        assert_eq!(controller.elapsed_secs(), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut controller = synthetic_controller();
        controller.clear();
        controller.clear();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.answer_text().is_empty());
    }

    #[test]
    fn preview_attaches_only_while_recording() {
        use crate::media::Frame;
        use crate::sampler::PreviewSink;

        struct CountingSink(Arc<Mutex<u32>>);
        impl PreviewSink for CountingSink {
            fn present(&mut self, _frame: &Frame, _face: Option<crate::face::FaceBox>) {
                if let Ok(mut count) = self.0.lock() {
                    *count += 1;
                }
            }
        }

        let frames_shown = Arc::new(Mutex::new(0));
        let mut controller = synthetic_controller();
        assert!(controller
            .attach_preview(Box::new(CountingSink(Arc::clone(&frames_shown))))
            .is_err());
        controller.start().unwrap();
        controller
            .attach_preview(Box::new(CountingSink(Arc::clone(&frames_shown))))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        controller.stop().unwrap();
        assert!(*frames_shown.lock().unwrap() >= 1);
    }

    #[test]
    fn clear_while_recording_keeps_take_running() {
        let mut controller = synthetic_controller();
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(400));
        controller.clear();
        assert_eq!(controller.state(), ControllerState::Recording);
        thread::sleep(Duration::from_millis(400));
        controller.stop().unwrap();
        // The take continued after the clear, so fresh frames and audio exist.
        assert!(controller.frame_count() >= 1);
        assert!(controller.take_media_blob().is_some());
    }
}
