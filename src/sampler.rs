//! Periodic frame capture during a recording. A sampler worker grabs a frame
//! right after start and then on a fixed cadence, runs face location and
//! cropping, and pushes JPEG-encoded results into a bounded ring. A separate
//! preview loop feeds the on-screen self-view at a faster cadence, reusing
//! the last face box between full detections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::face::{crop_frame, crop_region, FaceLocator};
use crate::logging::log_debug;
use crate::media::{Frame, SharedVideoSource};

/// Only the newest frames matter for grading; older ones are evicted.
pub const FRAME_CAPACITY: usize = 10;

/// Sleep slice used to poll the stop flag inside long waits.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before the immediate first grab, giving the camera a moment to
/// deliver a properly exposed frame.
const FIRST_GRAB_DELAY: Duration = Duration::from_millis(150);

/// A frame as it will be submitted: JPEG bytes plus pixel dimensions.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Bounded FIFO of captured frames with a generation counter. Frames tagged
/// with an older generation are dropped on push, so a worker that outlives a
/// clear cannot leak frames from the previous take into the next one.
pub struct FrameRing {
    frames: VecDeque<CapturedFrame>,
    generation: u64,
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(FRAME_CAPACITY),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Push a frame tagged with the generation it was captured under.
    /// Returns false when the frame was stale and dropped.
    pub fn push(&mut self, frame: CapturedFrame, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        if self.frames.len() >= FRAME_CAPACITY {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        true
    }

    /// Discard all frames and invalidate any in-flight captures.
    pub fn advance_generation(&mut self) {
        self.frames.clear();
        self.generation += 1;
    }

    /// Take the frames, oldest first, leaving the ring empty.
    pub fn drain(&mut self) -> Vec<CapturedFrame> {
        self.frames.drain(..).collect()
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedFrameRing = Arc<Mutex<FrameRing>>;
pub type SharedLocator = Arc<Mutex<FaceLocator>>;

/// Grab one frame from the source, crop it around the face when enabled,
/// and push the JPEG into the ring under the given generation.
pub fn grab_frame_once(
    video: &SharedVideoSource,
    locator: &SharedLocator,
    ring: &SharedFrameRing,
    crop_enabled: bool,
    generation: u64,
) -> Result<()> {
    let frame = {
        let mut source = video
            .lock()
            .map_err(|_| anyhow!("video source lock poisoned"))?;
        source.grab()?
    };
    let prepared = prepare_frame(&frame, locator, crop_enabled)?;
    let jpeg = prepared.encode_jpeg()?;
    let captured = CapturedFrame {
        jpeg,
        width: prepared.width(),
        height: prepared.height(),
    };
    let mut ring = ring
        .lock()
        .map_err(|_| anyhow!("frame ring lock poisoned"))?;
    ring.push(captured, generation);
    Ok(())
}

fn prepare_frame(frame: &Frame, locator: &SharedLocator, crop_enabled: bool) -> Result<Frame> {
    if !crop_enabled {
        return Ok(frame.clone());
    }
    let face = {
        let mut locator = locator
            .lock()
            .map_err(|_| anyhow!("face locator lock poisoned"))?;
        locator.locate(frame)
    };
    let region = crop_region(frame.width(), frame.height(), face);
    crop_frame(frame, region)
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            log_debug("Capture worker panicked");
        }
    }
}

/// Periodic frame sampler bound to one recording take.
pub struct FrameSampler {
    worker: Option<Worker>,
}

impl FrameSampler {
    /// Spawn the sampler. The first grab happens almost immediately so even
    /// a recording stopped within the first interval has a frame.
    pub fn start(
        video: SharedVideoSource,
        locator: SharedLocator,
        ring: SharedFrameRing,
        crop_enabled: bool,
        generation: u64,
        interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("frame-sampler".into())
            .spawn(move || {
                sampler_loop(video, locator, ring, crop_enabled, generation, interval, stop_flag);
            })
            .map_err(|e| anyhow!("failed to spawn frame sampler: {e}"))?;
        Ok(Self {
            worker: Some(Worker { stop, handle }),
        })
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampler_loop(
    video: SharedVideoSource,
    locator: SharedLocator,
    ring: SharedFrameRing,
    crop_enabled: bool,
    generation: u64,
    interval: Duration,
    stop: Arc<AtomicBool>,
) {
    if sleep_until_stopped(FIRST_GRAB_DELAY, &stop) {
        return;
    }
    if let Err(err) = grab_frame_once(&video, &locator, &ring, crop_enabled, generation) {
        log_debug(&format!("Initial frame grab failed: {err:#}"));
    }
    loop {
        if sleep_until_stopped(interval, &stop) {
            return;
        }
        if let Err(err) = grab_frame_once(&video, &locator, &ring, crop_enabled, generation) {
            log_debug(&format!("Frame grab failed: {err:#}"));
        }
    }
}

/// Sleep in short slices, returning true as soon as stop is requested.
fn sleep_until_stopped(total: Duration, stop: &Arc<AtomicBool>) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return stop.load(Ordering::Relaxed);
        }
        thread::sleep(remaining.min(STOP_POLL_INTERVAL));
    }
}

/// Consumer of preview frames, typically a UI surface.
pub trait PreviewSink: Send {
    fn present(&mut self, frame: &Frame, face: Option<crate::face::FaceBox>);
}

/// Fast self-view loop. Full face detection is expensive, so between
/// detections the loop reuses the locator's cached box until it ages past
/// the configured TTL.
pub struct PreviewLoop {
    worker: Option<Worker>,
}

impl PreviewLoop {
    pub fn start(
        video: SharedVideoSource,
        locator: SharedLocator,
        sink: Box<dyn PreviewSink>,
        refresh: Duration,
        detect_ttl: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("preview".into())
            .spawn(move || {
                preview_loop(video, locator, sink, refresh, detect_ttl, stop_flag);
            })
            .map_err(|e| anyhow!("failed to spawn preview loop: {e}"))?;
        Ok(Self {
            worker: Some(Worker { stop, handle }),
        })
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for PreviewLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn preview_loop(
    video: SharedVideoSource,
    locator: SharedLocator,
    mut sink: Box<dyn PreviewSink>,
    refresh: Duration,
    detect_ttl: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut last_detect: Option<Instant> = None;
    loop {
        if sleep_until_stopped(refresh, &stop) {
            return;
        }
        let frame = {
            let Ok(mut source) = video.lock() else { return };
            match source.grab() {
                Ok(frame) => frame,
                Err(err) => {
                    log_debug(&format!("Preview grab failed: {err:#}"));
                    continue;
                }
            }
        };
        let stale = last_detect.map_or(true, |at| at.elapsed() >= detect_ttl);
        let face = {
            let Ok(mut locator) = locator.lock() else { return };
            if stale {
                last_detect = Some(Instant::now());
                locator.locate(&frame)
            } else {
                locator.last_box()
            }
        };
        sink.present(&frame, face);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{DetectorHandle, FaceBox, FaceDetector, FaceLocator, CROP_SIZE};
    use crate::media::{SyntheticSource, VideoSource};

    struct FixedDetector(FaceBox);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Option<FaceBox>> {
            Ok(Some(self.0))
        }
    }

    fn captured(n: u8) -> CapturedFrame {
        CapturedFrame {
            jpeg: vec![n; 4],
            width: 2,
            height: 2,
        }
    }

    fn shared_video(w: u32, h: u32) -> SharedVideoSource {
        Arc::new(Mutex::new(
            Box::new(SyntheticSource::new(w, h)) as Box<dyn VideoSource>
        ))
    }

    fn shared_locator(handle: DetectorHandle) -> SharedLocator {
        Arc::new(Mutex::new(FaceLocator::new(handle)))
    }

    #[test]
    fn ring_keeps_only_newest_frames() {
        let mut ring = FrameRing::new();
        for i in 0..15 {
            assert!(ring.push(captured(i), 0));
        }
        assert_eq!(ring.len(), FRAME_CAPACITY);
        let frames = ring.drain();
        assert_eq!(frames.first().map(|f| f.jpeg[0]), Some(5));
        assert_eq!(frames.last().map(|f| f.jpeg[0]), Some(14));
        assert!(ring.is_empty());
    }

    #[test]
    fn stale_generation_frames_are_dropped() {
        let mut ring = FrameRing::new();
        assert!(ring.push(captured(1), 0));
        ring.advance_generation();
        assert!(ring.is_empty());
        // A worker still running with the old tag cannot pollute the new take.
        assert!(!ring.push(captured(2), 0));
        assert!(ring.push(captured(3), 1));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn grab_produces_cropped_jpeg() {
        let video = shared_video(640, 480);
        let locator = shared_locator(DetectorHandle::with_native(Box::new(FixedDetector(
            FaceBox {
                x: 200.0,
                y: 150.0,
                width: 120.0,
                height: 120.0,
            },
        ))));
        let ring: SharedFrameRing = Arc::new(Mutex::new(FrameRing::new()));
        grab_frame_once(&video, &locator, &ring, true, 0).unwrap();
        let frames = ring.lock().unwrap().drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].width, CROP_SIZE);
        assert_eq!(frames[0].height, CROP_SIZE);
        assert_eq!(&frames[0].jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn grab_without_crop_keeps_full_resolution() {
        let video = shared_video(320, 240);
        let locator = shared_locator(DetectorHandle::None);
        let ring: SharedFrameRing = Arc::new(Mutex::new(FrameRing::new()));
        grab_frame_once(&video, &locator, &ring, false, 0).unwrap();
        let frames = ring.lock().unwrap().drain();
        assert_eq!(frames[0].width, 320);
        assert_eq!(frames[0].height, 240);
    }

    #[test]
    fn sampler_grabs_immediately_then_on_cadence() {
        let video = shared_video(160, 120);
        let locator = shared_locator(DetectorHandle::None);
        let ring: SharedFrameRing = Arc::new(Mutex::new(FrameRing::new()));
        let mut sampler = FrameSampler::start(
            Arc::clone(&video),
            locator,
            Arc::clone(&ring),
            false,
            0,
            Duration::from_secs(60),
        )
        .unwrap();
        // Wait out the first-grab delay; the cadence grab is a minute away.
        thread::sleep(Duration::from_millis(600));
        sampler.stop();
        assert_eq!(ring.lock().unwrap().len(), 1);
    }

    #[test]
    fn preview_reuses_cached_box_within_ttl() {
        struct CountingDetector(Arc<Mutex<u32>>);
        impl FaceDetector for CountingDetector {
            fn detect(&mut self, _frame: &Frame) -> Result<Option<FaceBox>> {
                *self.0.lock().unwrap() += 1;
                Ok(Some(FaceBox {
                    x: 1.0,
                    y: 1.0,
                    width: 10.0,
                    height: 10.0,
                }))
            }
        }
        let detections = Arc::new(Mutex::new(0));
        let video = shared_video(160, 120);
        let locator = shared_locator(DetectorHandle::with_native(Box::new(CountingDetector(
            Arc::clone(&detections),
        ))));
        struct NullSink;
        impl PreviewSink for NullSink {
            fn present(&mut self, _frame: &Frame, _face: Option<FaceBox>) {}
        }
        let mut preview = PreviewLoop::start(
            video,
            locator,
            Box::new(NullSink),
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(300));
        preview.stop();
        // Many refreshes, but the TTL never expired after the first detect.
        assert_eq!(*detections.lock().unwrap(), 1);
    }
}
