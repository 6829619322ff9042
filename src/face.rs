//! Face location and crop geometry. A pluggable detector finds the
//! interviewee's face; the locator caches the last successful box so dropped
//! detections don't make the crop jump around; pure geometry helpers turn a
//! box (or its absence) into the final square crop.

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};

use crate::config::AppConfig;
use crate::logging::log_debug;
use crate::media::Frame;

/// Padding around the detected box, as a fraction of its larger side.
const PAD_RATIO: f32 = 0.35;
/// Upward bias of the centered fallback crop, as a fraction of its side.
/// Faces sit above the frame center in a typical webcam framing.
const FALLBACK_UP_BIAS: f32 = 0.10;
/// Side length of the square crop sent to the server.
pub const CROP_SIZE: u32 = 320;

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Seam for face detection backends; tests inject scripted fakes.
pub trait FaceDetector: Send {
    /// Return the most confident face in the frame, or `None` when the
    /// detector ran fine but saw no face.
    fn detect(&mut self, frame: &Frame) -> Result<Option<FaceBox>>;

    fn name(&self) -> &'static str {
        "unknown_detector"
    }
}

/// The detector actually wired into a session.
pub enum DetectorHandle {
    /// Detector supplied by the embedding environment (tests, host shells).
    Native(Box<dyn FaceDetector>),
    /// Bundled model-based detector.
    Model(Box<dyn FaceDetector>),
    /// No detector available; every frame uses the centered fallback.
    None,
}

impl DetectorHandle {
    /// Pick the best detector the build and config allow.
    pub fn probe(config: &AppConfig) -> Self {
        #[cfg(feature = "face_seeta")]
        {
            if let Some(path) = config.face_model_path.as_deref() {
                match seeta::SeetaDetector::load(path) {
                    Ok(detector) => return DetectorHandle::Model(Box::new(detector)),
                    Err(err) => log_debug(&format!("Failed to load face model: {err:#}")),
                }
            } else {
                log_debug("No face model file found; falling back to centered crop");
            }
        }
        #[cfg(not(feature = "face_seeta"))]
        {
            let _ = config;
        }
        DetectorHandle::None
    }

    pub fn with_native(detector: Box<dyn FaceDetector>) -> Self {
        DetectorHandle::Native(detector)
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, DetectorHandle::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DetectorHandle::Native(d) | DetectorHandle::Model(d) => d.name(),
            DetectorHandle::None => "none",
        }
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<FaceBox>> {
        match self {
            DetectorHandle::Native(d) | DetectorHandle::Model(d) => d.detect(frame),
            DetectorHandle::None => Ok(None),
        }
    }
}

/// Runs the detector and remembers the last face seen, so a missed
/// detection reuses the previous location instead of recentering.
pub struct FaceLocator {
    handle: DetectorHandle,
    last_box: Option<FaceBox>,
}

impl FaceLocator {
    pub fn new(handle: DetectorHandle) -> Self {
        Self {
            handle,
            last_box: None,
        }
    }

    pub fn detector_available(&self) -> bool {
        self.handle.is_available()
    }

    pub fn detector_label(&self) -> &'static str {
        self.handle.label()
    }

    pub fn last_box(&self) -> Option<FaceBox> {
        self.last_box
    }

    /// Locate the face in this frame, falling back to the cached box when
    /// the detector fails or sees nothing.
    pub fn locate(&mut self, frame: &Frame) -> Option<FaceBox> {
        match self.handle.detect(frame) {
            Ok(Some(found)) => {
                self.last_box = Some(found);
                Some(found)
            }
            Ok(None) => self.last_box,
            Err(err) => {
                log_debug(&format!("Face detection failed: {err:#}"));
                self.last_box
            }
        }
    }
}

/// Integer crop rectangle, fully inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the crop rectangle for a frame given an optional face box.
///
/// With a face, the box is padded by [`PAD_RATIO`] of its larger side and
/// clamped to the frame. Without one, a centered square with side equal to
/// the frame's smaller dimension is used, shifted up by a tenth of the side.
pub fn crop_region(frame_w: u32, frame_h: u32, face: Option<FaceBox>) -> CropRect {
    let fw = frame_w as f32;
    let fh = frame_h as f32;
    match face {
        Some(face) => {
            let pad = face.width.max(face.height) * PAD_RATIO;
            let x0 = (face.x - pad).max(0.0);
            let y0 = (face.y - pad).max(0.0);
            let x1 = (face.x + face.width + pad).min(fw);
            let y1 = (face.y + face.height + pad).min(fh);
            CropRect {
                x: x0 as u32,
                y: y0 as u32,
                width: ((x1 - x0).max(1.0) as u32).min(frame_w),
                height: ((y1 - y0).max(1.0) as u32).min(frame_h),
            }
        }
        None => {
            let side = fw.min(fh);
            let x = (fw - side) / 2.0;
            let y = ((fh - side) / 2.0 - side * FALLBACK_UP_BIAS).max(0.0);
            CropRect {
                x: x as u32,
                y: y as u32,
                width: side as u32,
                height: side as u32,
            }
        }
    }
}

/// Crop the region out of the frame and resize it to [`CROP_SIZE`] square.
pub fn crop_frame(frame: &Frame, region: CropRect) -> Result<Frame> {
    let (w, h) = (frame.width(), frame.height());
    let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(w, h, frame.data().to_vec())
            .ok_or_else(|| anyhow::anyhow!("frame buffer does not match its dimensions"))?;
    let cropped = imageops::crop_imm(&buffer, region.x, region.y, region.width, region.height)
        .to_image();
    let resized = imageops::resize(&cropped, CROP_SIZE, CROP_SIZE, FilterType::Triangle);
    Frame::new(resized.into_raw(), CROP_SIZE, CROP_SIZE)
}

#[cfg(feature = "face_seeta")]
mod seeta {
    use super::{FaceBox, FaceDetector};
    use crate::media::Frame;
    use anyhow::{Context, Result};
    use rustface::{Detector, ImageData};

    pub struct SeetaDetector {
        inner: Box<dyn Detector>,
    }

    impl SeetaDetector {
        pub fn load(model_path: &str) -> Result<Self> {
            let mut inner = rustface::create_detector(model_path)
                .context("failed to load SeetaFace model")?;
            inner.set_min_face_size(40);
            inner.set_score_thresh(2.0);
            inner.set_pyramid_scale_factor(0.8);
            inner.set_slide_window_step(4, 4);
            Ok(Self { inner })
        }
    }

    // rustface's detector is plain owned data.
    unsafe impl Send for SeetaDetector {}

    impl FaceDetector for SeetaDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Option<FaceBox>> {
            let gray = frame.to_gray();
            let mut image = ImageData::new(&gray, frame.width(), frame.height());
            let faces = self.inner.detect(&mut image);
            // Detections come sorted by score; keep the strongest one.
            Ok(faces.first().map(|info| {
                let bbox = info.bbox();
                FaceBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                }
            }))
        }

        fn name(&self) -> &'static str {
            "seetaface"
        }
    }
}
