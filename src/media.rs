//! Video acquisition and the combined media stream. A `Frame` is an owned
//! RGB8 raster; sources hand them out one grab at a time so the sampler and
//! the preview never share decoder state.

use crate::audio::{AudioFeed, Recorder};
use crate::config::AppConfig;
use crate::logging::log_debug;
use anyhow::{anyhow, bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::sync::{Arc, Mutex};

/// JPEG quality for captured stills; matches what the scoring backend was
/// tuned against.
const JPEG_QUALITY: u8 = 80;

/// One still image, row-major RGB8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "frame buffer size {} does not match {}x{} RGB8 ({} bytes)",
                data.len(),
                width,
                height,
                expected
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Row-major luminance plane for detectors that want grayscale input.
    pub fn to_gray(&self) -> Vec<u8> {
        let mut gray = Vec::with_capacity(self.width as usize * self.height as usize);
        for px in self.data.chunks_exact(3) {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            gray.push(y.round().clamp(0.0, 255.0) as u8);
        }
        gray
    }

    /// Compress to JPEG for the frame ring / submission payload.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("failed to JPEG-encode frame")?;
        Ok(out)
    }
}

/// A live video feed; implementations may be stateful, hence `&mut self`.
pub trait VideoSource: Send {
    /// Grab the current frame at the source's native resolution.
    fn grab(&mut self) -> Result<Frame>;

    fn name(&self) -> String {
        "video source".to_string()
    }
}

/// Shared handle: the sampler worker and the preview loop both read from the
/// same source, one grab at a time.
pub type SharedVideoSource = Arc<Mutex<Box<dyn VideoSource>>>;

/// Deterministic moving gradient used by `--synthetic-media` and tests.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl VideoSource for SyntheticSource {
    fn grab(&mut self) -> Result<Frame> {
        self.tick = self.tick.wrapping_add(1);
        let shift = (self.tick * 7) as u32;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push(((x + y) % 256) as u8);
            }
        }
        Frame::new(data, self.width, self.height)
    }

    fn name(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}

#[cfg(feature = "camera_nokhwa")]
mod camera {
    use super::{Frame, VideoSource};
    use anyhow::{Context, Result};
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    };
    use nokhwa::Camera;

    /// Real webcam backend. The stream is opened once and stopped on drop so
    /// the hardware light goes out even if the booth exits mid-recording.
    pub struct CameraSource {
        camera: Camera,
        label: String,
    }

    impl CameraSource {
        pub fn open(index: u32, width: u32, height: u32) -> Result<Self> {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, 30),
            ));
            let mut camera = Camera::new(CameraIndex::Index(index), requested)
                .context("failed to open camera")?;
            camera
                .open_stream()
                .context("failed to start camera stream")?;
            let label = camera.info().human_name();
            Ok(Self { camera, label })
        }
    }

    impl VideoSource for CameraSource {
        fn grab(&mut self) -> Result<Frame> {
            let buffer = self.camera.frame().context("camera frame grab failed")?;
            let decoded = buffer
                .decode_image::<RgbFormat>()
                .context("failed to decode camera frame")?;
            let (width, height) = (decoded.width(), decoded.height());
            Frame::new(decoded.into_raw(), width, height)
        }

        fn name(&self) -> String {
            self.label.clone()
        }
    }

    impl Drop for CameraSource {
        fn drop(&mut self) {
            let _ = self.camera.stop_stream();
        }
    }
}

#[cfg(feature = "camera_nokhwa")]
pub use camera::CameraSource;

/// The open audio+video stream for one booth instance. Owned exclusively;
/// dropping it releases the microphone and camera.
pub struct MediaStream {
    audio: AudioFeed,
    video: SharedVideoSource,
}

impl MediaStream {
    /// Request camera + microphone access. Failure (no device, permission
    /// denied) is surfaced to the caller; no retry is attempted.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let audio = if config.synthetic_media {
            AudioFeed::Synthetic
        } else {
            AudioFeed::Device(Recorder::new(config.input_device.as_deref())?)
        };
        let video = open_video_source(config)?;
        log_debug(&format!(
            "media stream open: audio='{}' video='{}'",
            audio.name(),
            video.lock().unwrap_or_else(|e| e.into_inner()).name()
        ));
        Ok(Self { audio, video })
    }

    /// Build a stream from explicit parts (tests, embedders with their own
    /// sources).
    pub fn from_parts(audio: AudioFeed, video: Box<dyn VideoSource>) -> Self {
        Self {
            audio,
            video: Arc::new(Mutex::new(video)),
        }
    }

    pub fn audio(&self) -> &AudioFeed {
        &self.audio
    }

    pub fn video(&self) -> SharedVideoSource {
        self.video.clone()
    }
}

fn open_video_source(config: &AppConfig) -> Result<SharedVideoSource> {
    if config.synthetic_media {
        return Ok(Arc::new(Mutex::new(Box::new(SyntheticSource::new(
            config.video_width,
            config.video_height,
        )))));
    }

    #[cfg(feature = "camera_nokhwa")]
    {
        let source = camera::CameraSource::open(
            config.camera_index,
            config.video_width,
            config.video_height,
        )?;
        return Ok(Arc::new(Mutex::new(Box::new(source))));
    }

    #[cfg(not(feature = "camera_nokhwa"))]
    {
        return Err(anyhow!(
            "no camera backend compiled in; rebuild with --features camera_nokhwa or run with --synthetic-media"
        ));
    }
}
