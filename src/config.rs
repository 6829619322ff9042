//! Command-line parsing and validation helpers.

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2_000;
const DEFAULT_PREVIEW_REFRESH_MS: u64 = 66;
const DEFAULT_PREVIEW_DETECT_TTL_MS: u64 = 500;
const DEFAULT_STT_HOP_MS: u64 = 2_500;
const DEFAULT_VIDEO_WIDTH: u32 = 1_280;
const DEFAULT_VIDEO_HEIGHT: u32 = 720;
const ISO_639_1_CODES: &[&str] = &[
    "af", "am", "ar", "az", "be", "bg", "bn", "bs", "ca", "cs", "cy", "da", "de", "el", "en", "es",
    "et", "eu", "fa", "fi", "fil", "fr", "ga", "gl", "gu", "he", "hi", "hr", "hu", "hy", "id",
    "is", "it", "ja", "jv", "ka", "kk", "km", "kn", "ko", "lo", "lt", "lv", "mk", "ml", "mn", "mr",
    "ms", "my", "ne", "nl", "no", "pa", "pl", "pt", "ro", "ru", "si", "sk", "sl", "sq", "sr", "sv",
    "sw", "ta", "te", "th", "tr", "uk", "ur", "vi", "zh",
];

/// CLI options for the answer-capture booth. Validated values keep the
/// capture workers and the submit client within safe bounds.
#[derive(Debug, Parser, Clone)]
#[command(about = "Interview answer capture booth", author, version)]
pub struct AppConfig {
    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Probe platform capabilities (speech, camera, face detection) and exit
    #[arg(long, default_value_t = false)]
    pub probe: bool,

    /// Camera device index
    #[arg(long, default_value_t = 0)]
    pub camera_index: u32,

    /// Requested camera capture width
    #[arg(long = "video-width", default_value_t = DEFAULT_VIDEO_WIDTH)]
    pub video_width: u32,

    /// Requested camera capture height
    #[arg(long = "video-height", default_value_t = DEFAULT_VIDEO_HEIGHT)]
    pub video_height: u32,

    /// Use synthetic audio/video sources instead of real hardware
    #[arg(long = "synthetic-media", default_value_t = false)]
    pub synthetic_media: bool,

    /// Whisper model name used for auto-discovery under models/
    #[arg(long, default_value = "base")]
    pub whisper_model: String,

    /// Whisper model path (overrides auto-discovery)
    #[arg(long)]
    pub whisper_model_path: Option<String>,

    /// Face detection model path (overrides auto-discovery)
    #[arg(long)]
    pub face_model_path: Option<String>,

    /// Answer locale; the leading subtag is handed to the speech engine
    #[arg(long, default_value = "en-IN")]
    pub lang: String,

    /// Interval between still-frame grabs while recording (milliseconds)
    #[arg(long = "sample-interval-ms", default_value_t = DEFAULT_SAMPLE_INTERVAL_MS)]
    pub sample_interval_ms: u64,

    /// Preview refresh cadence (milliseconds)
    #[arg(long = "preview-refresh-ms", default_value_t = DEFAULT_PREVIEW_REFRESH_MS)]
    pub preview_refresh_ms: u64,

    /// How long a face detection result is reused by the preview (milliseconds)
    #[arg(long = "preview-detect-ttl-ms", default_value_t = DEFAULT_PREVIEW_DETECT_TTL_MS)]
    pub preview_detect_ttl_ms: u64,

    /// Interval between incremental transcription passes (milliseconds)
    #[arg(long = "stt-hop-ms", default_value_t = DEFAULT_STT_HOP_MS)]
    pub stt_hop_ms: u64,

    /// Disable face cropping of captured frames
    #[arg(long = "no-crop", action = ArgAction::SetFalse, default_value_t = true)]
    pub crop_faces: bool,

    /// Practice mode: answers are never submitted
    #[arg(long, default_value_t = false)]
    pub practice: bool,

    /// Base URL of the interview backend
    #[arg(long = "api-base-url", default_value = "http://localhost:5000/api")]
    pub api_base_url: String,

    /// Interview session identifier attached to submissions
    #[arg(long, default_value = "demo-session")]
    pub session_id: String,

    /// Question identifier attached to submissions
    #[arg(long, default_value = "q1")]
    pub question_id: String,
}

/// Snapshot of the knobs the capture workers need, detached from clap.
#[derive(Debug, Clone)]
pub struct CapturePipelineConfig {
    pub lang: String,
    pub sample_interval_ms: u64,
    pub preview_refresh_ms: u64,
    pub preview_detect_ttl_ms: u64,
    pub stt_hop_ms: u64,
    pub crop_faces: bool,
}

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values and normalize paths.
    pub fn validate(&mut self) -> Result<()> {
        if !(160..=3_840).contains(&self.video_width) || !(120..=2_160).contains(&self.video_height)
        {
            bail!(
                "--video-width/--video-height must describe a sane capture size, got {}x{}",
                self.video_width,
                self.video_height
            );
        }
        if !(500..=10_000).contains(&self.sample_interval_ms) {
            bail!(
                "--sample-interval-ms must be between 500 and 10000, got {}",
                self.sample_interval_ms
            );
        }
        if !(16..=1_000).contains(&self.preview_refresh_ms) {
            bail!(
                "--preview-refresh-ms must be between 16 and 1000, got {}",
                self.preview_refresh_ms
            );
        }
        if !(100..=5_000).contains(&self.preview_detect_ttl_ms) {
            bail!(
                "--preview-detect-ttl-ms must be between 100 and 5000, got {}",
                self.preview_detect_ttl_ms
            );
        }
        if !(500..=10_000).contains(&self.stt_hop_ms) {
            bail!(
                "--stt-hop-ms must be between 500 and 10000, got {}",
                self.stt_hop_ms
            );
        }

        if self.lang.trim().is_empty()
            || !self
                .lang
                .chars()
                .all(|ch| ch.is_ascii_alphabetic() || ch == '-' || ch == '_')
        {
            bail!("--lang must contain only alphabetic characters or '-'/'_' separators");
        }
        // Allow locale-style values but only check the leading ISO-639-1 code.
        let lang_primary = self
            .lang
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if !ISO_639_1_CODES.contains(&lang_primary.as_str()) {
            bail!(
                "--lang must start with a valid ISO-639-1 code, got '{}'",
                self.lang
            );
        }

        if self.api_base_url.trim().is_empty() {
            bail!("--api-base-url cannot be empty");
        }
        if self.session_id.trim().is_empty() || self.question_id.trim().is_empty() {
            bail!("--session-id and --question-id cannot be empty");
        }

        if self.whisper_model_path.is_none() {
            if let Some(auto_model) =
                discover_model(&models_dir(), &whisper_candidates(&self.whisper_model))
            {
                self.whisper_model_path = Some(auto_model.to_string_lossy().to_string());
            }
        }
        if self.face_model_path.is_none() {
            if let Some(auto_model) = discover_model(&models_dir(), &face_candidates()) {
                self.face_model_path = Some(auto_model.to_string_lossy().to_string());
            }
        }

        // If model paths were supplied (explicitly or via auto-detect), they must exist.
        self.whisper_model_path =
            canonicalize_model(self.whisper_model_path.take(), "whisper model")?;
        self.face_model_path = canonicalize_model(self.face_model_path.take(), "face model")?;

        Ok(())
    }

    /// Leading ISO-639-1 subtag handed to the speech engine (`en-IN` -> `en`).
    pub fn speech_lang(&self) -> String {
        self.lang
            .split(['-', '_'])
            .next()
            .unwrap_or("en")
            .to_ascii_lowercase()
    }

    /// Snapshot the current capture settings for downstream workers.
    pub fn capture_pipeline_config(&self) -> CapturePipelineConfig {
        CapturePipelineConfig {
            lang: self.speech_lang(),
            sample_interval_ms: self.sample_interval_ms,
            preview_refresh_ms: self.preview_refresh_ms,
            preview_detect_ttl_ms: self.preview_detect_ttl_ms,
            stt_hop_ms: self.stt_hop_ms,
            crop_faces: self.crop_faces,
        }
    }
}

fn models_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("models")
}

fn whisper_candidates(model: &str) -> Vec<String> {
    vec![
        format!("ggml-{model}.en.bin"),
        format!("ggml-{model}.bin"),
        "ggml-base.en.bin".to_string(),
        "ggml-base.bin".to_string(),
    ]
}

fn face_candidates() -> Vec<String> {
    vec!["seeta_fd_frontal_v1.0.bin".to_string()]
}

/// Try to locate a model file under `models/` so the pipeline works
/// out-of-the-box when users haven't provided an explicit path.
fn discover_model(models_dir: &Path, candidates: &[String]) -> Option<PathBuf> {
    if !models_dir.exists() {
        return None;
    }
    for candidate in candidates {
        let path = models_dir.join(candidate);
        if path.exists() {
            if let Ok(canonical) = path.canonicalize() {
                return Some(canonical);
            }
        }
    }
    None
}

/// Canonicalize an optional model path, insisting it actually exists.
fn canonicalize_model(path: Option<String>, label: &str) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let model_path = Path::new(&path);
    if !model_path.exists() {
        bail!("{label} path '{}' does not exist", model_path.display());
    }
    let canonical = model_path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {label} path '{path}'"))?;
    let canonical = canonical
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("{label} path must be valid UTF-8"))?;
    Ok(Some(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn accepts_valid_defaults() {
        let mut cfg = AppConfig::parse_from(["test-app"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_language_code() {
        let mut cfg = AppConfig::parse_from(["test-app", "--lang", "en$"]);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::parse_from(["test-app", "--lang", "xx"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_locale_style_language() {
        let mut cfg = AppConfig::parse_from(["test-app", "--lang", "en-IN"]);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.speech_lang(), "en");
    }

    #[test]
    fn rejects_sample_interval_out_of_bounds() {
        let mut cfg = AppConfig::parse_from(["test-app", "--sample-interval-ms", "100"]);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::parse_from(["test-app", "--sample-interval-ms", "60000"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_whisper_model_path() {
        let mut cfg = AppConfig::parse_from([
            "test-app",
            "--whisper-model-path",
            "/definitely/not/here.bin",
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_crop_flag_disables_cropping() {
        let cfg = AppConfig::parse_from(["test-app", "--no-crop"]);
        assert!(!cfg.crop_faces);
        let cfg = AppConfig::parse_from(["test-app"]);
        assert!(cfg.crop_faces);
    }

    #[test]
    fn pipeline_snapshot_carries_speech_lang() {
        let mut cfg = AppConfig::parse_from(["test-app", "--lang", "fr_CA"]);
        cfg.validate().expect("locale-style lang should validate");
        let pipeline = cfg.capture_pipeline_config();
        assert_eq!(pipeline.lang, "fr");
        assert_eq!(pipeline.sample_interval_ms, 2_000);
    }
}
