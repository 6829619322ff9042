//! Answer submission. Turns the controller's captured state into a payload,
//! enforces the local rejection rules, and hands the payload to a sink.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::sampler::CapturedFrame;
use crate::session::RecordingController;

/// Everything the grading endpoint needs for one answer.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionPayload {
    pub transcript: String,
    /// Recorded audio, shipped as a file part rather than JSON.
    #[serde(skip_serializing)]
    pub media_blob: Option<Vec<u8>>,
    /// Base64-encoded JPEG frames, oldest first.
    pub frames: Vec<String>,
    pub crop_enabled: bool,
}

/// Grading verdict returned by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub good: Option<String>,
    #[serde(default)]
    pub improve: Option<String>,
}

/// Destination for assembled payloads; tests swap in recording fakes.
pub trait SubmitSink {
    fn submit(&mut self, payload: &SubmissionPayload) -> Result<SubmitOutcome>;
}

/// Thin out the captured frames to roughly half, keeping the even indices.
/// A single captured frame is always kept.
pub fn select_frames(frames: &[CapturedFrame]) -> Vec<&CapturedFrame> {
    if frames.is_empty() {
        return Vec::new();
    }
    frames.iter().step_by(2).collect()
}

/// Build the payload from the controller, stopping an in-progress take
/// first. Fails locally, without touching the sink, for practice sessions
/// and empty answers.
pub fn assemble(controller: &mut RecordingController, practice_mode: bool) -> Result<SubmissionPayload> {
    if practice_mode {
        bail!("practice answers are not submitted for grading");
    }
    // Reject empty answers before touching the recorder, so a rejected
    // submit mid-recording leaves the take running.
    if controller.answer_text().trim().is_empty() {
        bail!("there is no answer to submit yet; record or type one first");
    }
    if controller.is_recording() {
        controller.stop()?;
    }
    let transcript = controller.answer_text();
    let media_blob = controller.take_media_blob();
    let captured = controller.drain_frames();
    let frames = select_frames(&captured)
        .into_iter()
        .map(|frame| BASE64.encode(&frame.jpeg))
        .collect();
    let payload = SubmissionPayload {
        transcript,
        media_blob,
        frames,
        crop_enabled: controller.crop_enabled(),
    };
    // The answer is the sink's problem now; reset for the next question.
    controller.clear();
    Ok(payload)
}

/// Assemble and submit in one step.
pub fn submit_answer(
    controller: &mut RecordingController,
    sink: &mut dyn SubmitSink,
    practice_mode: bool,
) -> Result<SubmitOutcome> {
    let payload = assemble(controller, practice_mode)?;
    sink.submit(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFeed;
    use crate::config::CapturePipelineConfig;
    use crate::face::{DetectorHandle, FaceLocator};
    use crate::media::{MediaStream, SyntheticSource, VideoSource};
    use crate::stt::SpeechEngine;
    use std::sync::{Arc, Mutex};

    struct SilentEngine;

    impl SpeechEngine for SilentEngine {
        fn transcribe(&self, _: &[f32], _: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    struct TalkativeEngine;

    impl SpeechEngine for TalkativeEngine {
        fn transcribe(&self, _: &[f32], _: &str) -> Result<String> {
            Ok("a spoken answer".to_string())
        }
    }

    struct RecordingSink {
        payloads: Vec<SubmissionPayload>,
    }

    impl SubmitSink for RecordingSink {
        fn submit(&mut self, payload: &SubmissionPayload) -> Result<SubmitOutcome> {
            self.payloads.push(payload.clone());
            Ok(SubmitOutcome {
                success: true,
                score: Some(7.5),
                good: None,
                improve: None,
            })
        }
    }

    fn controller() -> RecordingController {
        controller_with(SilentEngine)
    }

    fn controller_with(engine: impl SpeechEngine + 'static) -> RecordingController {
        let video: Box<dyn VideoSource> = Box::new(SyntheticSource::new(160, 120));
        let media = MediaStream::from_parts(AudioFeed::Synthetic, video);
        RecordingController::new(
            Some(media),
            Arc::new(Mutex::new(engine)),
            FaceLocator::new(DetectorHandle::None),
            CapturePipelineConfig {
                lang: "en".into(),
                sample_interval_ms: 100,
                preview_refresh_ms: 33,
                preview_detect_ttl_ms: 500,
                stt_hop_ms: 200,
                crop_faces: false,
            },
        )
    }

    fn captured(n: u8) -> CapturedFrame {
        CapturedFrame {
            jpeg: vec![n; 8],
            width: 4,
            height: 4,
        }
    }

    #[test]
    fn even_indices_are_kept() {
        let frames: Vec<CapturedFrame> = (0..7).map(captured).collect();
        let selected = select_frames(&frames);
        let picked: Vec<u8> = selected.iter().map(|f| f.jpeg[0]).collect();
        assert_eq!(picked, vec![0, 2, 4, 6]);
    }

    #[test]
    fn a_single_frame_is_always_kept() {
        let frames = vec![captured(9)];
        assert_eq!(select_frames(&frames).len(), 1);
        assert!(select_frames(&[]).is_empty());
    }

    #[test]
    fn practice_mode_is_rejected_locally() {
        let mut controller = controller();
        controller.set_manual_text("a fine answer").unwrap();
        let mut sink = RecordingSink { payloads: vec![] };
        let err = submit_answer(&mut controller, &mut sink, true).unwrap_err();
        assert!(err.to_string().contains("practice"));
        assert!(sink.payloads.is_empty());
        // The answer is untouched by the rejection.
        assert_eq!(controller.answer_text(), "a fine answer");
    }

    #[test]
    fn empty_answer_is_rejected_locally() {
        let mut controller = controller();
        controller.set_manual_text("   ").unwrap();
        let mut sink = RecordingSink { payloads: vec![] };
        let err = submit_answer(&mut controller, &mut sink, false).unwrap_err();
        assert!(err.to_string().contains("no answer"));
        assert!(sink.payloads.is_empty());
    }

    #[test]
    fn typed_answer_submits_without_media() {
        let mut controller = controller();
        controller.set_manual_text("my typed answer").unwrap();
        let mut sink = RecordingSink { payloads: vec![] };
        let outcome = submit_answer(&mut controller, &mut sink, false).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.score, Some(7.5));
        let payload = &sink.payloads[0];
        assert_eq!(payload.transcript, "my typed answer");
        assert!(payload.media_blob.is_none());
        assert!(payload.frames.is_empty());
        // The controller resets after handoff.
        assert!(controller.answer_text().is_empty());
    }

    #[test]
    fn submit_stops_an_active_recording() {
        let mut controller = controller_with(TalkativeEngine);
        controller.start().unwrap();
        // Let a transcription pass land so the live transcript is non-empty.
        std::thread::sleep(std::time::Duration::from_millis(500));
        let mut sink = RecordingSink { payloads: vec![] };
        let outcome = submit_answer(&mut controller, &mut sink, false).unwrap();
        assert!(outcome.success);
        assert!(!controller.is_recording());
        assert_eq!(sink.payloads[0].transcript, "a spoken answer");
    }

    #[test]
    fn rejected_empty_submit_keeps_recording_running() {
        let mut controller = controller();
        controller.start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));
        let mut sink = RecordingSink { payloads: vec![] };
        let err = submit_answer(&mut controller, &mut sink, false).unwrap_err();
        assert!(err.to_string().contains("no answer"));
        // The silent engine yields an empty transcript; the rejection must
        // not end the take.
        assert!(controller.is_recording());
        assert!(sink.payloads.is_empty());
        controller.stop().unwrap();
    }
}
