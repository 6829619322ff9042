use anyhow::Result;
use answerbooth::api::HttpSink;
use answerbooth::audio::Recorder;
use answerbooth::config::AppConfig;
use answerbooth::face::{DetectorHandle, FaceBox, FaceLocator};
use answerbooth::media::{Frame, MediaStream};
use answerbooth::sampler::PreviewSink;
use answerbooth::stt::Transcriber;
use answerbooth::submit::{submit_answer, SubmitSink};
use answerbooth::{init_debug_log_file, log_debug, log_file_path, RecordingController};
use clap::Parser;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

#[cfg(not(test))]
fn main() -> Result<()> {
    run_with_args(env::args_os())
}

#[cfg_attr(test, allow(dead_code))]
fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut config = AppConfig::parse_from(args);

    if config.list_input_devices {
        let output = list_input_devices()?;
        print!("{output}");
        return Ok(());
    }

    config.validate()?;
    init_debug_log_file();
    let log_path = log_file_path();
    log_debug("=== AnswerBooth Started ===");
    log_debug(&format!("Log file: {log_path:?}"));

    if config.probe {
        print!("{}", probe_report(&config));
        return Ok(());
    }

    // Speech-to-text is mandatory for recorded answers; without it the
    // booth degrades to typed answers only.
    let transcriber = match config.whisper_model_path.as_deref() {
        Some(path) => match Transcriber::new(path) {
            Ok(transcriber) => Some(transcriber),
            Err(err) => {
                eprintln!("Speech-to-text is unavailable: {err:#}");
                eprintln!("Recorded answers are disabled; type your answers instead.");
                log_debug(&format!("Transcriber init failed: {err:#}"));
                None
            }
        },
        None => {
            eprintln!("No whisper model found; recorded answers are disabled.");
            None
        }
    };

    let media = acquire_media(&config, transcriber.is_some());

    let locator = FaceLocator::new(DetectorHandle::probe(&config));
    log_debug(&format!("Face detector: {}", locator.detector_label()));

    let engine: Arc<Mutex<dyn answerbooth::stt::SpeechEngine>> = match transcriber {
        Some(transcriber) => Arc::new(Mutex::new(transcriber)),
        None => Arc::new(Mutex::new(UnavailableEngine)),
    };

    let mut controller = RecordingController::new(
        media,
        engine,
        locator,
        config.capture_pipeline_config(),
    );
    let mut sink = HttpSink::new(&config.api_base_url, &config.session_id, &config.question_id)?;

    let result = run_command_loop(&mut controller, &mut sink, config.practice);
    log_debug("=== AnswerBooth Exiting ===");
    if let Err(ref e) = result {
        log_debug(&format!("Exit with error: {e:#}"));
    }
    result
}

/// Open the microphone and camera, but only when speech-to-text is ready.
/// Without a transcriber a recorded take could never produce an answer, so
/// no device is touched at all; the booth degrades to typed answers.
fn acquire_media(config: &AppConfig, speech_ready: bool) -> Option<MediaStream> {
    if !speech_ready {
        return None;
    }
    match MediaStream::open(config) {
        Ok(media) => Some(media),
        Err(err) => {
            eprintln!("Could not open the microphone and camera: {err:#}");
            eprintln!("Grant device permissions and restart to record answers.");
            log_debug(&format!("Media acquisition failed: {err:#}"));
            None
        }
    }
}

/// Headless preview surface: keeps the self-view pipeline running and
/// leaves a trace in the debug log instead of drawing frames.
#[derive(Default)]
struct LogPreviewSink {
    frames_shown: u64,
}

impl PreviewSink for LogPreviewSink {
    fn present(&mut self, _frame: &Frame, face: Option<FaceBox>) {
        self.frames_shown += 1;
        if self.frames_shown % 150 == 1 {
            log_debug(&format!(
                "preview: {} frame(s) shown, face located: {}",
                self.frames_shown,
                face.is_some()
            ));
        }
    }
}

/// Begin a take and, when cropping is on, attach the live preview so the
/// face locator keeps a warm box between still grabs.
fn start_recording(controller: &mut RecordingController) -> Result<String> {
    controller.start()?;
    if controller.crop_enabled() {
        if let Err(err) = controller.attach_preview(Box::new(LogPreviewSink::default())) {
            log_debug(&format!("Preview attach failed: {err:#}"));
        }
    }
    Ok("Recording.".to_string())
}

struct UnavailableEngine;

impl answerbooth::stt::SpeechEngine for UnavailableEngine {
    fn transcribe(&self, _: &[f32], _: &str) -> Result<String> {
        Err(anyhow::anyhow!("speech-to-text is unavailable"))
    }
}

fn probe_report(config: &AppConfig) -> String {
    let mut report = String::from("AnswerBooth probe:\n");
    match Recorder::list_devices() {
        Ok(devices) if devices.is_empty() => {
            report.push_str("  audio: no input devices detected\n");
        }
        Ok(devices) => {
            report.push_str(&format!("  audio: {} input device(s)\n", devices.len()));
        }
        Err(err) => report.push_str(&format!("  audio: unavailable ({err:#})\n")),
    }
    report.push_str(&format!(
        "  whisper model: {}\n",
        config.whisper_model_path.as_deref().unwrap_or("not found")
    ));
    report.push_str(&format!(
        "  face model: {}\n",
        config.face_model_path.as_deref().unwrap_or("not found")
    ));
    report
}

fn run_command_loop(
    controller: &mut RecordingController,
    sink: &mut dyn SubmitSink,
    practice: bool,
) -> Result<()> {
    println!("AnswerBooth ready. Commands: start, stop, clear, status, text <answer>, submit, quit");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "" => {}
            "start" => report(start_recording(controller)),
            "stop" => report(controller.stop().map(|_| "Stopped.".to_string())),
            "clear" => {
                controller.clear();
                println!("Cleared.");
            }
            "status" => {
                let state = if controller.is_recording() {
                    "recording"
                } else {
                    "idle"
                };
                println!(
                    "{state}, {}s elapsed, {} frame(s), detector: {}",
                    controller.elapsed_secs(),
                    controller.frame_count(),
                    controller.detector_label()
                );
                let answer = controller.answer_text();
                if !answer.is_empty() {
                    println!("answer: {answer}");
                }
            }
            "text" => report(
                controller
                    .set_manual_text(rest)
                    .map(|_| "Answer updated.".to_string()),
            ),
            "submit" => match submit_answer(controller, sink, practice) {
                Ok(outcome) => {
                    if let Some(score) = outcome.score {
                        println!("Submitted. Score: {score:.1}");
                    } else {
                        println!("Submitted.");
                    }
                    if let Some(good) = outcome.good {
                        println!("Went well: {good}");
                    }
                    if let Some(improve) = outcome.improve {
                        println!("Could improve: {improve}");
                    }
                }
                Err(err) => println!("Submission failed: {err:#}"),
            },
            "quit" | "exit" => break,
            other => println!("Unknown command: {other}"),
        }
    }
    if controller.is_recording() {
        controller.stop()?;
    }
    Ok(())
}

fn report(result: Result<String>) {
    match result {
        Ok(message) => println!("{message}"),
        Err(err) => println!("{err:#}"),
    }
}

fn list_input_devices() -> Result<String> {
    let devices = if let Ok(raw) = env::var("ANSWERBOOTH_TEST_DEVICES") {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        }
    } else {
        Recorder::list_devices()?
    };
    let mut output = String::new();
    if devices.is_empty() {
        output.push_str("No audio input devices detected.\n");
    } else {
        output.push_str("Available audio input devices:\n");
        for name in devices {
            output.push_str(&format!("  - {name}\n"));
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn with_test_devices(value: Option<&str>, action: impl FnOnce() -> Result<String>) -> String {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let previous = env::var("ANSWERBOOTH_TEST_DEVICES").ok();
        if let Some(value) = value {
            env::set_var("ANSWERBOOTH_TEST_DEVICES", value);
        } else {
            env::remove_var("ANSWERBOOTH_TEST_DEVICES");
        }

        let output = action().expect("action should succeed");

        if let Some(previous) = previous {
            env::set_var("ANSWERBOOTH_TEST_DEVICES", previous);
        } else {
            env::remove_var("ANSWERBOOTH_TEST_DEVICES");
        }

        output
    }

    struct MutedEngine;

    impl answerbooth::stt::SpeechEngine for MutedEngine {
        fn transcribe(&self, _: &[f32], _: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn synthetic_controller(crop_faces: bool) -> RecordingController {
        use answerbooth::audio::AudioFeed;
        use answerbooth::config::CapturePipelineConfig;
        use answerbooth::media::{SyntheticSource, VideoSource};

        let video: Box<dyn VideoSource> = Box::new(SyntheticSource::new(160, 120));
        let media = MediaStream::from_parts(AudioFeed::Synthetic, video);
        RecordingController::new(
            Some(media),
            Arc::new(Mutex::new(MutedEngine)),
            FaceLocator::new(DetectorHandle::None),
            CapturePipelineConfig {
                lang: "en".into(),
                sample_interval_ms: 500,
                preview_refresh_ms: 33,
                preview_detect_ttl_ms: 500,
                stt_hop_ms: 500,
                crop_faces,
            },
        )
    }

    #[test]
    fn start_recording_attaches_preview_when_cropping() {
        let mut controller = synthetic_controller(true);
        start_recording(&mut controller).unwrap();
        assert!(controller.is_recording());
        // A second attach is refused, which proves one is already running.
        assert!(controller
            .attach_preview(Box::new(LogPreviewSink::default()))
            .is_err());
        controller.stop().unwrap();
    }

    #[test]
    fn start_recording_skips_preview_without_cropping() {
        let mut controller = synthetic_controller(false);
        start_recording(&mut controller).unwrap();
        assert!(controller.is_recording());
        assert!(controller
            .attach_preview(Box::new(LogPreviewSink::default()))
            .is_ok());
        controller.stop().unwrap();
    }

    #[test]
    fn media_is_never_opened_without_speech() {
        let mut config = AppConfig::parse_from(["test-app", "--synthetic-media"]);
        config.validate().expect("defaults should validate");
        assert!(acquire_media(&config, false).is_none());
        assert!(acquire_media(&config, true).is_some());
    }

    #[test]
    fn list_input_devices_outputs_devices() {
        let output = with_test_devices(Some("Mic A,Mic B"), list_input_devices);
        assert!(output.contains("Available audio input devices:"));
        assert!(output.contains("Mic A"));
        assert!(output.contains("Mic B"));
    }

    #[test]
    fn list_input_devices_outputs_empty_message() {
        let output = with_test_devices(Some(""), list_input_devices);
        assert!(output.contains("No audio input devices detected."));
    }
}
