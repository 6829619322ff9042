//! Live transcription worker. While an answer is being recorded the worker
//! periodically re-transcribes the whole audio accumulated so far, replacing
//! the shared transcript each pass. Re-running over the full buffer keeps
//! the text self-correcting as more context arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::audio::SharedSamples;
use crate::logging::log_debug;
use crate::stt::SpeechEngine;

/// Wake the worker this often so stop requests are honored promptly even
/// with long transcription hops.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Worker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Periodic re-transcription of a growing audio buffer into a shared
/// transcript string.
pub struct LiveTranscription {
    transcript: Arc<Mutex<String>>,
    worker: Option<Worker>,
}

impl LiveTranscription {
    pub fn new() -> Self {
        Self {
            transcript: Arc::new(Mutex::new(String::new())),
            worker: None,
        }
    }

    /// Shared handle to the latest transcript text.
    pub fn transcript(&self) -> Arc<Mutex<String>> {
        Arc::clone(&self.transcript)
    }

    pub fn snapshot(&self) -> String {
        match self.transcript.lock() {
            Ok(text) => text.clone(),
            Err(_) => String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    /// Clear the transcript text without touching the worker.
    pub fn reset(&self) {
        if let Ok(mut text) = self.transcript.lock() {
            text.clear();
        }
    }

    /// Spawn the transcription worker over the shared audio accumulator.
    pub fn start(
        &mut self,
        engine: Arc<Mutex<dyn SpeechEngine>>,
        audio: SharedSamples,
        lang: String,
        hop: Duration,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("live transcription is already running"));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let transcript = Arc::clone(&self.transcript);
        let handle = thread::Builder::new()
            .name("live-transcribe".into())
            .spawn(move || {
                transcription_loop(engine, audio, transcript, lang, hop, stop_flag);
            })
            .map_err(|e| anyhow!("failed to spawn transcription worker: {e}"))?;
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stop the worker and wait for its final pass. Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                log_debug("Live transcription worker panicked");
            }
        }
    }
}

impl Default for LiveTranscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LiveTranscription {
    fn drop(&mut self) {
        self.stop();
    }
}

fn transcription_loop(
    engine: Arc<Mutex<dyn SpeechEngine>>,
    audio: SharedSamples,
    transcript: Arc<Mutex<String>>,
    lang: String,
    hop: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut next_pass = Instant::now() + hop;
    loop {
        let stopping = stop.load(Ordering::Relaxed);
        if stopping || Instant::now() >= next_pass {
            run_pass(&engine, &audio, &transcript, &lang);
            next_pass = Instant::now() + hop;
        }
        if stopping {
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
}

fn run_pass(
    engine: &Arc<Mutex<dyn SpeechEngine>>,
    audio: &SharedSamples,
    transcript: &Arc<Mutex<String>>,
    lang: &str,
) {
    // Snapshot the accumulator so the capture thread is not blocked while
    // whisper runs.
    let samples: Vec<f32> = match audio.lock() {
        Ok(buf) => buf.clone(),
        Err(_) => return,
    };
    if samples.is_empty() {
        return;
    }
    let result = match engine.lock() {
        Ok(engine) => engine.transcribe(&samples, lang),
        Err(_) => return,
    };
    match result {
        Ok(text) => {
            if let Ok(mut current) = transcript.lock() {
                *current = text;
            }
        }
        // Keep the last good text on transient failures.
        Err(err) => log_debug(&format!("Live transcription pass failed: {err:#}")),
    }
}
