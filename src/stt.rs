//! Speech-to-text engine seam plus the whisper_rs implementation. The
//! wrapper hides whisper's initialization noise and gives the rest of the
//! booth a simple "transcribe these samples" API.

use anyhow::Result;

/// Seam for the live transcription worker; tests inject fixed-output fakes.
pub trait SpeechEngine: Send {
    /// Transcribe 16 kHz mono PCM and return the concatenated text.
    fn transcribe(&self, samples: &[f32], lang: &str) -> Result<String>;

    fn name(&self) -> &'static str {
        "unknown_engine"
    }
}

#[cfg(unix)]
mod platform {
    use super::SpeechEngine;
    use crate::logging::log_debug;
    use anyhow::{anyhow, Context, Result};
    use std::io;
    use std::os::raw::{c_char, c_void};
    use std::os::unix::io::AsRawFd;
    use std::sync::Once;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};
    use whisper_rs_sys::ggml_log_level;

    /// Owns a single Whisper context so every transcription pass in a session
    /// reuses the same memory-mapped model and stays fast.
    pub struct Transcriber {
        ctx: WhisperContext,
    }

    impl Transcriber {
        /// Load the Whisper model, temporarily silencing stderr because
        /// whisper.cpp is chatty.
        pub fn new(model_path: &str) -> Result<Self> {
            install_whisper_log_silencer();

            let null = std::fs::OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .context("failed to open /dev/null")?;
            let null_fd = null.as_raw_fd();

            let orig_stderr = unsafe { libc::dup(2) };
            if orig_stderr < 0 {
                return Err(anyhow!(
                    "failed to dup stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            let dup_result = unsafe { libc::dup2(null_fd, 2) };
            if dup_result < 0 {
                unsafe {
                    libc::close(orig_stderr);
                }
                return Err(anyhow!(
                    "failed to redirect stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            // Load model (output will be suppressed).
            let ctx_result =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default());

            let restore_result = unsafe { libc::dup2(orig_stderr, 2) };
            unsafe {
                libc::close(orig_stderr);
            }
            if restore_result < 0 {
                return Err(anyhow!(
                    "failed to restore stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            let ctx = ctx_result.context("failed to load whisper model")?;
            Ok(Self { ctx })
        }
    }

    impl SpeechEngine for Transcriber {
        fn transcribe(&self, samples: &[f32], lang: &str) -> Result<String> {
            let mut state = self
                .ctx
                .create_state()
                .context("failed to create whisper state")?;
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some(lang));
            // Limit CPU usage so laptops don't max out all cores.
            params.set_n_threads(num_cpus::get().min(8) as i32);
            params.set_print_progress(false);
            params.set_print_timestamps(false);
            params.set_print_special(false);
            params.set_print_realtime(false);
            params.set_translate(false);
            params.set_token_timestamps(false);
            state.full(params, samples)?;
            let mut transcript = String::new();
            let num_segments = state.full_n_segments();
            if num_segments < 0 {
                log_debug("Whisper returned a negative segment count");
                return Ok(transcript);
            }
            // Whisper splits output into small segments; stitch them together.
            for i in 0..num_segments {
                let Some(segment) = state.get_segment(i) else {
                    log_debug(&format!("Failed to access whisper segment {i}"));
                    continue;
                };
                match segment.to_str() {
                    Ok(text) => transcript.push_str(text),
                    Err(err) => log_debug(&format!("Failed to read whisper segment {i}: {err}")),
                }
            }
            Ok(transcript)
        }

        fn name(&self) -> &'static str {
            "whisper"
        }
    }

    fn install_whisper_log_silencer() {
        static INSTALL_LOG_CALLBACK: Once = Once::new();
        INSTALL_LOG_CALLBACK.call_once(|| unsafe {
            whisper_rs::set_log_callback(Some(whisper_log_callback), std::ptr::null_mut());
        });
    }

    #[allow(unused_variables)]
    unsafe extern "C" fn whisper_log_callback(
        _level: ggml_log_level,
        _text: *const c_char,
        _user_data: *mut c_void,
    ) {
        // Silence the default whisper.cpp logger so it does not corrupt the prompt.
    }
}

#[cfg(unix)]
pub use platform::Transcriber;

#[cfg(not(unix))]
mod platform {
    use super::SpeechEngine;
    use anyhow::{anyhow, Result};

    /// Stub implementation for unsupported targets such as Windows. The
    /// construction error is what drives the permanent "speech-to-text
    /// unsupported" state in the booth.
    pub struct Transcriber;

    impl Transcriber {
        pub fn new(_: &str) -> Result<Self> {
            Err(anyhow!(
                "speech-to-text is currently supported only on Unix-like platforms"
            ))
        }
    }

    impl SpeechEngine for Transcriber {
        fn transcribe(&self, _: &[f32], _: &str) -> Result<String> {
            Err(anyhow!(
                "speech-to-text is currently supported only on Unix-like platforms"
            ))
        }
    }
}

#[cfg(not(unix))]
pub use platform::Transcriber;
