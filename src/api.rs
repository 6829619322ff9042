//! HTTP submission sink. Posts the assembled answer to the interview server
//! as a multipart form: text fields for the transcript and frames, a file
//! part for the recorded audio.

use anyhow::{bail, Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use std::time::Duration;

use crate::submit::{SubmissionPayload, SubmitOutcome, SubmitSink};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpSink {
    client: Client,
    base_url: String,
    session_id: String,
    question_id: String,
}

impl HttpSink {
    pub fn new(base_url: &str, session_id: &str, question_id: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            question_id: question_id.to_string(),
        })
    }

    fn answer_url(&self) -> String {
        format!(
            "{}/answer/{}/{}",
            self.base_url, self.session_id, self.question_id
        )
    }
}

impl SubmitSink for HttpSink {
    fn submit(&mut self, payload: &SubmissionPayload) -> Result<SubmitOutcome> {
        let mut form = Form::new()
            .text("transcript", payload.transcript.clone())
            .text("cropEnabled", payload.crop_enabled.to_string());
        for (i, frame) in payload.frames.iter().enumerate() {
            form = form.text(format!("frame{i}"), frame.clone());
        }
        if let Some(blob) = payload.media_blob.as_ref() {
            let part = Part::bytes(blob.clone())
                .file_name("answer.wav")
                .mime_str("audio/wav")
                .context("invalid audio mime type")?;
            form = form.part("media", part);
        }

        let response = self
            .client
            .post(self.answer_url())
            .multipart(form)
            .send()
            .context("failed to reach the interview server")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("answer submission failed with {status}: {body}");
        }
        response
            .json::<SubmitOutcome>()
            .context("failed to parse the grading response")
    }
}
