//! HTTP text-to-speech client.
//! Posts the utterance to the synthesis endpoint and streams the MP3 response
//! body straight into an [`Mp3Player`], so playback starts on the first chunk.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::debug;

use super::player::Mp3Player;
use super::{SpeechError, SpeechSink};
use crate::config::TtsConfig;

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'static str,
    sample_rate: u32,
}

pub struct TtsSpeaker {
    http: reqwest::Client,
    url: String,
    api_key: String,
    voice: String,
    sample_rate: u32,
    ffmpeg_bin: String,
    runtime: Handle,
}

impl TtsSpeaker {
    /// `runtime` drives the HTTP stream from the (non-async) utterance thread.
    pub fn new(cfg: &TtsConfig, api_key: String, runtime: Handle) -> Result<Self, SpeechError> {
        let url = cfg
            .url
            .clone()
            .ok_or_else(|| SpeechError::NotConfigured("tts.url not set".into()))?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            url,
            api_key,
            voice: cfg.voice.clone(),
            sample_rate: cfg.sample_rate,
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            runtime,
        })
    }

    async fn stream_into(&self, text: &str, player: &mut Mp3Player) -> Result<(), SpeechError> {
        let body = SynthesisRequest {
            text,
            voice: &self.voice,
            format: "mp3",
            sample_rate: self.sample_rate,
        };
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            total += bytes.len();
            player.feed(&bytes)?;
        }
        debug!(bytes = total, "tts audio received");
        Ok(())
    }
}

impl SpeechSink for TtsSpeaker {
    fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let mut player = Mp3Player::start(&self.ffmpeg_bin)?;
        self.runtime.block_on(self.stream_into(text, &mut player))?;
        player.finish()
    }
}
