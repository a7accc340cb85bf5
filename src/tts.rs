//! Text-to-speech client
//!
//! Two synthesis paths: `synthesize` returns the provider's default
//! compressed container (played as-is), `synthesize_baked` requests an
//! OGG Opus byte stream for the on-disk baked phrase store.

use async_trait::async_trait;

use crate::config::{TtsConfig, TtsProvider};
use crate::{Error, Result};

/// Provider input limit; longer sentences are truncated with an ellipsis
const MAX_INPUT_CHARS: usize = 4093;

/// Synthesis seam used by the pipeline and the pre-warm path
#[async_trait]
pub trait Synthesize: Send + Sync {
    /// Synthesize to the provider's default container
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Synthesize to an OGG Opus byte stream (baked phrases only)
    async fn synthesize_baked(&self, text: &str) -> Result<Vec<u8>>;
}

/// Synthesizes speech via the configured HTTP endpoint
pub struct TtsClient {
    client: reqwest::Client,
    config: TtsConfig,
}

impl TtsClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: TtsConfig) -> Self {
        Self { client, config }
    }

    async fn request(&self, text: &str, response_format: Option<&str>) -> Result<Vec<u8>> {
        let input = truncate_input(text);

        let response = match self.config.provider {
            TtsProvider::OpenAi => {
                #[derive(serde::Serialize)]
                struct SpeechRequest<'a> {
                    model: &'a str,
                    voice: &'a str,
                    input: &'a str,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    response_format: Option<&'a str>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    instructions: Option<&'a str>,
                }

                let request = SpeechRequest {
                    model: &self.config.model,
                    voice: &self.config.voice,
                    input: &input,
                    response_format,
                    instructions: self.config.instructions.as_deref(),
                };

                self.client
                    .post(format!("{}/audio/speech", self.config.base_url))
                    .bearer_auth(&self.config.api_key)
                    .json(&request)
                    .send()
                    .await?
            }
            TtsProvider::ElevenLabs => {
                #[derive(serde::Serialize)]
                struct ElevenLabsRequest<'a> {
                    text: &'a str,
                    model_id: &'a str,
                }

                let request = ElevenLabsRequest {
                    text: &input,
                    model_id: &self.config.model,
                };

                let mut builder = self
                    .client
                    .post(format!(
                        "{}/text-to-speech/{}",
                        self.config.base_url, self.config.voice
                    ))
                    .header("xi-api-key", &self.config.api_key)
                    .json(&request);
                if let Some(format) = response_format {
                    builder = builder.query(&[("output_format", format)]);
                }
                builder.send().await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("HTTP {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Synthesize for TtsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.request(text, None).await
    }

    async fn synthesize_baked(&self, text: &str) -> Result<Vec<u8>> {
        self.request(text, Some("opus")).await
    }
}

/// Clamp input to the provider limit, marking the cut with an ellipsis
fn truncate_input(text: &str) -> String {
    if text.chars().count() <= MAX_INPUT_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_INPUT_CHARS).collect();
    truncated.push_str("...");
    truncated
}
