//! Streaming chat-completion client
//!
//! Performs one streaming request against the gateway and cuts the reply
//! into sentences as tokens arrive. Each completed sentence is scrubbed
//! of markdown and handed to the caller's handler before the next one is
//! parsed, so sentence order is preserved end to end.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::{Error, Result};

/// Overall deadline for one streaming reply
const CHAT_DEADLINE: Duration = Duration::from_secs(60);

/// Future returned by a sentence handler; awaited before the next sentence
pub type SentenceFuture = BoxFuture<'static, ()>;

/// Callback invoked once per completed, cleaned sentence
pub type SentenceHandler<'a> = &'a mut (dyn FnMut(String) -> SentenceFuture + Send);

/// Streaming chat seam used by the audio pipeline
#[async_trait]
pub trait StreamChat: Send + Sync {
    /// Stream one reply, invoking `on_sentence` per completed sentence.
    /// Returns the full raw reply text.
    ///
    /// # Errors
    ///
    /// `Error::Cancelled` when aborted by `cancel` or the 60 s deadline;
    /// `Error::Chat` for non-2xx responses or an empty reply.
    async fn stream_reply(
        &self,
        transcript: &str,
        cancel: &CancellationToken,
        on_sentence: SentenceHandler<'_>,
    ) -> Result<String>;
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(serde::Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completion client for the gateway
pub struct ChatClient {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl ChatClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: GatewayConfig) -> Self {
        Self { client, config }
    }

    async fn run_stream(
        &self,
        transcript: &str,
        on_sentence: SentenceHandler<'_>,
    ) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            stream: true,
            messages: vec![ChatMessage {
                role: "user",
                content: transcript,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.url))
            .bearer_auth(&self.config.token)
            .header("x-openclaw-agent-id", &self.config.agent_id)
            .header("x-openclaw-session-key", &self.config.session_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Chat(format!("HTTP {status}: {body}")));
        }

        let mut stream = response.bytes_stream();
        let mut line_buffer = String::new();
        let mut full_text = String::new();
        let mut splitter = SentenceSplitter::new();
        let mut first_token = true;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Chat(format!("stream read: {e}")))?;
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = line_buffer.find('\n') {
                let line = line_buffer[..line_end].trim().to_string();
                line_buffer.drain(..=line_end);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    break 'read;
                }

                let Ok(parsed) = serde_json::from_str::<StreamChunk>(payload) else {
                    tracing::debug!(line = %payload, "unparseable stream chunk, skipping");
                    continue;
                };
                let Some(delta) = parsed
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.as_deref())
                else {
                    continue;
                };

                if first_token {
                    first_token = false;
                    tracing::debug!("first token received");
                }

                full_text.push_str(delta);
                for sentence in splitter.push(delta) {
                    deliver(sentence, on_sentence).await;
                }
            }
        }

        if let Some(residual) = splitter.flush() {
            deliver(residual, on_sentence).await;
        }

        if full_text.trim().is_empty() {
            return Err(Error::Chat("Empty response".to_string()));
        }

        Ok(full_text)
    }
}

/// Clean a sentence and hand it over unless scrubbing emptied it
async fn deliver(sentence: String, on_sentence: SentenceHandler<'_>) {
    let cleaned = clean_for_tts(&sentence);
    if !cleaned.is_empty() {
        on_sentence(cleaned).await;
    }
}

#[async_trait]
impl StreamChat for ChatClient {
    async fn stream_reply(
        &self,
        transcript: &str,
        cancel: &CancellationToken,
        on_sentence: SentenceHandler<'_>,
    ) -> Result<String> {
        let stream = self.run_stream(transcript, on_sentence);
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(CHAT_DEADLINE, stream) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Cancelled),
                }
            }
        }
    }
}

static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?\n]*[.!?]\s+|[^\n]*\n").unwrap());

/// Incremental sentence segmentation over a token stream
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a
/// newline. The residual tail stays buffered until more tokens arrive or
/// the stream ends.
#[derive(Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a token delta; returns sentences completed by it
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        let mut consumed = 0;
        for found in SENTENCE_BOUNDARY.find_iter(&self.buffer) {
            // Matches are contiguous from the start; a gap means the
            // remainder is still incomplete
            if found.start() != consumed {
                break;
            }
            sentences.push(found.as_str().trim().to_string());
            consumed = found.end();
        }

        self.buffer.drain(..consumed);
        sentences.retain(|s| !s.is_empty());
        sentences
    }

    /// Drain the non-empty residual at stream end
    pub fn flush(&mut self) -> Option<String> {
        let residual = std::mem::take(&mut self.buffer);
        let trimmed = residual.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]*)`").unwrap());
static BOLD_STARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static BOLD_UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__([^_]+)__").unwrap());
static ITALIC_STARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static ITALIC_UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_([^_]+)_").unwrap());
static HEADERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s*").unwrap());
static LINKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static BULLETS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*+]\s+").unwrap());
static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "[\u{1F600}-\u{1F64F}\u{1F300}-\u{1F5FF}\u{1F680}-\u{1F6FF}\u{1F1E0}-\u{1F1FF}\u{2600}-\u{26FF}\u{2700}-\u{27BF}]",
    )
    .unwrap()
});
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Scrub markdown and emoji so the text reads naturally when spoken
#[must_use]
pub fn clean_for_tts(text: &str) -> String {
    let text = FENCED_CODE.replace_all(text, " (code omitted) ");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = BOLD_STARS.replace_all(&text, "$1");
    let text = BOLD_UNDERSCORES.replace_all(&text, "$1");
    let text = ITALIC_STARS.replace_all(&text, "$1");
    let text = ITALIC_UNDERSCORES.replace_all(&text, "$1");
    let text = HEADERS.replace_all(&text, "");
    let text = LINKS.replace_all(&text, "$1");
    let text = BULLETS.replace_all(&text, "");
    let text = EMOJI.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}
