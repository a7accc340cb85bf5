//! Audio pipeline
//!
//! Owns each utterance from enqueue to playback completion: STT, the
//! streaming chat reply, per-sentence cache-first synthesis, and strictly
//! ordered playback into the voice sink. At most one utterance is
//! processed at a time; an interrupt aborts the in-flight reply, empties
//! both queues and hard-stops playback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{cache_key, TtsCache};
use crate::chat::{SentenceFuture, StreamChat};
use crate::config::{CacheConfig, TtsConfig};
use crate::metrics::{names, Metrics};
use crate::platform::{AudioChunk, Player, StreamContainer};
use crate::stt::Transcribe;
use crate::tts::Synthesize;

/// Delay before the drain loop retries after a transient failure
const DRAIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Poll interval while waiting for playback to finish
const PLAYBACK_POLL: Duration = Duration::from_millis(100);

/// One contiguous span of the target user's speech
#[derive(Debug)]
pub struct Utterance {
    /// Strictly increasing per session, carried through every log line
    pub id: String,
    /// Interleaved 16-bit 48 kHz stereo PCM
    pub pcm: Vec<u8>,
    /// When the silence window closed the capture
    pub arrived_at: Instant,
}

struct PipelineState {
    utterances: VecDeque<Utterance>,
    chunks: VecDeque<AudioChunk>,
    processing: bool,
    playing_audio: bool,
    e2e_recorded: bool,
    current_abort: CancellationToken,
    current_utt_id: String,
    last_transcript: Option<String>,
    utterance_start: Instant,
    /// Bumped by every interrupt; stale drain tasks and TTS callbacks
    /// check it before touching the queues
    epoch: u64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            utterances: VecDeque::new(),
            chunks: VecDeque::new(),
            processing: false,
            playing_audio: false,
            e2e_recorded: false,
            current_abort: CancellationToken::new(),
            current_utt_id: String::new(),
            last_transcript: None,
            utterance_start: Instant::now(),
            epoch: 0,
        }
    }
}

/// The capture-to-playback pipeline for one voice session
pub struct AudioPipeline {
    state: Mutex<PipelineState>,
    stt: Arc<dyn Transcribe>,
    chat: Arc<dyn StreamChat>,
    tts: Arc<dyn Synthesize>,
    player: Arc<dyn Player>,
    cache: Arc<TtsCache>,
    metrics: Arc<Metrics>,
    tts_config: TtsConfig,
    cache_config: CacheConfig,
    noise_filter_enabled: bool,
    on_bot_speech: Box<dyn Fn() + Send + Sync>,
}

impl AudioPipeline {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        stt: Arc<dyn Transcribe>,
        chat: Arc<dyn StreamChat>,
        tts: Arc<dyn Synthesize>,
        player: Arc<dyn Player>,
        cache: Arc<TtsCache>,
        metrics: Arc<Metrics>,
        tts_config: TtsConfig,
        cache_config: CacheConfig,
        noise_filter_enabled: bool,
        on_bot_speech: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            state: Mutex::new(PipelineState::default()),
            stt,
            chat,
            tts,
            player,
            cache,
            metrics,
            tts_config,
            cache_config,
            noise_filter_enabled,
            on_bot_speech,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn the listener that advances playback on player idle events.
    /// Call once after construction.
    pub fn attach_player_events(self: &Arc<Self>) {
        let mut idle = self.player.idle_events();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while idle.recv().await.is_some() {
                this.lock().playing_audio = false;
                this.play_next_chunk().await;
            }
        });
    }

    /// Append an utterance and start draining if idle
    pub fn enqueue(self: &Arc<Self>, utterance: Utterance) {
        tracing::info!(
            event = "UTTERANCE_RECEIVED",
            utt_id = %utterance.id,
            pcm_bytes = utterance.pcm.len(),
            "utterance queued"
        );
        self.lock().utterances.push_back(utterance);
        self.kick_drain();
    }

    /// Start the drain task when there is queued work and no drain running
    fn kick_drain(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.lock();
            if state.processing || state.utterances.is_empty() {
                return;
            }
            state.processing = true;
            state.epoch
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drain(epoch).await;
        });
    }

    async fn drain(self: Arc<Self>, epoch: u64) {
        loop {
            let utterance = {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return;
                }
                match state.utterances.pop_front() {
                    Some(u) => {
                        state.current_utt_id = u.id.clone();
                        state.utterance_start = Instant::now();
                        state.e2e_recorded = false;
                        state.current_abort = CancellationToken::new();
                        Some(u)
                    }
                    None => {
                        state.processing = false;
                        None
                    }
                }
            };
            let Some(utterance) = utterance else { return };
            let abort = self.lock().current_abort.clone();

            match self.process_utterance(&utterance, &abort, epoch).await {
                Ok(()) => {
                    if !self.wait_for_playback_complete(epoch).await {
                        return;
                    }
                    tracing::info!(
                        event = "UTTERANCE_COMPLETE",
                        utt_id = %utterance.id,
                        "utterance finished"
                    );
                }
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(utt_id = %utterance.id, "utterance cancelled");
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        utt_id = %utterance.id,
                        error = %e,
                        "pipeline error, retrying drain shortly"
                    );
                    {
                        let mut state = self.lock();
                        if state.epoch == epoch {
                            state.processing = false;
                            state.current_abort = CancellationToken::new();
                        }
                    }
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::time::sleep(DRAIN_RETRY_DELAY).await;
                        this.kick_drain();
                    });
                    return;
                }
            }
        }
    }

    async fn process_utterance(
        self: &Arc<Self>,
        utterance: &Utterance,
        abort: &CancellationToken,
        epoch: u64,
    ) -> crate::Result<()> {
        let utt_id = utterance.id.clone();

        tracing::info!(event = "STT_START", utt_id = %utt_id, "transcribing");
        self.metrics.increment(names::STT_REQUESTS);
        let stt_started = Instant::now();
        let transcript = self.stt.transcribe(&utterance.pcm).await?;
        self.metrics
            .record_timing(names::STT_LATENCY_MS, millis_since(stt_started));
        tracing::info!(
            event = "STT_DONE",
            utt_id = %utt_id,
            chars = transcript.len(),
            "transcription complete"
        );

        if transcript.is_empty() {
            tracing::debug!(utt_id = %utt_id, "empty transcript, nothing to do");
            return Ok(());
        }

        if self.noise_filter_enabled && is_noise(&transcript) {
            tracing::info!(
                event = "UTTERANCE_FILTERED",
                utt_id = %utt_id,
                transcript = %transcript,
                "noise filtered"
            );
            return Ok(());
        }

        self.lock().last_transcript = Some(transcript.clone());

        tracing::info!(event = "LLM_START", utt_id = %utt_id, "streaming reply");
        let llm_started = Instant::now();
        let first_sentence = AtomicBool::new(true);

        let this = Arc::clone(self);
        let sentence_utt = utt_id.clone();
        let mut on_sentence = move |sentence: String| -> SentenceFuture {
            if first_sentence.swap(false, Ordering::SeqCst) {
                tracing::info!(event = "LLM_FIRST_TOKEN", utt_id = %sentence_utt, "first sentence ready");
            }
            let this = Arc::clone(&this);
            let utt_id = sentence_utt.clone();
            Box::pin(async move {
                this.sentence_to_audio(&utt_id, &sentence, epoch).await;
            })
        };

        match self
            .chat
            .stream_reply(&transcript, abort, &mut on_sentence)
            .await
        {
            Ok(full_text) => {
                self.metrics
                    .record_timing(names::LLM_LATENCY_MS, millis_since(llm_started));
                tracing::info!(
                    event = "LLM_DONE",
                    utt_id = %utt_id,
                    chars = full_text.len(),
                    "reply stream complete"
                );
                Ok(())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.metrics.increment(names::LLM_ERRORS);
                }
                Err(e)
            }
        }
    }

    /// Resolve one sentence to audio (cache first) and queue it for
    /// playback. Per-sentence synthesis failures are logged and skipped
    /// so the rest of the reply still plays.
    async fn sentence_to_audio(self: &Arc<Self>, utt_id: &str, sentence: &str, epoch: u64) {
        let key = cache_key(&self.tts_config, sentence);

        let chunk = if self.cache_config.enabled {
            self.cache.get(&key).map(|bytes| AudioChunk {
                bytes,
                container: StreamContainer::Arbitrary,
            })
        } else {
            None
        };

        let chunk = match chunk {
            Some(chunk) => Some(chunk),
            None => {
                tracing::info!(event = "TTS_START", utt_id = %utt_id, chars = sentence.len(), "synthesising");
                self.metrics.increment(names::TTS_REQUESTS);
                let tts_started = Instant::now();
                match self.tts.synthesize(sentence).await {
                    Ok(bytes) => {
                        self.metrics
                            .record_timing(names::TTS_LATENCY_MS, millis_since(tts_started));
                        tracing::info!(
                            event = "TTS_DONE",
                            utt_id = %utt_id,
                            bytes = bytes.len(),
                            "synthesis complete"
                        );
                        if self.cache_config.enabled {
                            self.cache
                                .set(&key, bytes.clone(), self.cache_config.max_size_mb);
                        }
                        Some(AudioChunk {
                            bytes,
                            container: StreamContainer::Arbitrary,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(
                            utt_id = %utt_id,
                            error = %e,
                            "sentence synthesis failed, skipping"
                        );
                        None
                    }
                }
            }
        };

        if let Some(chunk) = chunk {
            self.submit_chunk_inner(chunk, Some(epoch)).await;
        }
    }

    /// Queue a chunk for playback, kicking the player if it is idle
    pub async fn submit_chunk(self: &Arc<Self>, chunk: AudioChunk) {
        self.submit_chunk_inner(chunk, None).await;
    }

    async fn submit_chunk_inner(self: &Arc<Self>, chunk: AudioChunk, epoch: Option<u64>) {
        let start_playback = {
            let mut state = self.lock();
            // A stale callback racing a fresh interrupt has nowhere to
            // deliver its audio
            if epoch.is_some_and(|e| e != state.epoch) {
                return;
            }
            state.chunks.push_back(chunk);
            !state.playing_audio
        };
        if start_playback {
            self.play_next_chunk().await;
        }
    }

    /// Pop and play the head chunk; logs completion when the queue is dry
    async fn play_next_chunk(self: &Arc<Self>) {
        let (chunk, utt_id, e2e_start) = {
            let mut state = self.lock();
            // Another caller is already driving playback; the idle event
            // for its chunk will advance the queue
            if state.playing_audio {
                return;
            }
            match state.chunks.pop_front() {
                Some(chunk) => {
                    state.playing_audio = true;
                    let e2e_start = if state.e2e_recorded {
                        None
                    } else {
                        state.e2e_recorded = true;
                        Some(state.utterance_start)
                    };
                    (Some(chunk), state.current_utt_id.clone(), e2e_start)
                }
                None => {
                    state.playing_audio = false;
                    (None, state.current_utt_id.clone(), None)
                }
            }
        };

        let Some(chunk) = chunk else {
            tracing::info!(event = "PLAYBACK_DONE", utt_id = %utt_id, "playback queue drained");
            return;
        };

        (self.on_bot_speech)();

        if let Some(started) = e2e_start {
            self.metrics
                .record_timing(names::E2E_LATENCY_MS, millis_since(started));
            tracing::info!(event = "PLAYBACK_START", utt_id = %utt_id, "first audio for utterance");
        }

        if let Err(e) = self.player.play(chunk).await {
            tracing::warn!(utt_id = %utt_id, error = %e, "playback submission failed");
            self.lock().playing_audio = false;
        }
    }

    /// Poll until the chunk queue is empty and the player is idle.
    /// Returns false when an interrupt invalidated this drain.
    async fn wait_for_playback_complete(&self, epoch: u64) -> bool {
        loop {
            {
                let state = self.lock();
                if state.epoch != epoch {
                    return false;
                }
                if state.chunks.is_empty() && !state.playing_audio {
                    return true;
                }
            }
            tokio::time::sleep(PLAYBACK_POLL).await;
        }
    }

    /// Abort the in-flight reply, drop all queued audio and hard-stop the
    /// player. No partial audio survives.
    pub async fn interrupt(&self) {
        let utt_id = {
            let mut state = self.lock();
            state.epoch += 1;
            state.current_abort.cancel();
            state.utterances.clear();
            state.chunks.clear();
            state.playing_audio = false;
            state.processing = false;
            state.current_utt_id.clone()
        };
        self.player.stop().await;
        tracing::info!(event = "INTERRUPT", utt_id = %utt_id, "pipeline interrupted");
    }

    /// Speak a system phrase (prompt, announcement) through the normal
    /// cache-first synthesis path
    pub async fn speak(self: &Arc<Self>, text: &str) {
        let epoch = self.lock().epoch;
        self.sentence_to_audio("system", text, epoch).await;
    }

    /// Transcript of the most recent processed utterance, for stall
    /// recovery
    #[must_use]
    pub fn last_transcript(&self) -> Option<String> {
        self.lock().last_transcript.clone()
    }

    /// Whether the pipeline currently has queued or playing work
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.processing && state.chunks.is_empty() && !state.playing_audio
    }
}

static NOISE_FILLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(um|uh|hmm|oh|ah|huh)\.?$").unwrap());
static NOISE_NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\W+$").unwrap());

/// Filler-word heuristic: short transcripts that are just hesitation
/// sounds or punctuation
#[must_use]
pub fn is_noise(transcript: &str) -> bool {
    let trimmed = transcript.trim();
    if trimmed.split_whitespace().count() > 2 {
        return false;
    }
    NOISE_FILLER.is_match(trimmed) || NOISE_NON_WORD.is_match(trimmed)
}

fn millis_since(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
