//! Session orchestrator
//!
//! Watches presence events for the target user, joins and leaves the
//! voice channel, runs the capture loop that turns Opus packets into
//! utterances, and owns the reconnect state machine. Wires the pipeline,
//! heartbeat, cache pre-warm and metrics together for one session at a
//! time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{PhraseLabel, TtsCache};
use crate::chat::StreamChat;
use crate::config::Config;
use crate::health::{self, HealthState};
use crate::heartbeat::{HeartbeatCallbacks, LivenessCallback, VoiceHeartbeat};
use crate::metrics::{names, Metrics};
use crate::pipeline::{AudioPipeline, Utterance};
use crate::platform::{
    AudioChunk, AudioReceiver, ConnectionState, OpusDecoder, PresenceChange, ReceiverEvent,
    StreamContainer, VoiceConnection, VoicePlatform, PCM_BYTE_RATE,
};
use crate::stt::Transcribe;
use crate::tts::Synthesize;
use crate::{Error, Result};

/// How long a fresh or reconnecting session may take to reach Ready
const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a reconnect attempt may take to reach Signalling
const SIGNALLING_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive decode failures before a warning
const DECODE_FAIL_WARN: u32 = 20;

/// Consecutive decode failures before the receive stream is destroyed
const DECODE_FAIL_RESET: u32 = 50;

/// Fallback when no baked check-in phrase is cached
const SILENCE_FALLBACK: &str = "Still there?";

/// Played when the idle disconnect is imminent
const GRACE_LINE: &str = "I'll head out in a moment if you don't need anything else.";

/// Played when the bot stalled on a reply
const RECOVERY_LINE: &str =
    "Sorry, I lost my train of thought there. Could you say that again?";

/// Default phrases baked for session greetings
#[must_use]
pub fn default_greetings() -> Vec<String> {
    [
        "Hey! I'm here.",
        "Hello! Good to hear you.",
        "Hi there, what's on your mind?",
    ]
    .map(String::from)
    .to_vec()
}

/// Default phrases baked for silence check-ins
#[must_use]
pub fn default_check_ins() -> Vec<String> {
    [
        "Still there?",
        "Anything else on your mind?",
        "I'm still around if you need me.",
    ]
    .map(String::from)
    .to_vec()
}

/// Everything a running session's tasks need to reach each other
#[derive(Clone)]
struct SessionHandles {
    connection: Arc<dyn VoiceConnection>,
    pipeline: Arc<AudioPipeline>,
    heartbeat: Arc<VoiceHeartbeat>,
    capturing: Arc<AtomicBool>,
    /// Replaced when the capture loop restarts (desync, reconnect)
    capture_token: Arc<std::sync::Mutex<CancellationToken>>,
    /// Stall-recovery toggle: full recovery and replay-only alternate
    stall_recovered: Arc<AtomicBool>,
}

struct ActiveSession {
    handles: SessionHandles,
    watcher_task: tokio::task::JoinHandle<()>,
    metrics_task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct OrchestratorState {
    session: Option<ActiveSession>,
    user_left_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Presence-driven session manager, one instance per bridge process
pub struct SessionOrchestrator {
    config: Arc<Config>,
    platform: Arc<dyn VoicePlatform>,
    stt: Arc<dyn Transcribe>,
    chat: Arc<dyn StreamChat>,
    tts: Arc<dyn Synthesize>,
    cache: Arc<TtsCache>,
    metrics: Arc<Metrics>,
    inner: Mutex<OrchestratorState>,
    joining: AtomicBool,
    reconnecting: AtomicBool,
    tearing_down: AtomicBool,
    utt_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        platform: Arc<dyn VoicePlatform>,
        stt: Arc<dyn Transcribe>,
        chat: Arc<dyn StreamChat>,
        tts: Arc<dyn Synthesize>,
        cache: Arc<TtsCache>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            platform,
            stt,
            chat,
            tts,
            cache,
            metrics,
            inner: Mutex::new(OrchestratorState::default()),
            joining: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            utt_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Request a graceful stop of [`SessionOrchestrator::run`]
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shut down, reacting to presence changes for the target
    /// user
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the health probe
    /// port cannot be bound.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;

        let _health_task = match self.config.observability.health_port {
            Some(port) => Some(
                health::serve(
                    port,
                    HealthState {
                        started_at: std::time::Instant::now(),
                        metrics: Arc::clone(&self.metrics),
                    },
                )
                .await?,
            ),
            None => None,
        };

        let mut presence = self.platform.presence_events();
        tracing::info!(
            target_user = %self.config.target_user_id,
            channel = %self.config.target_channel_id,
            "watching presence"
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.teardown("shutdown").await;
                    return Ok(());
                }
                change = presence.recv() => {
                    let Some(change) = change else {
                        self.teardown("presence stream closed").await;
                        return Ok(());
                    };
                    self.handle_presence(change).await;
                }
            }
        }
    }

    async fn handle_presence(self: &Arc<Self>, change: PresenceChange) {
        if change.user_id != self.config.target_user_id {
            return;
        }

        let target = self.config.target_channel_id.as_str();
        let entered = change.new_channel_id.as_deref() == Some(target);
        let left = change.old_channel_id.as_deref() == Some(target) && !entered;

        if entered {
            let pending_leave = self.inner.lock().await.user_left_timer.take();
            if let Some(timer) = pending_leave {
                timer.abort();
                tracing::info!("target user returned within grace period");
            }

            let connected = self.inner.lock().await.session.is_some();
            if self.config.auto_join && !connected {
                if let Err(e) = self.join_channel().await {
                    tracing::error!(error = %e, "failed to join voice channel");
                }
            }
        } else if left {
            let mut inner = self.inner.lock().await;
            if inner.session.is_some() && inner.user_left_timer.is_none() {
                let grace = self.config.resilience.user_left_grace_sec;
                tracing::info!(grace_sec = grace, "target user left, starting grace timer");
                let this = Arc::clone(self);
                inner.user_left_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(grace)).await;
                    tracing::info!("target user did not return, leaving channel");
                    this.teardown("user left").await;
                }));
            }
        }
    }

    /// Join the configured channel and start a session. Guarded so a
    /// burst of presence events starts only one join.
    async fn join_channel(self: &Arc<Self>) -> Result<()> {
        if self.joining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.join_channel_inner().await;
        self.joining.store(false, Ordering::SeqCst);
        result
    }

    async fn join_channel_inner(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        tracing::info!(
            channel = %config.target_channel_id,
            guild = %config.guild_id,
            "joining voice channel"
        );

        let connection = self
            .platform
            .join(&config.target_channel_id, &config.guild_id)
            .await?;
        self.metrics.increment(names::SESSION_COUNT);

        // The pipeline is created before the heartbeat, so its bot-speech
        // callback reaches the heartbeat through this slot
        let heartbeat_slot: Arc<std::sync::Mutex<Option<Arc<VoiceHeartbeat>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&heartbeat_slot);
        let on_bot_speech = Box::new(move || {
            let guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(heartbeat) = guard.as_ref() {
                heartbeat.report_bot_speech();
            }
        });

        let pipeline = Arc::new(AudioPipeline::new(
            Arc::clone(&self.stt),
            Arc::clone(&self.chat),
            Arc::clone(&self.tts),
            connection.player(),
            Arc::clone(&self.cache),
            Arc::clone(&self.metrics),
            config.tts.clone(),
            config.cache.clone(),
            config.vad.noise_filter_enabled,
            on_bot_speech,
        ));
        pipeline.attach_player_events();

        if let Err(e) = wait_for_state(connection.as_ref(), ConnectionState::Ready, READY_TIMEOUT).await
        {
            tracing::error!(error = %e, "connection never became ready");
            connection.disconnect().await;
            return Err(e);
        }
        tracing::info!("voice connection ready");

        if config.cache.enabled && config.cache.pre_warm_on_connect {
            for (phrases, label) in [
                (default_greetings(), PhraseLabel::Greetings),
                (default_check_ins(), PhraseLabel::CheckIns),
            ] {
                if let Err(e) = self
                    .cache
                    .pre_warm(&phrases, label, self.tts.as_ref(), &config.tts, &config.cache)
                    .await
                {
                    tracing::warn!(label = label.as_str(), error = %e, "phrase pre-warm failed");
                }
            }

            if let Some((bytes, is_baked)) = self.cache.get_random_phrase(PhraseLabel::Greetings)
            {
                pipeline
                    .submit_chunk(AudioChunk {
                        bytes,
                        container: container_for(is_baked),
                    })
                    .await;
            }
        }

        let handles = SessionHandles {
            connection: Arc::clone(&connection),
            pipeline,
            heartbeat: VoiceHeartbeat::start(
                config.heartbeat.clone(),
                config.resilience.clone(),
                Arc::clone(&self.metrics),
                self.liveness_callbacks(),
            ),
            capturing: Arc::new(AtomicBool::new(false)),
            capture_token: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
            stall_recovered: Arc::new(AtomicBool::new(false)),
        };
        *heartbeat_slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::clone(&handles.heartbeat));

        // Disconnect watcher, installed only after the initial Ready so
        // the normal Signalling → Ready progression cannot trip it
        let watcher_task = {
            let this = Arc::clone(self);
            let mut states = handles.connection.state_changes();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow();
                    if state == ConnectionState::Disconnected {
                        if this.tearing_down.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!("voice connection lost");
                        this.handle_disconnect().await;
                    }
                }
            })
        };

        let metrics_task = {
            let metrics = Arc::clone(&self.metrics);
            let interval_sec = config.observability.metrics_log_interval_sec;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_sec));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    metrics.log_snapshot();
                }
            })
        };

        self.start_capture_loop(handles.clone());

        let mut inner = self.inner.lock().await;
        inner.session = Some(ActiveSession {
            handles,
            watcher_task,
            metrics_task,
        });
        tracing::info!("voice session started");
        Ok(())
    }

    /// Build the heartbeat callbacks. They capture a weak reference so a
    /// torn-down orchestrator is not kept alive by its own heartbeat.
    fn liveness_callbacks(self: &Arc<Self>) -> HeartbeatCallbacks {
        fn callback<F>(weak: Weak<SessionOrchestrator>, handler: F) -> LivenessCallback
        where
            F: Fn(Arc<SessionOrchestrator>) -> futures::future::BoxFuture<'static, ()>
                + Send
                + Sync
                + 'static,
        {
            Arc::new(move || match weak.upgrade() {
                Some(this) => handler(this),
                None => {
                    let noop: futures::future::BoxFuture<'static, ()> = Box::pin(async {});
                    noop
                }
            })
        }

        let weak = Arc::downgrade(self);
        HeartbeatCallbacks {
            on_silence_prompt: callback(weak.clone(), |this| {
                Box::pin(async move { this.handle_silence_prompt().await })
            }),
            on_bot_stall: callback(weak.clone(), |this| {
                Box::pin(async move { this.handle_bot_stall().await })
            }),
            on_audio_desync: callback(weak.clone(), |this| {
                Box::pin(async move { this.handle_audio_desync().await })
            }),
            on_grace_announce: callback(weak.clone(), |this| {
                Box::pin(async move { this.handle_grace_announce().await })
            }),
            on_idle_timeout: callback(weak, |this| {
                Box::pin(async move { this.teardown("idle timeout").await })
            }),
        }
    }

    async fn session_handles(&self) -> Option<SessionHandles> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.handles.clone())
    }

    /// Play a baked check-in, or fall back to synthesising one
    async fn handle_silence_prompt(self: &Arc<Self>) {
        let Some(handles) = self.session_handles().await else {
            return;
        };

        match self.cache.get_random_phrase(PhraseLabel::CheckIns) {
            Some((bytes, is_baked)) => {
                handles
                    .pipeline
                    .submit_chunk(AudioChunk {
                        bytes,
                        container: container_for(is_baked),
                    })
                    .await;
            }
            None => handles.pipeline.speak(SILENCE_FALLBACK).await,
        }
    }

    async fn handle_grace_announce(self: &Arc<Self>) {
        if let Some(handles) = self.session_handles().await {
            handles.pipeline.speak(GRACE_LINE).await;
        }
    }

    /// First stall: interrupt, apologise and force a reconnect. The next
    /// one only replays the apology; the flag alternates.
    async fn handle_bot_stall(self: &Arc<Self>) {
        let Some(handles) = self.session_handles().await else {
            return;
        };
        if handles.pipeline.last_transcript().is_none() {
            return;
        }

        let full_recovery = !handles.stall_recovered.fetch_xor(true, Ordering::SeqCst);
        if full_recovery {
            tracing::warn!("bot stall: interrupting and forcing a reconnect");
            handles.pipeline.interrupt().await;
            handles.pipeline.speak(RECOVERY_LINE).await;
            self.handle_disconnect().await;
        } else {
            tracing::warn!("bot stall: replaying recovery line");
            handles.pipeline.speak(RECOVERY_LINE).await;
        }
    }

    /// Frames stopped arriving mid-speech: resubscribe by restarting the
    /// capture loop
    async fn handle_audio_desync(self: &Arc<Self>) {
        let Some(handles) = self.session_handles().await else {
            return;
        };
        tracing::info!("restarting capture loop after audio desync");
        replace_capture_token(&handles);
        if handles.capturing.swap(false, Ordering::SeqCst) {
            // The dead receive stream still had a listener attached; the
            // next speaking start subscribes a fresh one over it
            tracing::info!(event = "LISTENER_STACKED", "stale audio listener replaced");
        }
        self.start_capture_loop(handles);
    }

    /// Spawn the speaking-event loop; one capture task at a time feeds
    /// the pipeline
    fn start_capture_loop(self: &Arc<Self>, handles: SessionHandles) {
        let token = handles
            .capture_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let mut speaking = handles.connection.speaking_events();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let user_id = tokio::select! {
                    () = token.cancelled() => break,
                    user = speaking.recv() => match user {
                        Some(user) => user,
                        None => break,
                    },
                };
                if user_id != this.config.target_user_id {
                    continue;
                }

                if handles.capturing.swap(true, Ordering::SeqCst) {
                    let utt_id = this.next_utt_id();
                    tracing::info!(
                        event = "UTTERANCE_DROPPED_CAPTURING",
                        utt_id = %utt_id,
                        "speaking start during active capture"
                    );
                    this.metrics.increment(names::CAPTURE_DROPPED);
                    continue;
                }

                handles.heartbeat.report_user_speech();
                handles.heartbeat.set_user_speaking(true);
                handles.pipeline.interrupt().await;

                match handles
                    .connection
                    .subscribe_audio(&user_id, this.config.vad.silence_threshold_ms)
                {
                    Ok(receiver) => {
                        let this = Arc::clone(&this);
                        let handles = handles.clone();
                        tokio::spawn(async move {
                            this.capture_utterance(receiver, handles).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "audio subscription failed");
                        handles.capturing.store(false, Ordering::SeqCst);
                        handles.heartbeat.set_user_speaking(false);
                    }
                }
            }
        });
    }

    /// Drain one receive stream into a PCM buffer and hand it to the
    /// pipeline when the silence window closes it
    async fn capture_utterance(self: &Arc<Self>, mut receiver: AudioReceiver, handles: SessionHandles) {
        let mut decoder = match OpusDecoder::new() {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::error!(error = %e, "opus decoder init failed");
                handles.capturing.store(false, Ordering::SeqCst);
                handles.heartbeat.set_user_speaking(false);
                return;
            }
        };

        let max_bytes = self.config.vad.max_utterance_sec * PCM_BYTE_RATE;
        let mut pcm: Vec<u8> = Vec::new();
        let mut consecutive_fails: u32 = 0;
        let mut warned = false;

        while let Some(event) = receiver.events.recv().await {
            match event {
                ReceiverEvent::Packet(packet) => {
                    handles.heartbeat.report_audio_frame_received();
                    if pcm.len() as u64 >= max_bytes {
                        continue;
                    }
                    match decoder.decode(&packet) {
                        Ok(bytes) => {
                            pcm.extend_from_slice(&bytes);
                            consecutive_fails = 0;
                        }
                        Err(e) => {
                            consecutive_fails += 1;
                            self.metrics.increment(names::OPUS_DECODE_ERRORS);
                            tracing::debug!(error = %e, "opus decode failed");
                            if consecutive_fails > DECODE_FAIL_WARN && !warned {
                                warned = true;
                                tracing::warn!(
                                    consecutive_fails,
                                    "persistent opus decode failures"
                                );
                            }
                            if consecutive_fails > DECODE_FAIL_RESET {
                                tracing::warn!(
                                    consecutive_fails,
                                    "destroying receive stream after decode failures"
                                );
                                receiver.destroy();
                                break;
                            }
                        }
                    }
                }
                ReceiverEvent::End => break,
                ReceiverEvent::Error(e) => {
                    tracing::warn!(error = %e, "receive stream error");
                    break;
                }
            }
        }

        handles.capturing.store(false, Ordering::SeqCst);
        handles.heartbeat.set_user_speaking(false);

        if pcm.is_empty() {
            tracing::debug!("capture ended with no decoded audio");
            return;
        }

        let utterance = Utterance {
            id: self.next_utt_id(),
            pcm,
            arrived_at: Instant::now(),
        };
        handles.pipeline.enqueue(utterance);
    }

    fn next_utt_id(&self) -> String {
        format_utt_id(self.utt_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Entry point of the reconnect state machine; deduplicates
    /// concurrent disconnect signals
    async fn handle_disconnect(self: &Arc<Self>) {
        if self.tearing_down.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self.reconnect().await;
        self.reconnecting.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            tracing::error!(error = %e, "reconnect exhausted, ending session");
            self.teardown("reconnect exhausted").await;
        }
    }

    /// Exponential backoff: sleep, then wait for Signalling and Ready.
    /// Every attempt counts once.
    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        let Some(handles) = self.session_handles().await else {
            return Ok(());
        };

        replace_capture_token(&handles);
        handles.capturing.store(false, Ordering::SeqCst);

        let resilience = &self.config.resilience;
        for attempt in 1..=resilience.max_reconnect_attempts {
            self.metrics.increment(names::RECONNECT_COUNT);
            let delay = resilience
                .reconnect_backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1))
                .min(resilience.reconnect_backoff_max_ms);
            tracing::info!(attempt, delay_ms = delay, "reconnect attempt");
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if let Err(e) = wait_for_state(
                handles.connection.as_ref(),
                ConnectionState::Signalling,
                SIGNALLING_TIMEOUT,
            )
            .await
            {
                tracing::warn!(attempt, error = %e, "no signalling state");
                continue;
            }
            if let Err(e) =
                wait_for_state(handles.connection.as_ref(), ConnectionState::Ready, READY_TIMEOUT)
                    .await
            {
                tracing::warn!(attempt, error = %e, "connection not ready");
                continue;
            }

            // The platform adapter re-associates the player with the
            // transport on Ready; the pipeline keeps its handle
            tracing::info!(attempt, "reconnected, player resubscribed");
            self.start_capture_loop(handles);
            self.metrics.increment(names::RECONNECT_SUCCESS);
            return Ok(());
        }

        Err(Error::Voice(format!(
            "reconnect attempts exhausted after {}",
            resilience.max_reconnect_attempts
        )))
    }

    /// Stop everything and leave the channel. Safe to call when no
    /// session is active.
    pub async fn teardown(self: &Arc<Self>, reason: &str) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = {
            let mut inner = self.inner.lock().await;
            if let Some(timer) = inner.user_left_timer.take() {
                timer.abort();
            }
            inner.session.take()
        };

        if let Some(session) = session {
            session.handles.heartbeat.stop();
            session
                .handles
                .capture_token
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .cancel();
            session.handles.pipeline.interrupt().await;
            session.handles.connection.disconnect().await;
            tracing::info!(reason, "voice session ended");
            self.tearing_down.store(false, Ordering::SeqCst);
            // Aborted last: the disconnect watcher may be the task
            // running this very teardown
            session.metrics_task.abort();
            session.watcher_task.abort();
        } else {
            self.tearing_down.store(false, Ordering::SeqCst);
        }
    }

    /// Whether a session is currently active
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }
}

fn format_utt_id(n: u64) -> String {
    format!("utt-{n:03}")
}

/// Cancel the current capture loop and install a fresh token
fn replace_capture_token(handles: &SessionHandles) {
    let mut token = handles
        .capture_token
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    token.cancel();
    *token = CancellationToken::new();
}

const fn container_for(is_baked_ogg: bool) -> StreamContainer {
    if is_baked_ogg {
        StreamContainer::OggOpus
    } else {
        StreamContainer::Arbitrary
    }
}

/// Wait until the connection reports `target`, up to `timeout`
async fn wait_for_state(
    connection: &dyn VoiceConnection,
    target: ConnectionState,
    timeout: Duration,
) -> Result<()> {
    let mut states = connection.state_changes();

    let wait = async {
        loop {
            if *states.borrow_and_update() == target {
                return Ok(());
            }
            if states.changed().await.is_err() {
                return Err(Error::Voice("connection state stream closed".to_string()));
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::Voice(format!("timed out waiting for {target:?}")))?
}
