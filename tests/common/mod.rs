//! Shared test doubles: an in-process voice platform and provider stubs
//!
//! No audio hardware and no network. The mock player records every chunk
//! it is handed; the mock connection lets tests drive state transitions,
//! speaking events and Opus packets by hand.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use vox_bridge::chat::{SentenceHandler, StreamChat};
use vox_bridge::config::{CacheConfig, Config, TtsConfig};
use vox_bridge::pipeline::AudioPipeline;
use vox_bridge::platform::{
    AudioChunk, AudioReceiver, ConnectionState, Player, PresenceChange, ReceiverEvent,
    VoiceConnection, VoicePlatform,
};
use vox_bridge::stt::Transcribe;
use vox_bridge::tts::Synthesize;
use vox_bridge::{clean_for_tts, Error, Metrics, Result, SentenceSplitter, TtsCache};

/// Player that records chunks; `auto_idle` completes each one instantly
pub struct MockPlayer {
    auto_idle: bool,
    played: Mutex<Vec<AudioChunk>>,
    idle_senders: Mutex<Vec<mpsc::UnboundedSender<()>>>,
    pub stop_count: AtomicUsize,
}

impl MockPlayer {
    pub fn new(auto_idle: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_idle,
            played: Mutex::new(Vec::new()),
            idle_senders: Mutex::new(Vec::new()),
            stop_count: AtomicUsize::new(0),
        })
    }

    pub fn played(&self) -> Vec<AudioChunk> {
        self.played.lock().unwrap().clone()
    }

    pub fn played_sizes(&self) -> Vec<usize> {
        self.played.lock().unwrap().iter().map(|c| c.bytes.len()).collect()
    }

    /// Signal that the current resource finished
    pub fn send_idle(&self) {
        self.idle_senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(()).is_ok());
    }
}

#[async_trait]
impl Player for MockPlayer {
    async fn play(&self, chunk: AudioChunk) -> Result<()> {
        self.played.lock().unwrap().push(chunk);
        if self.auto_idle {
            self.send_idle();
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
    }

    fn idle_events(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.idle_senders.lock().unwrap().push(tx);
        rx
    }
}

/// Handle for driving one subscribed receive stream from a test
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub tx: mpsc::UnboundedSender<ReceiverEvent>,
    pub destroy: CancellationToken,
}

/// Scriptable voice connection
pub struct MockConnection {
    state_tx: watch::Sender<ConnectionState>,
    speaking_senders: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    pub player: Arc<MockPlayer>,
    pub subscribe_count: AtomicUsize,
    pub disconnect_count: AtomicUsize,
}

impl MockConnection {
    pub fn new(auto_idle_player: bool) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            state_tx,
            speaking_senders: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            player: MockPlayer::new(auto_idle_player),
            subscribe_count: AtomicUsize::new(0),
            disconnect_count: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Emit a speaking-start event for `user_id`
    pub fn speak(&self, user_id: &str) {
        self.speaking_senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(user_id.to_string()).is_ok());
    }

    /// Push one Opus packet into the most recent subscription
    pub fn send_packet(&self, bytes: Vec<u8>) {
        if let Some(sub) = self.subscriptions.lock().unwrap().last() {
            let _ = sub.tx.send(ReceiverEvent::Packet(bytes));
        }
    }

    /// Close the most recent subscription (silence window elapsed)
    pub fn end_stream(&self) {
        if let Some(sub) = self.subscriptions.lock().unwrap().last() {
            let _ = sub.tx.send(ReceiverEvent::End);
        }
    }

    pub fn last_subscription(&self) -> Option<SubscriptionHandle> {
        self.subscriptions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl VoiceConnection for MockConnection {
    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn speaking_events(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.speaking_senders.lock().unwrap().push(tx);
        rx
    }

    fn subscribe_audio(&self, _user_id: &str, _silence_ms: u64) -> Result<AudioReceiver> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let destroy = CancellationToken::new();
        self.subscriptions.lock().unwrap().push(SubscriptionHandle {
            tx,
            destroy: destroy.clone(),
        });
        Ok(AudioReceiver::new(rx, destroy))
    }

    fn player(&self) -> Arc<dyn Player> {
        Arc::clone(&self.player) as Arc<dyn Player>
    }

    async fn disconnect(&self) {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Platform that hands out one scripted connection
pub struct MockPlatform {
    pub connection: Arc<MockConnection>,
    presence_senders: Mutex<Vec<mpsc::UnboundedSender<PresenceChange>>>,
    pub join_count: AtomicUsize,
    /// Report Ready as soon as the channel is joined
    pub auto_ready: bool,
}

impl MockPlatform {
    pub fn new(connection: Arc<MockConnection>, auto_ready: bool) -> Arc<Self> {
        Arc::new(Self {
            connection,
            presence_senders: Mutex::new(Vec::new()),
            join_count: AtomicUsize::new(0),
            auto_ready,
        })
    }

    pub fn send_presence(&self, user_id: &str, old: Option<&str>, new: Option<&str>) {
        let change = PresenceChange {
            user_id: user_id.to_string(),
            old_channel_id: old.map(String::from),
            new_channel_id: new.map(String::from),
        };
        self.presence_senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[async_trait]
impl VoicePlatform for MockPlatform {
    async fn join(&self, _channel_id: &str, _guild_id: &str) -> Result<Arc<dyn VoiceConnection>> {
        self.join_count.fetch_add(1, Ordering::SeqCst);
        if self.auto_ready {
            self.connection.set_state(ConnectionState::Ready);
        } else {
            self.connection.set_state(ConnectionState::Connecting);
        }
        Ok(Arc::clone(&self.connection) as Arc<dyn VoiceConnection>)
    }

    fn presence_events(&self) -> mpsc::UnboundedReceiver<PresenceChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.presence_senders.lock().unwrap().push(tx);
        rx
    }
}

/// STT stub returning a fixed transcript
pub struct StubStt {
    pub text: String,
    pub calls: AtomicUsize,
}

impl StubStt {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transcribe for StubStt {
    async fn transcribe(&self, _pcm: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

/// TTS stub echoing the input text bytes as the audio buffer, so chunk
/// sizes equal sentence lengths
pub struct StubTts {
    pub calls: AtomicUsize,
    pub baked_calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl StubTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            baked_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Synthesize for StubTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tts("stub failure".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }

    async fn synthesize_baked(&self, text: &str) -> Result<Vec<u8>> {
        self.baked_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tts("stub failure".to_string()));
        }
        Ok(format!("ogg:{text}").into_bytes())
    }
}

/// Chat stub that splits a scripted reply with the real segmentation and
/// cleaning, delivering sentences in order
pub struct ScriptedChat {
    pub reply: String,
    /// Deliver this many sentences, then block until cancelled
    pub hold_after: Option<usize>,
    /// Fail this many calls before succeeding
    pub fail_times: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            hold_after: None,
            fail_times: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn holding_after(reply: &str, delivered: usize) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            hold_after: Some(delivered),
            fail_times: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StreamChat for ScriptedChat {
    async fn stream_reply(
        &self,
        _transcript: &str,
        cancel: &CancellationToken,
        on_sentence: SentenceHandler<'_>,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Chat("stub gateway failure".to_string()));
        }

        if self.reply.trim().is_empty() {
            return Err(Error::Chat("Empty response".to_string()));
        }

        let mut splitter = SentenceSplitter::new();
        let mut sentences = splitter.push(&self.reply);
        if let Some(tail) = splitter.flush() {
            sentences.push(tail);
        }

        let mut delivered = 0usize;
        for sentence in sentences {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.hold_after == Some(delivered) {
                cancel.cancelled().await;
                return Err(Error::Cancelled);
            }
            let cleaned = clean_for_tts(&sentence);
            if !cleaned.is_empty() {
                on_sentence(cleaned).await;
                delivered += 1;
            }
        }

        Ok(self.reply.clone())
    }
}

/// A fully wired pipeline over the stubs
pub struct PipelineFixture {
    pub pipeline: Arc<AudioPipeline>,
    pub player: Arc<MockPlayer>,
    pub metrics: Arc<Metrics>,
    pub cache: Arc<TtsCache>,
    pub stt: Arc<StubStt>,
    pub chat: Arc<ScriptedChat>,
    pub tts: Arc<StubTts>,
    pub bot_speech_count: Arc<AtomicUsize>,
    pub tts_config: TtsConfig,
}

pub fn build_pipeline(
    stt: Arc<StubStt>,
    chat: Arc<ScriptedChat>,
    auto_idle: bool,
) -> PipelineFixture {
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(TtsCache::new(Arc::clone(&metrics)));
    let tts = StubTts::new();
    let player = MockPlayer::new(auto_idle);
    let tts_config = TtsConfig::default();
    let cache_config = CacheConfig::default();
    let bot_speech_count = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&bot_speech_count);
    let pipeline = Arc::new(AudioPipeline::new(
        Arc::clone(&stt) as Arc<dyn Transcribe>,
        Arc::clone(&chat) as Arc<dyn StreamChat>,
        Arc::clone(&tts) as Arc<dyn Synthesize>,
        Arc::clone(&player) as Arc<dyn Player>,
        Arc::clone(&cache),
        Arc::clone(&metrics),
        tts_config.clone(),
        cache_config,
        true,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    ));
    pipeline.attach_player_events();

    PipelineFixture {
        pipeline,
        player,
        metrics,
        cache,
        stt,
        chat,
        tts,
        bot_speech_count,
        tts_config,
    }
}

/// Minimal valid configuration pointed at a temp baked directory
pub fn test_config(baked_dir: &std::path::Path) -> Config {
    let toml = format!(
        r#"
            target_user_id = "42"
            target_channel_id = "voice-chan"
            guild_id = "guild-1"

            [gateway]
            url = "http://localhost:0"
            token = "test-token"

            [cache]
            baked_phrases_dir = "{}"
        "#,
        baked_dir.display()
    );
    toml::from_str(&toml).expect("test config parses")
}

/// One 20 ms Opus frame of stereo silence
pub fn opus_silence_packet() -> Vec<u8> {
    use audiopus::coder::Encoder;
    use audiopus::{Application, Channels, SampleRate};

    let mut encoder =
        Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip).unwrap();
    let pcm = vec![0i16; 960 * 2];
    let mut out = vec![0u8; 4000];
    let len = encoder.encode(&pcm, &mut out).unwrap();
    out.truncate(len);
    out
}

/// Poll `cond` until it holds, advancing paused time. The budget is
/// generous (several virtual minutes) because reconnect backoff and
/// state timeouts burn tens of seconds per attempt.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..3000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("condition not reached within the polling window");
}
