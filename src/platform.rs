//! Voice platform abstraction
//!
//! The bridge does not own the UDP voice transport. It consumes an
//! already-established session through these traits: presence events,
//! per-speaker Opus packet streams with after-silence end, an observable
//! connection state, and a player that accepts container-tagged audio.
//! A live adapter (e.g. a Discord gateway binding) implements them; the
//! integration tests provide in-process mocks.

use async_trait::async_trait;
use audiopus::coder::Decoder;
use audiopus::{Channels, SampleRate};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Capture/playback sample rate
pub const SAMPLE_RATE: u32 = 48_000;

/// Capture/playback channel count
pub const CHANNELS: u16 = 2;

/// Bytes per second of decoded PCM (48 kHz, stereo, 16-bit)
pub const PCM_BYTE_RATE: u64 = SAMPLE_RATE as u64 * CHANNELS as u64 * 2;

/// Container format of an audio buffer handed to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamContainer {
    /// Provider-default compressed audio (typically MP3); the player probes it
    Arbitrary,
    /// OGG Opus byte stream (baked phrases)
    OggOpus,
}

/// An audio buffer ready for playback, tagged with its container
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub container: StreamContainer,
}

/// Voice connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Signalling,
    Ready,
    Disconnected,
}

/// A user moved between voice channels
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub user_id: String,
    pub old_channel_id: Option<String>,
    pub new_channel_id: Option<String>,
}

/// Event on a per-speaker receive stream
#[derive(Debug)]
pub enum ReceiverEvent {
    /// One Opus frame
    Packet(Vec<u8>),
    /// The silence window elapsed; the utterance is over
    End,
    /// Transport error; the stream is dead
    Error(String),
}

/// Per-speaker Opus packet stream, ended after the configured silence window
pub struct AudioReceiver {
    /// Packet/end/error events in arrival order
    pub events: mpsc::UnboundedReceiver<ReceiverEvent>,
    destroy: CancellationToken,
}

impl AudioReceiver {
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<ReceiverEvent>, destroy: CancellationToken) -> Self {
        Self { events, destroy }
    }

    /// Tear down the underlying receive stream. A fresh stream is
    /// established on the next speaking start.
    pub fn destroy(&self) {
        self.destroy.cancel();
    }
}

/// Playback sink attached to a voice connection
#[async_trait]
pub trait Player: Send + Sync {
    /// Start playing a chunk. Returns once playback has been submitted;
    /// completion is signalled through [`Player::idle_events`].
    async fn play(&self, chunk: AudioChunk) -> Result<()>;

    /// Hard-stop whatever is playing
    async fn stop(&self);

    /// One `()` per finished resource. Call once and keep the receiver.
    fn idle_events(&self) -> mpsc::UnboundedReceiver<()>;
}

/// An established connection to a voice channel
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Observable state transitions (Signalling → Ready → Disconnected)
    fn state_changes(&self) -> watch::Receiver<ConnectionState>;

    /// Speaking-start events carrying the speaker's user ID
    fn speaking_events(&self) -> mpsc::UnboundedReceiver<String>;

    /// Subscribe to a speaker's Opus packets, ending the stream after
    /// `silence_ms` of silence
    ///
    /// # Errors
    ///
    /// Returns error if the user has no active receive stream.
    fn subscribe_audio(&self, user_id: &str, silence_ms: u64) -> Result<AudioReceiver>;

    /// The playback sink for this connection
    fn player(&self) -> std::sync::Arc<dyn Player>;

    /// Leave the channel
    async fn disconnect(&self);
}

/// Entry point the host platform provides
#[async_trait]
pub trait VoicePlatform: Send + Sync {
    /// Join a voice channel (self-deaf and self-mute off)
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot be joined.
    async fn join(
        &self,
        channel_id: &str,
        guild_id: &str,
    ) -> Result<std::sync::Arc<dyn VoiceConnection>>;

    /// Presence change events for join/leave detection. Call once.
    fn presence_events(&self) -> mpsc::UnboundedReceiver<PresenceChange>;
}

/// Stateful Opus decoder for one capture stream (48 kHz stereo)
pub struct OpusDecoder {
    inner: Decoder,
    /// Scratch buffer sized for the maximum 120 ms frame
    pcm: Vec<i16>,
}

impl OpusDecoder {
    /// # Errors
    ///
    /// Returns error if libopus rejects the configuration.
    pub fn new() -> Result<Self> {
        let inner = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| Error::Decode(format!("decoder init: {e}")))?;
        Ok(Self {
            inner,
            pcm: vec![0i16; 5760 * 2],
        })
    }

    /// Decode one Opus frame to interleaved 16-bit little-endian PCM bytes
    ///
    /// # Errors
    ///
    /// Returns error for undecodable packets; the decoder stays usable.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let samples_per_channel = self
            .inner
            .decode(Some(packet), &mut self.pcm, false)
            .map_err(|e| Error::Decode(format!("decode: {e}")))?;

        let sample_count = samples_per_channel * CHANNELS as usize;
        let mut bytes = Vec::with_capacity(sample_count * 2);
        for sample in &self.pcm[..sample_count] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(bytes)
    }
}
