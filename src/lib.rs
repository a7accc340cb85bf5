//! Vox Bridge - voice-conversation bridge for OpenClaw agents
//!
//! Connects a target user in a group voice channel to a conversational
//! agent served over an HTTP chat-completion gateway:
//! - Captures and transcribes the user's speech
//! - Streams the agent's reply sentence by sentence
//! - Synthesises each sentence and plays it back in order
//! - Keeps the conversation alive (silence prompts, stall recovery,
//!   reconnection, idle disconnect)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │              Voice Platform (adapter)                  │
//! │  presence │ speaking events │ Opus packets │ player   │
//! └──────────────────────┬────────────────────────────────┘
//!                        │
//! ┌──────────────────────▼────────────────────────────────┐
//! │               Session Orchestrator                     │
//! │  capture loop │ reconnect │ heartbeat │ pre-warm      │
//! └──────────────────────┬────────────────────────────────┘
//!                        │
//! ┌──────────────────────▼────────────────────────────────┐
//! │                 Audio Pipeline                         │
//! │   STT  →  chat stream  →  TTS cache  →  playback      │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod pipeline;
pub mod platform;
pub mod session;
pub mod stt;
pub mod tts;

pub use cache::{cache_key, config_hash, PhraseLabel, TtsCache};
pub use chat::{clean_for_tts, ChatClient, SentenceSplitter, StreamChat};
pub use config::{Config, Initiative, TtsProvider};
pub use error::{Error, Result};
pub use heartbeat::{GuardFlags, HeartbeatCallbacks, VoiceHeartbeat};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{AudioPipeline, Utterance};
pub use platform::{
    AudioChunk, AudioReceiver, ConnectionState, OpusDecoder, Player, PresenceChange,
    ReceiverEvent, StreamContainer, VoiceConnection, VoicePlatform,
};
pub use session::SessionOrchestrator;
pub use stt::{SttClient, Transcribe};
pub use tts::{Synthesize, TtsClient};
