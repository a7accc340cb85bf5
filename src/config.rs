//! Configuration for the voice bridge
//!
//! Loaded once at startup from a TOML file plus `VOXBRIDGE_*` environment
//! overrides for secrets, then frozen for the lifetime of the process.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Voice bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Platform user ID of the person the bridge converses with
    pub target_user_id: String,

    /// Voice channel the bridge joins
    pub target_channel_id: String,

    /// Guild/server the channel belongs to
    pub guild_id: String,

    /// Join automatically when the target user enters the channel
    #[serde(default = "default_true")]
    pub auto_join: bool,

    /// Chat gateway connection
    pub gateway: GatewayConfig,

    /// Speech-to-text provider
    #[serde(default)]
    pub stt: SttConfig,

    /// Text-to-speech provider
    #[serde(default)]
    pub tts: TtsConfig,

    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadConfig,

    /// Reconnect and idle-disconnect behaviour
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Liveness heartbeat tuning
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// TTS cache and baked phrase store
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics logging and health probe
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Chat gateway connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL of the chat-completion gateway
    pub url: String,

    /// Bearer token (`VOXBRIDGE_GATEWAY_TOKEN` overrides)
    #[serde(default)]
    pub token: String,

    /// Session key header value
    #[serde(default = "default_session_key")]
    pub session_key: String,

    /// Agent ID header value
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Chat model identifier
    #[serde(default = "default_chat_model")]
    pub model: String,
}

/// Speech-to-text provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SttConfig {
    /// Transcription endpoint base URL
    #[serde(default = "default_openai_base")]
    pub base_url: String,

    /// API key (`VOXBRIDGE_STT_API_KEY` overrides)
    #[serde(default)]
    pub api_key: String,

    /// Transcription model
    #[serde(default = "default_stt_model")]
    pub model: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base(),
            api_key: String::new(),
            model: default_stt_model(),
        }
    }
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// OpenAI speech endpoint
    OpenAi,
    /// ElevenLabs speech endpoint
    ElevenLabs,
}

impl TtsProvider {
    /// Stable identifier used in cache keys
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::ElevenLabs => "elevenlabs",
        }
    }
}

/// Text-to-speech provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtsConfig {
    /// Synthesis endpoint base URL
    #[serde(default = "default_openai_base")]
    pub base_url: String,

    /// API key (`VOXBRIDGE_TTS_API_KEY` overrides)
    #[serde(default)]
    pub api_key: String,

    /// Provider backend
    #[serde(default = "default_tts_provider")]
    pub provider: TtsProvider,

    /// Synthesis model
    #[serde(default = "default_tts_model")]
    pub model: String,

    /// Voice identifier
    #[serde(default = "default_tts_voice")]
    pub voice: String,

    /// Optional style instructions passed to the provider
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base(),
            api_key: String::new(),
            provider: default_tts_provider(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            instructions: None,
        }
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VadConfig {
    /// Silence window that ends an utterance
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,

    /// Utterances shorter than this are dropped before STT
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Hard cap on a single utterance
    #[serde(default = "default_max_utterance_sec")]
    pub max_utterance_sec: u64,

    /// Filter out filler-word utterances ("um", "uh", ...)
    #[serde(default = "default_true")]
    pub noise_filter_enabled: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_utterance_sec: default_max_utterance_sec(),
            noise_filter_enabled: true,
        }
    }
}

/// Reconnect and idle-disconnect behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Reconnect attempts before giving up the session
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay, doubled each attempt
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Reconnect delay cap
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,

    /// Minutes of mutual silence before the bridge disconnects
    #[serde(default = "default_idle_disconnect_min")]
    pub idle_disconnect_min: u64,

    /// Seconds before the idle disconnect to announce it
    #[serde(default = "default_grace_announce_sec")]
    pub grace_announce_sec: u64,

    /// Seconds to linger after the target user leaves the channel
    #[serde(default = "default_user_left_grace_sec")]
    pub user_left_grace_sec: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
            idle_disconnect_min: default_idle_disconnect_min(),
            grace_announce_sec: default_grace_announce_sec(),
            user_left_grace_sec: default_user_left_grace_sec(),
        }
    }
}

/// How proactively the bridge speaks up during silence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiative {
    /// Never prompt on silence
    Passive,
    /// Prompt after the configured threshold
    Normal,
    /// Prompt after 30 seconds
    Active,
}

/// Liveness heartbeat tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Tick interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    /// User silence threshold before a check-in prompt (normal initiative)
    #[serde(default = "default_silence_prompt_sec")]
    pub silence_prompt_sec: u64,

    /// Seconds without a bot reply after user speech before stall recovery
    #[serde(default = "default_bot_stall_threshold_sec")]
    pub bot_stall_threshold_sec: u64,

    /// Silence-prompt aggression
    #[serde(default = "default_initiative")]
    pub initiative: Initiative,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            silence_prompt_sec: default_silence_prompt_sec(),
            bot_stall_threshold_sec: default_bot_stall_threshold_sec(),
            initiative: Initiative::Normal,
        }
    }
}

/// TTS cache and baked phrase store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache synthesised audio in memory
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// In-memory budget in mebibytes
    #[serde(default = "default_cache_max_size_mb")]
    pub max_size_mb: u64,

    /// Synthesise the baked phrase sets when a session starts
    #[serde(default = "default_true")]
    pub pre_warm_on_connect: bool,

    /// On-disk store for baked OGG Opus phrases
    #[serde(default = "default_baked_phrases_dir")]
    pub baked_phrases_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: default_cache_max_size_mb(),
            pre_warm_on_connect: true,
            baked_phrases_dir: default_baked_phrases_dir(),
        }
    }
}

/// Metrics logging and health probe settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Seconds between metrics snapshots at INFO
    #[serde(default = "default_metrics_log_interval_sec")]
    pub metrics_log_interval_sec: u64,

    /// Port for the HTTP health probe; absent disables it
    #[serde(default)]
    pub health_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_log_interval_sec: default_metrics_log_interval_sec(),
            health_port: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or if required
    /// fields are missing after overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Pull secrets from the environment when present
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("VOXBRIDGE_GATEWAY_TOKEN") {
            self.gateway.token = token;
        }
        if let Ok(key) = std::env::var("VOXBRIDGE_STT_API_KEY") {
            self.stt.api_key = key;
        }
        if let Ok(key) = std::env::var("VOXBRIDGE_TTS_API_KEY") {
            self.tts.api_key = key;
        }
    }

    /// Check required fields before any connection is opened
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.target_user_id.is_empty() {
            return Err(Error::Config("target_user_id is required".to_string()));
        }
        if self.target_channel_id.is_empty() {
            return Err(Error::Config("target_channel_id is required".to_string()));
        }
        if self.guild_id.is_empty() {
            return Err(Error::Config("guild_id is required".to_string()));
        }
        if self.gateway.url.is_empty() {
            return Err(Error::Config("gateway.url is required".to_string()));
        }
        if self.gateway.token.is_empty() {
            return Err(Error::Config(
                "gateway.token is required (or set VOXBRIDGE_GATEWAY_TOKEN)".to_string(),
            ));
        }
        if self.vad.max_utterance_sec == 0 {
            return Err(Error::Config("vad.max_utterance_sec must be > 0".to_string()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(Error::Config("heartbeat.interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

fn default_session_key() -> String {
    "voice:default".to_string()
}

fn default_agent_id() -> String {
    "voice".to_string()
}

fn default_chat_model() -> String {
    "openclaw".to_string()
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

const fn default_tts_provider() -> TtsProvider {
    TtsProvider::OpenAi
}

fn default_tts_model() -> String {
    "gpt-4o-mini-tts".to_string()
}

fn default_tts_voice() -> String {
    "nova".to_string()
}

const fn default_silence_threshold_ms() -> u64 {
    500
}

const fn default_min_speech_ms() -> u64 {
    200
}

const fn default_max_utterance_sec() -> u64 {
    120
}

const fn default_max_reconnect_attempts() -> u32 {
    5
}

const fn default_reconnect_backoff_ms() -> u64 {
    1000
}

const fn default_reconnect_backoff_max_ms() -> u64 {
    30_000
}

const fn default_idle_disconnect_min() -> u64 {
    10
}

const fn default_grace_announce_sec() -> u64 {
    30
}

const fn default_user_left_grace_sec() -> u64 {
    60
}

const fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

const fn default_silence_prompt_sec() -> u64 {
    60
}

const fn default_bot_stall_threshold_sec() -> u64 {
    45
}

const fn default_initiative() -> Initiative {
    Initiative::Normal
}

const fn default_cache_max_size_mb() -> u64 {
    50
}

fn default_baked_phrases_dir() -> PathBuf {
    PathBuf::from("baked-phrases")
}

const fn default_metrics_log_interval_sec() -> u64 {
    60
}
