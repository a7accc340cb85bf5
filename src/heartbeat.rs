//! Voice session heartbeat
//!
//! A per-session ticker that watches speech timestamps and frame arrivals
//! and fires liveness callbacks: silence prompts, bot-stall recovery,
//! audio desync resubscription, and the two-stage idle disconnect.
//! Callbacks are plain function values captured at construction; the
//! heartbeat holds no reference back into the orchestrator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{HeartbeatConfig, Initiative, ResilienceConfig};
use crate::metrics::{names, Metrics};

/// Silence-prompt threshold under active initiative
const ACTIVE_PROMPT_THRESHOLD: Duration = Duration::from_secs(30);

/// No frames for this long while a speaking event is active means the
/// receive stream desynced
const DESYNC_WINDOW: Duration = Duration::from_secs(5);

/// Async callback invoked from the tick task
pub type LivenessCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers for each liveness condition
#[derive(Clone)]
pub struct HeartbeatCallbacks {
    /// User has been silent past the threshold and the bot spoke last
    pub on_silence_prompt: LivenessCallback,
    /// User spoke last and the bot never replied
    pub on_bot_stall: LivenessCallback,
    /// Speaking event active but no frames arriving; fires every tick
    /// while the condition holds
    pub on_audio_desync: LivenessCallback,
    /// Idle disconnect is imminent
    pub on_grace_announce: LivenessCallback,
    /// Idle deadline passed; the session should end
    pub on_idle_timeout: LivenessCallback,
}

/// Liveness conditions, in per-tick evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LivenessEvent {
    SilencePrompt,
    BotStall,
    AudioDesync,
    GraceAnnounce,
    IdleTimeout,
}

/// Firing guards, readable for inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardFlags {
    pub silence_prompt_fired: bool,
    pub bot_stall_fired: bool,
    pub grace_announced: bool,
    pub idle_timeout_fired: bool,
}

struct HeartbeatState {
    last_user_speech: Instant,
    last_bot_speech: Instant,
    last_frame_received: Instant,
    session_start: Instant,
    user_speaking: bool,
    guards: GuardFlags,
}

impl HeartbeatState {
    fn new(now: Instant) -> Self {
        Self {
            last_user_speech: now,
            last_bot_speech: now,
            last_frame_received: now,
            session_start: now,
            user_speaking: false,
            guards: GuardFlags::default(),
        }
    }
}

/// Evaluate every liveness rule for one tick, mutating guards
fn evaluate(
    state: &mut HeartbeatState,
    heartbeat: &HeartbeatConfig,
    resilience: &ResilienceConfig,
    now: Instant,
) -> Vec<LivenessEvent> {
    let mut events = Vec::new();

    // 1. Silence prompt
    let prompt_threshold = match heartbeat.initiative {
        Initiative::Passive => None,
        Initiative::Active => Some(ACTIVE_PROMPT_THRESHOLD),
        Initiative::Normal => Some(Duration::from_secs(heartbeat.silence_prompt_sec)),
    };
    if let Some(threshold) = prompt_threshold {
        if now.duration_since(state.last_user_speech) > threshold
            && state.last_bot_speech > state.last_user_speech
            && !state.guards.silence_prompt_fired
        {
            state.guards.silence_prompt_fired = true;
            events.push(LivenessEvent::SilencePrompt);
        }
    }

    // 2. Bot stall
    if state.last_user_speech > state.last_bot_speech
        && now.duration_since(state.last_bot_speech)
            > Duration::from_secs(heartbeat.bot_stall_threshold_sec)
        && !state.guards.bot_stall_fired
    {
        state.guards.bot_stall_fired = true;
        events.push(LivenessEvent::BotStall);
    }

    // 3. Audio desync: no guard, repeats while the condition holds
    if state.user_speaking && now.duration_since(state.last_frame_received) > DESYNC_WINDOW {
        events.push(LivenessEvent::AudioDesync);
    }

    // 4. Two-stage idle timeout
    let idle_since = now
        .duration_since(state.last_user_speech)
        .min(now.duration_since(state.last_bot_speech));
    let idle = Duration::from_secs(resilience.idle_disconnect_min * 60);
    let grace = Duration::from_secs(resilience.grace_announce_sec);
    let grace_threshold = idle.saturating_sub(grace);

    if idle_since > grace_threshold && !state.guards.grace_announced {
        state.guards.grace_announced = true;
        events.push(LivenessEvent::GraceAnnounce);
    }
    if idle_since > idle && state.guards.grace_announced && !state.guards.idle_timeout_fired {
        state.guards.idle_timeout_fired = true;
        events.push(LivenessEvent::IdleTimeout);
    }

    events
}

/// Per-session liveness ticker
pub struct VoiceHeartbeat {
    state: Mutex<HeartbeatState>,
    cancel: CancellationToken,
}

impl VoiceHeartbeat {
    /// Create the heartbeat and spawn its tick task
    #[must_use]
    pub fn start(
        heartbeat_config: HeartbeatConfig,
        resilience_config: ResilienceConfig,
        metrics: Arc<Metrics>,
        callbacks: HeartbeatCallbacks,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            state: Mutex::new(HeartbeatState::new(Instant::now())),
            cancel: CancellationToken::new(),
        });

        let ticker = Arc::clone(&this);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(heartbeat_config.interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    () = ticker.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = Instant::now();
                let events = {
                    let mut state = ticker.lock();
                    #[allow(clippy::cast_possible_wrap)]
                    metrics.set_gauge(
                        names::SESSION_DURATION_SEC,
                        now.duration_since(state.session_start).as_secs() as i64,
                    );
                    evaluate(&mut state, &heartbeat_config, &resilience_config, now)
                };

                for event in events {
                    match event {
                        LivenessEvent::SilencePrompt => {
                            tracing::info!("silence prompt threshold reached");
                            metrics.increment(names::SILENCE_PROMPTS);
                            (callbacks.on_silence_prompt)().await;
                        }
                        LivenessEvent::BotStall => {
                            tracing::warn!("bot stall detected");
                            metrics.increment(names::STALLS_DETECTED);
                            (callbacks.on_bot_stall)().await;
                        }
                        LivenessEvent::AudioDesync => {
                            tracing::warn!("audio desync: speaking but no frames");
                            (callbacks.on_audio_desync)().await;
                        }
                        LivenessEvent::GraceAnnounce => {
                            tracing::info!("idle grace period reached");
                            (callbacks.on_grace_announce)().await;
                        }
                        LivenessEvent::IdleTimeout => {
                            tracing::info!("idle timeout reached, stopping heartbeat");
                            metrics.increment(names::IDLE_DISCONNECTS);
                            (callbacks.on_idle_timeout)().await;
                            ticker.cancel.cancel();
                        }
                    }
                }

                if ticker.cancel.is_cancelled() {
                    break;
                }
            }
        });

        this
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeartbeatState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The user spoke: timestamp and clear every firing guard
    pub fn report_user_speech(&self) {
        let mut state = self.lock();
        state.last_user_speech = Instant::now();
        state.guards = GuardFlags::default();
    }

    /// The bot spoke: timestamp and clear only the stall guard
    pub fn report_bot_speech(&self) {
        let mut state = self.lock();
        state.last_bot_speech = Instant::now();
        state.guards.bot_stall_fired = false;
    }

    /// An Opus frame arrived on the receive stream
    pub fn report_audio_frame_received(&self) {
        self.lock().last_frame_received = Instant::now();
    }

    /// Track whether a speaking event is currently active
    pub fn set_user_speaking(&self, speaking: bool) {
        self.lock().user_speaking = speaking;
    }

    /// Current guard flags
    #[must_use]
    pub fn guards(&self) -> GuardFlags {
        self.lock().guards
    }

    /// Stop the tick task
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the tick task has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (HeartbeatConfig, ResilienceConfig) {
        (HeartbeatConfig::default(), ResilienceConfig::default())
    }

    fn state_at(now: Instant) -> HeartbeatState {
        HeartbeatState::new(now)
    }

    #[tokio::test(start_paused = true)]
    async fn silence_prompt_fires_once_when_bot_spoke_last() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        // Bot replied after the user's last speech
        state.last_bot_speech = start + Duration::from_secs(5);

        let now = start + Duration::from_secs(70);
        let events = evaluate(&mut state, &hb, &res, now);
        assert!(events.contains(&LivenessEvent::SilencePrompt));

        // Guard holds on the next tick
        let events = evaluate(&mut state, &hb, &res, now + Duration::from_secs(15));
        assert!(!events.contains(&LivenessEvent::SilencePrompt));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_prompt_respects_initiative() {
        let (mut hb, res) = configs();
        let start = Instant::now();

        hb.initiative = Initiative::Passive;
        let mut state = state_at(start);
        state.last_bot_speech = start + Duration::from_secs(1);
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(600));
        assert!(!events.contains(&LivenessEvent::SilencePrompt));

        hb.initiative = Initiative::Active;
        let mut state = state_at(start);
        state.last_bot_speech = start + Duration::from_secs(1);
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(35));
        assert!(events.contains(&LivenessEvent::SilencePrompt));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_prompt_waits_for_bot_reply() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        // User spoke last: a prompt now would talk over a pending reply
        state.last_user_speech = start + Duration::from_secs(5);
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(120));
        assert!(!events.contains(&LivenessEvent::SilencePrompt));
    }

    #[tokio::test(start_paused = true)]
    async fn bot_stall_fires_when_user_spoke_last() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        state.last_user_speech = start + Duration::from_secs(10);
        let now = start + Duration::from_secs(60);
        let events = evaluate(&mut state, &hb, &res, now);
        assert!(events.contains(&LivenessEvent::BotStall));
        assert!(state.guards.bot_stall_fired);

        let events = evaluate(&mut state, &hb, &res, now + Duration::from_secs(15));
        assert!(!events.contains(&LivenessEvent::BotStall));
    }

    #[tokio::test(start_paused = true)]
    async fn desync_repeats_every_tick() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        state.user_speaking = true;
        let now = start + Duration::from_secs(10);
        assert!(evaluate(&mut state, &hb, &res, now).contains(&LivenessEvent::AudioDesync));
        assert!(evaluate(&mut state, &hb, &res, now + Duration::from_secs(15))
            .contains(&LivenessEvent::AudioDesync));
    }

    #[tokio::test(start_paused = true)]
    async fn desync_needs_active_speaking() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        state.user_speaking = false;
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(10));
        assert!(!events.contains(&LivenessEvent::AudioDesync));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_announces_grace_then_times_out() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        // 10 min idle, 30 s grace: announce after 9:30
        let at_grace = start + Duration::from_secs(9 * 60 + 31);
        let events = evaluate(&mut state, &hb, &res, at_grace);
        assert_eq!(events, vec![LivenessEvent::GraceAnnounce]);

        // Not yet past the full deadline
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(9 * 60 + 45));
        assert!(events.is_empty());

        let at_timeout = start + Duration::from_secs(10 * 60 + 1);
        let events = evaluate(&mut state, &hb, &res, at_timeout);
        assert_eq!(events, vec![LivenessEvent::IdleTimeout]);

        // Both guards hold afterwards
        let events = evaluate(&mut state, &hb, &res, at_timeout + Duration::from_secs(60));
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recent_bot_speech_defers_idle() {
        let (hb, res) = configs();
        let start = Instant::now();
        let mut state = state_at(start);

        // Idle is measured from the most recent of the two speakers
        state.last_bot_speech = start + Duration::from_secs(9 * 60);
        let events = evaluate(&mut state, &hb, &res, start + Duration::from_secs(9 * 60 + 40));
        assert!(!events.contains(&LivenessEvent::GraceAnnounce));
        assert!(!events.contains(&LivenessEvent::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reset_rules() {
        let (hb, res) = configs();
        let metrics = Arc::new(Metrics::new());
        let noop: LivenessCallback = Arc::new(|| Box::pin(async {}));
        let heartbeat = VoiceHeartbeat::start(
            hb,
            res,
            metrics,
            HeartbeatCallbacks {
                on_silence_prompt: Arc::clone(&noop),
                on_bot_stall: Arc::clone(&noop),
                on_audio_desync: Arc::clone(&noop),
                on_grace_announce: Arc::clone(&noop),
                on_idle_timeout: noop,
            },
        );

        {
            let mut state = heartbeat.lock();
            state.guards = GuardFlags {
                silence_prompt_fired: true,
                bot_stall_fired: true,
                grace_announced: true,
                idle_timeout_fired: true,
            };
        }

        heartbeat.report_bot_speech();
        let guards = heartbeat.guards();
        assert!(!guards.bot_stall_fired);
        assert!(guards.silence_prompt_fired);
        assert!(guards.grace_announced);
        assert!(guards.idle_timeout_fired);

        heartbeat.report_user_speech();
        assert_eq!(heartbeat.guards(), GuardFlags::default());

        heartbeat.stop();
    }
}
