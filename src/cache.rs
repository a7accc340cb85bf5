//! Content-addressed TTS cache with a baked phrase store
//!
//! Synthesised audio is keyed by a short hash over the TTS configuration
//! and the text, bounded by a byte budget with LRU eviction. Greeting and
//! check-in phrases are additionally persisted to disk as OGG Opus so a
//! fresh process can speak without a single synthesis round-trip. The
//! on-disk store is keyed to the TTS configuration hash; a mismatch
//! discards it wholesale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, TtsConfig};
use crate::metrics::{names, Metrics};
use crate::tts::Synthesize;
use crate::Result;

/// Pre-warm synthesis concurrency
const PRE_WARM_WORKERS: usize = 5;

/// Phrase sets tracked by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhraseLabel {
    /// Played when a session starts
    Greetings,
    /// Played as silence prompts
    CheckIns,
}

impl PhraseLabel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Greetings => "greetings",
            Self::CheckIns => "check-ins",
        }
    }
}

/// Cache key over the TTS configuration and text: 12 hex chars of SHA-256
#[must_use]
pub fn cache_key(config: &TtsConfig, text: &str) -> String {
    let material = serde_json::json!({
        "provider": config.provider.as_str(),
        "model": config.model,
        "voice": config.voice,
        "instructions": config.instructions,
        "text": text,
    });
    short_hash(&material.to_string(), 12)
}

/// TTS configuration hash: 16 hex chars of SHA-256. Determines validity
/// of both the in-memory cache and the baked store.
#[must_use]
pub fn config_hash(config: &TtsConfig) -> String {
    let material = serde_json::json!({
        "provider": config.provider.as_str(),
        "model": config.model,
        "voice": config.voice,
        "instructions": config.instructions,
    });
    short_hash(&material.to_string(), 16)
}

fn short_hash(material: &str, len: usize) -> String {
    let digest = Sha256::digest(material.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(len);
    hash
}

/// On-disk manifest mapping baked filenames to their phrase text
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct BakedManifest {
    #[serde(rename = "configHash")]
    config_hash: String,
    entries: BTreeMap<String, String>,
}

struct CacheEntry {
    buffer: Vec<u8>,
    last_used_at: u64,
    size_bytes: u64,
    is_baked_ogg: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    config_hash: Option<String>,
    labels: HashMap<PhraseLabel, BTreeSet<String>>,
    last_returned: HashMap<PhraseLabel, String>,
    /// Logical clock for recency; strictly increasing so LRU order has
    /// no ties
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.labels.clear();
        self.last_returned.clear();
        self.total_bytes = 0;
    }

    /// Evict least-recently-used entries until the budget holds
    fn evict_to_budget(&mut self, max_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.total_bytes > max_bytes {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                self.total_bytes -= entry.size_bytes;
            }
            for keys in self.labels.values_mut() {
                keys.remove(&victim);
            }
            evicted += 1;
        }
        evicted
    }
}

/// LRU cache of synthesised audio buffers, shared per session
pub struct TtsCache {
    inner: Mutex<CacheInner>,
    metrics: std::sync::Arc<Metrics>,
}

impl TtsCache {
    #[must_use]
    pub fn new(metrics: std::sync::Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            metrics,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Look up a buffer, touching its recency. Counts a hit or a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        let now = inner.tick();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used_at = now;
                self.metrics.increment(names::TTS_CACHE_HITS);
                Some(entry.buffer.clone())
            }
            None => {
                self.metrics.increment(names::TTS_CACHE_MISSES);
                None
            }
        }
    }

    /// Insert a buffer, replacing any existing entry for the key and
    /// evicting least-recently-used entries past the byte budget
    pub fn set(&self, key: &str, buffer: Vec<u8>, max_size_mb: u64) {
        self.insert(key, buffer, false, max_size_mb);
    }

    fn insert(&self, key: &str, buffer: Vec<u8>, is_baked_ogg: bool, max_size_mb: u64) {
        let size_bytes = buffer.len() as u64;
        let mut inner = self.lock();
        let now = inner.tick();

        if let Some(old) = inner.entries.insert(
            key.to_string(),
            CacheEntry {
                buffer,
                last_used_at: now,
                size_bytes,
                is_baked_ogg,
            },
        ) {
            inner.total_bytes -= old.size_bytes;
        }
        inner.total_bytes += size_bytes;

        let evicted = inner.evict_to_budget(max_size_mb * 1_048_576);
        if evicted > 0 {
            tracing::debug!(evicted, key, "cache evicted entries to stay under budget");
        }

        #[allow(clippy::cast_possible_wrap)]
        self.metrics
            .set_gauge(names::CACHE_SIZE_BYTES, inner.total_bytes as i64);
    }

    /// Drop everything, including label sets and baked-key tracking
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.clear();
        self.metrics.set_gauge(names::CACHE_SIZE_BYTES, 0);
    }

    /// Associate a cached key with a phrase label
    pub fn register_phrase_key(&self, key: &str, label: PhraseLabel) {
        let mut inner = self.lock();
        inner.labels.entry(label).or_default().insert(key.to_string());
    }

    /// Uniform pick over the label's cached phrases, never repeating the
    /// previous pick when an alternative exists. Returns the buffer and
    /// whether it is baked OGG Opus. Counts as a hit.
    #[must_use]
    pub fn get_random_phrase(&self, label: PhraseLabel) -> Option<(Vec<u8>, bool)> {
        let mut inner = self.lock();

        let mut candidates: Vec<String> = inner
            .labels
            .get(&label)
            .map(|keys| {
                keys.iter()
                    .filter(|k| inner.entries.contains_key(*k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if candidates.len() > 1 {
            if let Some(last) = inner.last_returned.get(&label) {
                candidates.retain(|k| k != last);
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let pick = candidates
            .swap_remove(rand::thread_rng().gen_range(0..candidates.len()));
        inner.last_returned.insert(label, pick.clone());

        let now = inner.tick();
        let entry = inner.entries.get_mut(&pick)?;
        entry.last_used_at = now;
        self.metrics.increment(names::TTS_CACHE_HITS);
        Some((entry.buffer.clone(), entry.is_baked_ogg))
    }

    /// Current number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Sum of entry sizes in bytes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Configuration hash the cache currently holds entries for
    #[must_use]
    pub fn current_config_hash(&self) -> Option<String> {
        self.lock().config_hash.clone()
    }

    /// Ensure the label's phrases are cached, loading baked files where
    /// the manifest still matches and synthesising the rest with a small
    /// worker pool.
    ///
    /// A configuration hash change clears the cache and discards the
    /// whole baked directory first.
    ///
    /// # Errors
    ///
    /// Returns error only when the baked directory cannot be created;
    /// per-phrase failures are logged and skipped.
    pub async fn pre_warm(
        &self,
        phrases: &[String],
        label: PhraseLabel,
        tts: &dyn Synthesize,
        tts_config: &TtsConfig,
        cache_config: &CacheConfig,
    ) -> Result<()> {
        let new_hash = config_hash(tts_config);
        {
            let mut inner = self.lock();
            if inner.config_hash.as_deref() != Some(new_hash.as_str()) {
                if inner.config_hash.is_some() {
                    tracing::info!(config_hash = %new_hash, "TTS configuration changed, clearing cache");
                }
                inner.clear();
                inner.config_hash = Some(new_hash.clone());
                self.metrics.set_gauge(names::CACHE_SIZE_BYTES, 0);
            }
        }

        let dir = &cache_config.baked_phrases_dir;
        tokio::fs::create_dir_all(dir).await?;

        let mut manifest = match load_manifest(dir).await {
            Some(m) if m.config_hash == new_hash => m,
            other => {
                if other.is_some() {
                    tracing::info!("baked store config hash mismatch, discarding baked files");
                }
                discard_baked_dir(dir).await;
                BakedManifest {
                    config_hash: new_hash.clone(),
                    entries: BTreeMap::new(),
                }
            }
        };

        let mut pending: Vec<(String, String, String)> = Vec::new();
        for phrase in phrases {
            let key = cache_key(tts_config, phrase);
            let filename = format!("{}-{}.ogg", label.as_str(), key);

            let claimed = manifest.entries.get(&filename).is_some_and(|p| p == phrase);
            if claimed {
                match tokio::fs::read(dir.join(&filename)).await {
                    Ok(bytes) => {
                        self.insert(&key, bytes, true, cache_config.max_size_mb);
                        self.register_phrase_key(&key, label);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file = %filename,
                            error = %e,
                            "baked phrase unreadable, re-synthesising"
                        );
                    }
                }
            }
            pending.push((phrase.clone(), key, filename));
        }

        if !pending.is_empty() {
            tracing::info!(
                label = label.as_str(),
                count = pending.len(),
                "synthesising baked phrases"
            );

            let next = AtomicUsize::new(0);
            let written: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

            let workers = (0..PRE_WARM_WORKERS).map(|_| async {
                loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some((phrase, key, filename)) = pending.get(i) else {
                        break;
                    };

                    match tts.synthesize_baked(phrase).await {
                        Ok(bytes) => {
                            match tokio::fs::write(dir.join(filename), &bytes).await {
                                Ok(()) => {
                                    written
                                        .lock()
                                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                                        .push((filename.clone(), phrase.clone()));
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        file = %filename,
                                        error = %e,
                                        "baked phrase write failed, keeping in memory only"
                                    );
                                }
                            }
                            self.insert(key, bytes, true, cache_config.max_size_mb);
                            self.register_phrase_key(key, label);
                        }
                        Err(e) => {
                            tracing::warn!(phrase = %phrase, error = %e, "phrase synthesis failed");
                        }
                    }
                }
            });
            futures::future::join_all(workers).await;

            let written = written
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            manifest.entries.extend(written);
        }

        match serde_json::to_vec_pretty(&manifest) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(dir.join("manifest.json"), json).await {
                    tracing::warn!(error = %e, "baked manifest write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "baked manifest serialization failed"),
        }

        Ok(())
    }
}

async fn load_manifest(dir: &Path) -> Option<BakedManifest> {
    let bytes = tokio::fs::read(dir.join("manifest.json")).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(error = %e, "baked manifest unparseable, rebuilding store");
            None
        }
    }
}

/// Remove every file in the baked directory
async fn discard_baked_dir(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!(file = %entry.path().display(), error = %e, "baked file removal failed");
            }
        }
    }
}
