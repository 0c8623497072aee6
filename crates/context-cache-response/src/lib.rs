#![forbid(unsafe_code)]

//! Similarity-gated, in-process reuse cache for generated answers.
//!
//! A prompt is only ever cached when [`PromptClassifier`] says its answer is
//! safe to reuse. Entries are keyed by the normalized prompt together with
//! the [`Fingerprint`] of the environment snapshot, and a stored answer is
//! served only while it is younger than the TTL and its fingerprint is
//! similar enough to the caller's.

use std::collections::HashMap;
use std::sync::Arc;

use context_cache_core::{
    canonical_json_string, fingerprint, hash_bytes, hours_between, now_utc, similarity,
    timestamp, CacheError, Fingerprint, ResponseCacheSettings,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{RegexSet, RegexSetBuilder};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

/// Questions whose answers depend on the caller's live state.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"what\s+data\s+do\s+i\s+have",
    r"what\s+is\s+wrong\s+with",
    r"error\s+",
    r"debug\s+",
    r"fix\s+",
    r"problem\s+with",
    r"issue\s+with",
    r"what\s+does\s+this\s+output\s+mean",
    r"why\s+is\s+this\s+happening",
    r"what\s+went\s+wrong",
    r"troubleshoot",
    r"diagnose",
];

/// General how-to and explanation questions.
pub const DEFAULT_ALLOW_PATTERNS: &[&str] = &[
    r"how\s+to\s+",
    r"what\s+is\s+",
    r"explain\s+",
    r"create\s+a\s+",
    r"make\s+a\s+",
    r"generate\s+a\s+",
    r"plot\s+",
    r"visualize\s+",
    r"show\s+me\s+how\s+to\s+",
    r"can\s+you\s+explain\s+",
    r"what\s+does\s+",
    r"define\s+",
    r"describe\s+",
];

static DEFAULT_CLASSIFIER: Lazy<Result<PromptClassifier, CacheError>> =
    Lazy::new(|| PromptClassifier::new(DEFAULT_DENY_PATTERNS, DEFAULT_ALLOW_PATTERNS));

/// Deny-then-allow pattern match. Deny wins; no match is not cacheable.
#[derive(Debug, Clone)]
pub struct PromptClassifier {
    deny: RegexSet,
    allow: RegexSet,
}

impl PromptClassifier {
    /// Compiles case-insensitive deny and allow pattern sets.
    ///
    /// # Errors
    /// Returns [`CacheError::Configuration`] when a pattern does not compile.
    pub fn new<S: AsRef<str>>(deny: &[S], allow: &[S]) -> Result<Self, CacheError> {
        Ok(Self {
            deny: compile_set("deny", deny)?,
            allow: compile_set("allow", allow)?,
        })
    }

    /// The built-in pattern lists.
    ///
    /// # Errors
    /// Returns [`CacheError::Configuration`] if the built-in patterns fail to
    /// compile.
    pub fn standard() -> Result<Self, CacheError> {
        DEFAULT_CLASSIFIER.clone()
    }

    #[must_use]
    pub fn is_cacheable(&self, prompt: &str) -> bool {
        if self.deny.is_match(prompt) {
            return false;
        }
        self.allow.is_match(prompt)
    }
}

fn compile_set<S: AsRef<str>>(label: &str, patterns: &[S]) -> Result<RegexSet, CacheError> {
    let patterns = patterns
        .iter()
        .map(AsRef::<str>::as_ref)
        .collect::<Vec<_>>();
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|err| CacheError::Configuration(format!("invalid {label} pattern: {err}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: String,
    #[serde(with = "timestamp")]
    pub written_at: OffsetDateTime,
    pub fingerprint: Fingerprint,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheHit {
    pub response: String,
    pub similarity: f64,
    pub age_hours: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
    pub approx_size_bytes: usize,
    pub approx_size_mb: f64,
    pub max_size: usize,
    pub ttl_hours: u32,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Shared handle to one cache. Clones see the same entries.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    state: Arc<Mutex<CacheState>>,
    classifier: Arc<PromptClassifier>,
    settings: ResponseCacheSettings,
}

impl ResponseCache {
    /// # Errors
    /// Returns [`CacheError::Configuration`] when `settings` are invalid.
    pub fn new(settings: ResponseCacheSettings) -> Result<Self, CacheError> {
        Self::with_classifier(settings, PromptClassifier::standard()?)
    }

    /// # Errors
    /// Returns [`CacheError::Configuration`] when `settings` are invalid.
    pub fn with_classifier(
        settings: ResponseCacheSettings,
        classifier: PromptClassifier,
    ) -> Result<Self, CacheError> {
        settings.validate()?;
        Ok(Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            classifier: Arc::new(classifier),
            settings,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &ResponseCacheSettings {
        &self.settings
    }

    #[must_use]
    pub fn is_cacheable(&self, prompt: &str) -> bool {
        self.classifier.is_cacheable(prompt)
    }

    #[must_use]
    pub fn get(&self, prompt: &str, snapshot: &Value) -> Option<CacheHit> {
        self.get_at(prompt, snapshot, now_utc())
    }

    #[must_use]
    pub fn get_at(&self, prompt: &str, snapshot: &Value, now: OffsetDateTime) -> Option<CacheHit> {
        if !self.is_cacheable(prompt) {
            return None;
        }

        let current = fingerprint(snapshot);
        let key = self.key_for(prompt, &current)?;

        let state = self.state.lock();
        let entry = state.entries.get(&key)?;
        if self.is_expired(entry, now) {
            return None;
        }

        let score = similarity(&entry.fingerprint, &current);
        if score < self.settings.similarity_threshold {
            return None;
        }

        Some(CacheHit {
            response: entry.response.clone(),
            similarity: score,
            age_hours: hours_between(entry.written_at, now),
        })
    }

    pub fn set(&self, prompt: &str, snapshot: &Value, response: &str) {
        self.set_at(prompt, snapshot, response, now_utc());
    }

    pub fn set_at(&self, prompt: &str, snapshot: &Value, response: &str, now: OffsetDateTime) {
        if !self.is_cacheable(prompt) {
            return;
        }

        let current = fingerprint(snapshot);
        let Some(key) = self.key_for(prompt, &current) else {
            return;
        };

        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                response: response.to_string(),
                written_at: now,
                fingerprint: current,
                seq,
            },
        );

        if state.entries.len() > self.settings.max_size {
            let expired = self.drop_expired(&mut state, now);
            let evicted = self.drop_oldest(&mut state);
            tracing::debug!(expired, evicted, "response cache over capacity");
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats_at(now_utc())
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats_at(&self, now: OffsetDateTime) -> CacheStats {
        let state = self.state.lock();
        let total_entries = state.entries.len();
        let expired_entries = state
            .entries
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .count();
        let approx_size_bytes = state
            .entries
            .values()
            .map(|entry| serde_json::to_string(entry).map_or(0, |raw| raw.len()))
            .sum::<usize>();

        CacheStats {
            total_entries,
            expired_entries,
            valid_entries: total_entries - expired_entries,
            approx_size_bytes,
            approx_size_mb: approx_size_bytes as f64 / (1024.0 * 1024.0),
            max_size: self.settings.max_size,
            ttl_hours: self.settings.ttl_hours,
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        tracing::debug!(dropped, "response cache cleared");
    }

    /// Drops expired entries and returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_utc())
    }

    pub fn sweep_expired_at(&self, now: OffsetDateTime) -> usize {
        let mut state = self.state.lock();
        let deleted = self.drop_expired(&mut state, now);
        if deleted > 0 {
            tracing::debug!(deleted, "response cache sweep");
        }
        deleted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_for(&self, prompt: &str, current: &Fingerprint) -> Option<String> {
        let payload = json!({
            "prompt": self.settings.normalization.apply(prompt),
            "context_fingerprint": current,
        });
        match canonical_json_string(&payload) {
            Ok(canonical) => Some(hash_bytes(canonical.as_bytes())),
            Err(err) => {
                tracing::warn!(error = %err, "failed to build response cache key");
                None
            }
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: OffsetDateTime) -> bool {
        now - entry.written_at >= self.settings.ttl()
    }

    fn drop_expired(&self, state: &mut CacheState, now: OffsetDateTime) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, entry| !self.is_expired(entry, now));
        before - state.entries.len()
    }

    fn drop_oldest(&self, state: &mut CacheState) -> usize {
        let excess = state.entries.len().saturating_sub(self.settings.max_size);
        if excess == 0 {
            return 0;
        }

        let mut order = state
            .entries
            .values()
            .map(|entry| (entry.written_at, entry.seq, entry.key.clone()))
            .collect::<Vec<_>>();
        order.sort();
        for (_, _, key) in order.into_iter().take(excess) {
            state.entries.remove(&key);
        }
        excess
    }
}
