//! Capacity, age and similarity bounds for the three stores.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::CacheError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextLimits {
    pub max_contexts_per_owner: usize,
    pub max_total_contexts: usize,
    pub max_context_age_days: u32,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_contexts_per_owner: 20,
            max_total_contexts: 200,
            max_context_age_days: 7,
        }
    }
}

impl ContextLimits {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_context_age_days))
    }

    /// # Errors
    /// Returns [`CacheError::Configuration`] when a cap or the age is zero.
    pub fn validate(&self) -> Result<(), CacheError> {
        for (name, value) in [
            ("max_contexts_per_owner", self.max_contexts_per_owner),
            ("max_total_contexts", self.max_total_contexts),
            ("max_context_age_days", self.max_context_age_days as usize),
        ] {
            if value == 0 {
                return Err(CacheError::Configuration(format!(
                    "context.{name} MUST be >= 1"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConversationLimits {
    pub max_conversations_per_owner: usize,
    pub max_messages_per_conversation: usize,
    pub max_conversation_age_days: u32,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            max_conversations_per_owner: 10,
            max_messages_per_conversation: 50,
            max_conversation_age_days: 30,
        }
    }
}

impl ConversationLimits {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_conversation_age_days))
    }

    /// # Errors
    /// Returns [`CacheError::Configuration`] when a cap or the age is zero.
    pub fn validate(&self) -> Result<(), CacheError> {
        for (name, value) in [
            (
                "max_conversations_per_owner",
                self.max_conversations_per_owner,
            ),
            (
                "max_messages_per_conversation",
                self.max_messages_per_conversation,
            ),
            (
                "max_conversation_age_days",
                self.max_conversation_age_days as usize,
            ),
        ] {
            if value == 0 {
                return Err(CacheError::Configuration(format!(
                    "conversation.{name} MUST be >= 1"
                )));
            }
        }
        Ok(())
    }
}

/// How a prompt is reduced before it becomes part of a cache key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptNormalization {
    /// Trim surrounding whitespace and lower-case.
    #[default]
    TrimLowercase,
    /// Use the prompt verbatim.
    Exact,
    /// Lower-case, drop punctuation, collapse runs of whitespace.
    Collapsed,
}

impl PromptNormalization {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrimLowercase => "trim_lowercase",
            Self::Exact => "exact",
            Self::Collapsed => "collapsed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trim_lowercase" => Some(Self::TrimLowercase),
            "exact" => Some(Self::Exact),
            "collapsed" => Some(Self::Collapsed),
            _ => None,
        }
    }

    #[must_use]
    pub fn apply(self, prompt: &str) -> String {
        match self {
            Self::TrimLowercase => prompt.trim().to_lowercase(),
            Self::Exact => prompt.to_string(),
            Self::Collapsed => prompt
                .to_lowercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { ' ' })
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResponseCacheSettings {
    pub max_size: usize,
    pub ttl_hours: u32,
    pub similarity_threshold: f64,
    pub normalization: PromptNormalization,
}

impl Default for ResponseCacheSettings {
    fn default() -> Self {
        Self {
            max_size: 200,
            ttl_hours: 4,
            similarity_threshold: 0.8,
            normalization: PromptNormalization::TrimLowercase,
        }
    }
}

impl ResponseCacheSettings {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::hours(i64::from(self.ttl_hours))
    }

    /// # Errors
    /// Returns [`CacheError::Configuration`] for a zero size or TTL, or a
    /// threshold outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_size == 0 {
            return Err(CacheError::Configuration(
                "response_cache.max_size MUST be >= 1".to_string(),
            ));
        }

        if self.ttl_hours == 0 {
            return Err(CacheError::Configuration(
                "response_cache.ttl_hours MUST be >= 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(CacheError::Configuration(
                "response_cache.similarity_threshold MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub context: ContextLimits,
    pub conversation: ConversationLimits,
    pub response_cache: ResponseCacheSettings,
}

impl Settings {
    /// Decodes and validates settings from TOML. Missing tables and fields
    /// take their defaults.
    ///
    /// # Errors
    /// Returns [`CacheError::Configuration`] when decoding or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self, CacheError> {
        let settings: Self = toml::from_str(raw)
            .map_err(|err| CacheError::Configuration(format!("invalid settings TOML: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// Returns [`CacheError::Configuration`] when the file cannot be read or
    /// its contents are invalid.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CacheError::Configuration(format!(
                "failed to read settings file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// # Errors
    /// Returns the first [`CacheError::Configuration`] found in any section.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.context.validate()?;
        self.conversation.validate()?;
        self.response_cache.validate()
    }
}
