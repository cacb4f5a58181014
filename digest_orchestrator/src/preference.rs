//! Preference state and the feedback learner.
//!
//! A profile is a topic → weight map whose weights always sum to 1. The
//! learner folds engagement signals into it with an exponential moving
//! average and renormalizes after every event.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::locks::UserLocks;
use crate::memory::RetrievalMemory;
use crate::settings::LearnerConfig;

const SUM_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Rating,
    Click,
    Dismiss,
    ReadDuration,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalType::Rating => "rating",
            SignalType::Click => "click",
            SignalType::Dismiss => "dismiss",
            SignalType::ReadDuration => "read_duration",
        };
        f.write_str(name)
    }
}

/// Map a raw engagement signal onto [0, 1].
pub fn signal_strength(signal: SignalType, value: f64, read_target_secs: f64) -> f64 {
    match signal {
        SignalType::Rating => (value / 5.0).clamp(0.0, 1.0),
        SignalType::Click => 1.0,
        SignalType::Dismiss => 0.0,
        SignalType::ReadDuration => {
            if read_target_secs <= 0.0 {
                return 1.0;
            }
            (value / read_target_secs).clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub user_id: String,
    pub content_id: String,
    pub signal_type: SignalType,
    pub signal_value: f64,
    pub timestamp: DateTime<Utc>,
    /// Explicit topics; when empty they are looked up in the content catalog.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl EngagementEvent {
    pub fn new(
        user_id: impl Into<String>,
        content_id: impl Into<String>,
        signal_type: SignalType,
        signal_value: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content_id: content_id.into(),
            signal_type,
            signal_value,
            timestamp: Utc::now(),
            topics: Vec::new(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LearnerError {
    #[error("user id cannot be empty")]
    EmptyUserId,

    #[error("event belongs to user '{actual}', not '{expected}'")]
    UserMismatch { expected: String, actual: String },

    #[error("no topics known for content '{0}'")]
    UnknownContent(String),

    #[error("signal value must be finite")]
    InvalidSignal,

    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}

/// Normalized per-topic weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceProfile {
    weights: BTreeMap<String, f64>,
}

impl PreferenceProfile {
    /// Equal weight across `topics`. An empty list yields an empty profile.
    pub fn uniform(topics: &[String]) -> Self {
        let mut weights = BTreeMap::new();
        for topic in topics {
            weights.insert(normalize_topic(topic), 0.0);
        }
        weights.remove("");
        let mut profile = Self { weights };
        profile.reset_uniform();
        profile
    }

    /// Build from raw non-negative weights, renormalized to sum to 1.
    pub fn from_weights(weights: BTreeMap<String, f64>) -> Result<Self, LearnerError> {
        if weights.is_empty() {
            return Err(LearnerError::InvalidProfile("no topics".to_string()));
        }
        let mut normalized = BTreeMap::new();
        for (topic, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(LearnerError::InvalidProfile(format!(
                    "weight for '{}' must be a non-negative number",
                    topic
                )));
            }
            let topic = normalize_topic(&topic);
            if topic.is_empty() {
                return Err(LearnerError::InvalidProfile("empty topic name".to_string()));
            }
            *normalized.entry(topic).or_insert(0.0) += weight;
        }
        let mut profile = Self { weights: normalized };
        profile.normalize();
        Ok(profile)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn weight(&self, topic: &str) -> f64 {
        self.weights.get(topic).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    /// EMA step for each of `topics` with the same strength, then renormalize.
    /// Unknown topics enter at weight 0 first.
    pub fn apply(&mut self, topics: &[String], strength: f64, alpha: f64) {
        for topic in topics {
            let topic = normalize_topic(topic);
            if topic.is_empty() {
                continue;
            }
            let old = self.weights.entry(topic).or_insert(0.0);
            *old = alpha * strength + (1.0 - alpha) * *old;
        }
        self.normalize();
    }

    /// Rescale so the weights sum to 1; a degenerate profile becomes uniform.
    pub fn normalize(&mut self) {
        let sum = self.sum();
        if !sum.is_finite() || sum < SUM_EPSILON {
            self.reset_uniform();
            return;
        }
        for weight in self.weights.values_mut() {
            *weight /= sum;
        }
    }

    fn reset_uniform(&mut self) {
        if self.weights.is_empty() {
            return;
        }
        let share = 1.0 / self.weights.len() as f64;
        for weight in self.weights.values_mut() {
            *weight = share;
        }
    }

    /// Up to `n` topics by descending weight, alphabetical on ties.
    pub fn top_topics(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, &f64)> = self.weights.iter().collect();
        ranked.sort_by(|(ta, wa), (tb, wb)| {
            wb.partial_cmp(wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ta.cmp(tb))
        });
        ranked.into_iter().take(n).map(|(t, _)| t.clone()).collect()
    }
}

fn normalize_topic(topic: &str) -> String {
    topic.trim().to_lowercase()
}

/// Result of applying a batch of events.
#[derive(Debug, Clone, Serialize)]
pub struct LearningSummary {
    pub applied: usize,
    pub skipped: Vec<String>,
    pub profile: PreferenceProfile,
}

const LIKED_THRESHOLD: f64 = 0.6;
const DISLIKED_THRESHOLD: f64 = 0.4;
const RANKED_TOPICS: usize = 5;

/// Bounded `content_id → topics` map; the oldest entry is evicted first.
#[derive(Debug, Default)]
struct ContentCatalog {
    topics: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
}

impl ContentCatalog {
    /// Returns the evicted content id, if any.
    fn insert(&mut self, content_id: String, topics: Vec<String>, capacity: usize) -> Option<String> {
        if let Some(existing) = self.topics.get_mut(&content_id) {
            *existing = topics;
            return None;
        }
        let mut evicted = None;
        if self.topics.len() >= capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.topics.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.order.push_back(content_id.clone());
        self.topics.insert(content_id, topics);
        evicted
    }

    fn get(&self, content_id: &str) -> Option<Vec<String>> {
        self.topics.get(content_id).cloned()
    }

    fn len(&self) -> usize {
        self.topics.len()
    }
}

#[derive(Debug, Clone, Default)]
struct EngagementTally {
    total_events: usize,
    ratings: usize,
    rating_sum: f64,
    distribution: BTreeMap<u8, usize>,
    clicks: usize,
    dismissals: usize,
    read_secs: f64,
    liked: BTreeMap<String, usize>,
    disliked: BTreeMap<String, usize>,
    last_event_at: Option<DateTime<Utc>>,
}

impl EngagementTally {
    fn add(&mut self, event: &EngagementEvent, topics: &[String], strength: f64) {
        self.total_events += 1;
        match event.signal_type {
            SignalType::Rating => {
                self.ratings += 1;
                self.rating_sum += event.signal_value;
                let stars = event.signal_value.round().clamp(0.0, 5.0) as u8;
                *self.distribution.entry(stars).or_insert(0) += 1;
            }
            SignalType::Click => self.clicks += 1,
            SignalType::Dismiss => self.dismissals += 1,
            SignalType::ReadDuration => self.read_secs += event.signal_value.max(0.0),
        }

        let bucket = if strength >= LIKED_THRESHOLD {
            Some(&mut self.liked)
        } else if strength <= DISLIKED_THRESHOLD {
            Some(&mut self.disliked)
        } else {
            None
        };
        if let Some(bucket) = bucket {
            for topic in topics {
                *bucket.entry(normalize_topic(topic)).or_insert(0) += 1;
            }
        }

        if self.last_event_at.map_or(true, |at| event.timestamp > at) {
            self.last_event_at = Some(event.timestamp);
        }
    }

    fn stats(&self) -> EngagementStats {
        EngagementStats {
            total_events: self.total_events,
            ratings: self.ratings,
            average_rating: (self.ratings > 0).then(|| self.rating_sum / self.ratings as f64),
            rating_distribution: self
                .distribution
                .iter()
                .map(|(stars, count)| (stars.to_string(), *count))
                .collect(),
            clicks: self.clicks,
            dismissals: self.dismissals,
            total_read_secs: self.read_secs,
            most_liked_topics: ranked(&self.liked),
            most_disliked_topics: ranked(&self.disliked),
            last_event_at: self.last_event_at,
        }
    }
}

fn ranked(counts: &BTreeMap<String, usize>) -> Vec<String> {
    let mut topics: Vec<(&String, &usize)> = counts.iter().collect();
    topics.sort_by(|(ta, ca), (tb, cb)| cb.cmp(ca).then_with(|| ta.cmp(tb)));
    topics
        .into_iter()
        .take(RANKED_TOPICS)
        .map(|(topic, _)| topic.clone())
        .collect()
}

/// Per-user engagement and rating statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngagementStats {
    pub total_events: usize,
    pub ratings: usize,
    pub average_rating: Option<f64>,
    /// Rating counts keyed by rounded star value.
    pub rating_distribution: BTreeMap<String, usize>,
    pub clicks: usize,
    pub dismissals: usize,
    pub total_read_secs: f64,
    pub most_liked_topics: Vec<String>,
    pub most_disliked_topics: Vec<String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Owns every user's profile and engagement tally, plus the content catalog
/// used to attribute events to topics.
pub struct PreferenceLearner {
    config: LearnerConfig,
    profiles: DashMap<String, PreferenceProfile>,
    engagement: DashMap<String, EngagementTally>,
    catalog: Mutex<ContentCatalog>,
    memory: Arc<RetrievalMemory>,
    locks: Arc<UserLocks>,
}

impl fmt::Debug for PreferenceLearner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceLearner")
            .field("config", &self.config)
            .field("profiles", &self.profiles.len())
            .field("catalog", &self.catalog.lock().len())
            .finish()
    }
}

impl PreferenceLearner {
    pub fn new(config: LearnerConfig, memory: Arc<RetrievalMemory>, locks: Arc<UserLocks>) -> Self {
        Self {
            config,
            profiles: DashMap::new(),
            engagement: DashMap::new(),
            catalog: Mutex::new(ContentCatalog::default()),
            memory,
            locks,
        }
    }

    fn default_profile(&self) -> PreferenceProfile {
        PreferenceProfile::uniform(&self.config.default_topics)
    }

    /// Current profile, serialized against learning writes for the same user.
    pub async fn get_profile(&self, user_id: &str) -> PreferenceProfile {
        let _guard = self.locks.lock(user_id).await;
        self.profile_unlocked(user_id)
    }

    fn profile_unlocked(&self, user_id: &str) -> PreferenceProfile {
        self.profiles
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_profile())
    }

    /// Replace a user's profile with explicit weights.
    pub async fn set_profile(
        &self,
        user_id: &str,
        weights: BTreeMap<String, f64>,
    ) -> Result<PreferenceProfile, LearnerError> {
        if user_id.is_empty() {
            return Err(LearnerError::EmptyUserId);
        }
        let profile = PreferenceProfile::from_weights(weights)?;
        let _guard = self.locks.lock(user_id).await;
        self.profiles.insert(user_id.to_string(), profile.clone());
        Ok(profile)
    }

    pub async fn top_topics(&self, user_id: &str, n: usize) -> Vec<String> {
        self.get_profile(user_id).await.top_topics(n)
    }

    pub async fn engagement_stats(&self, user_id: &str) -> EngagementStats {
        let _guard = self.locks.lock(user_id).await;
        self.engagement
            .get(user_id)
            .map(|tally| tally.stats())
            .unwrap_or_default()
    }

    /// Forget a user's profile and engagement. Returns whether anything was
    /// stored.
    pub async fn clear_user(&self, user_id: &str) -> bool {
        let _guard = self.locks.lock(user_id).await;
        let profile = self.profiles.remove(user_id).is_some();
        let engagement = self.engagement.remove(user_id).is_some();
        profile || engagement
    }

    /// Record which topics a piece of content covers.
    pub fn register_content(&self, content_id: &str, topics: &[String]) {
        let topics: Vec<String> = topics
            .iter()
            .map(|t| normalize_topic(t))
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            return;
        }
        debug!("Registered content {} with topics {:?}", content_id, topics);
        let evicted =
            self.catalog
                .lock()
                .insert(content_id.to_string(), topics, self.config.catalog_capacity);
        if let Some(evicted) = evicted {
            debug!("Evicted content {} from the catalog", evicted);
        }
    }

    pub fn topics_for(&self, content_id: &str) -> Option<Vec<String>> {
        self.catalog.lock().get(content_id)
    }

    /// Explicit event topics, then the catalog, then the stored digest record.
    fn resolve_topics(&self, event: &EngagementEvent) -> Option<Vec<String>> {
        if !event.topics.is_empty() {
            return Some(event.topics.clone());
        }
        if let Some(topics) = self.topics_for(&event.content_id) {
            return Some(topics);
        }
        let record = self
            .memory
            .find_by_meta(&event.user_id, "content_id", &event.content_id)?;
        let topics: Vec<String> = record
            .metadata
            .get("topics")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        (!topics.is_empty()).then_some(topics)
    }

    /// Apply one engagement event.
    pub async fn record_event(
        &self,
        user_id: &str,
        event: EngagementEvent,
    ) -> Result<PreferenceProfile, LearnerError> {
        if self.resolve_topics(&event).is_none() {
            return Err(LearnerError::UnknownContent(event.content_id));
        }
        let summary = self.record_events(user_id, vec![event]).await?;
        Ok(summary.profile)
    }

    /// Apply a batch under a single lock acquisition. Events whose topics
    /// cannot be resolved are skipped and reported.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn record_events(
        &self,
        user_id: &str,
        events: Vec<EngagementEvent>,
    ) -> Result<LearningSummary, LearnerError> {
        if user_id.is_empty() {
            return Err(LearnerError::EmptyUserId);
        }
        for event in &events {
            if event.user_id != user_id {
                return Err(LearnerError::UserMismatch {
                    expected: user_id.to_string(),
                    actual: event.user_id.clone(),
                });
            }
            if !event.signal_value.is_finite() {
                return Err(LearnerError::InvalidSignal);
            }
        }

        let mut applied = Vec::with_capacity(events.len());
        let mut skipped = Vec::new();
        let profile = {
            let _guard = self.locks.lock(user_id).await;
            let mut profile = self.profile_unlocked(user_id);
            let mut tally = self
                .engagement
                .get(user_id)
                .map(|t| t.clone())
                .unwrap_or_default();
            for event in events {
                let Some(topics) = self.resolve_topics(&event) else {
                    warn!("Skipping event for unknown content {}", event.content_id);
                    skipped.push(event.content_id);
                    continue;
                };
                let strength =
                    signal_strength(event.signal_type, event.signal_value, self.config.read_target_secs);
                profile.apply(&topics, strength, self.config.alpha);
                tally.add(&event, &topics, strength);
                applied.push((event, topics, strength));
            }
            self.profiles.insert(user_id.to_string(), profile.clone());
            if tally.total_events > 0 {
                self.engagement.insert(user_id.to_string(), tally);
            }
            profile
        };

        info!(
            "Applied {} engagement events for user {} ({} skipped)",
            applied.len(),
            user_id,
            skipped.len()
        );

        // Memory writes take the same per-user lock, so they run after it is released.
        for (event, topics, strength) in &applied {
            self.remember_feedback(event, topics, *strength).await;
        }

        Ok(LearningSummary {
            applied: applied.len(),
            skipped,
            profile,
        })
    }

    async fn remember_feedback(&self, event: &EngagementEvent, topics: &[String], strength: f64) {
        let text = format!(
            "{} feedback on {} at {}: {}",
            event.signal_type,
            event.content_id,
            event.timestamp.to_rfc3339(),
            topics.join(", ")
        );
        let mut metadata = Map::new();
        metadata.insert("kind".to_string(), json!("feedback"));
        metadata.insert("content_id".to_string(), json!(event.content_id));
        metadata.insert("signal_type".to_string(), json!(event.signal_type));
        metadata.insert("signal_value".to_string(), json!(event.signal_value));
        metadata.insert("strength".to_string(), json!(strength));
        metadata.insert("topics".to_string(), Value::from(topics.to_vec()));

        if let Err(e) = self.memory.remember(&event.user_id, &text, metadata).await {
            warn!("Failed to store feedback for {}: {}", event.content_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemoryConfig;
    use proptest::prelude::*;

    fn learner() -> PreferenceLearner {
        let locks = Arc::new(UserLocks::new());
        let memory = Arc::new(RetrievalMemory::with_hash_embedder(
            MemoryConfig::default(),
            locks.clone(),
        ));
        PreferenceLearner::new(LearnerConfig::default(), memory, locks)
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(t, w)| (t.to_string(), *w)).collect()
    }

    #[test]
    fn test_signal_strength_mapping() {
        assert_eq!(signal_strength(SignalType::Rating, 5.0, 240.0), 1.0);
        assert_eq!(signal_strength(SignalType::Rating, 7.0, 240.0), 1.0);
        assert!((signal_strength(SignalType::Rating, 4.0, 240.0) - 0.8).abs() < 1e-9);
        assert_eq!(signal_strength(SignalType::Click, 0.0, 240.0), 1.0);
        assert_eq!(signal_strength(SignalType::Dismiss, 5.0, 240.0), 0.0);
        assert_eq!(signal_strength(SignalType::ReadDuration, 120.0, 240.0), 0.5);
    }

    #[test]
    fn test_ema_update_matches_worked_example() {
        let mut profile =
            PreferenceProfile::from_weights(weights(&[("tech", 0.5), ("sports", 0.5)])).unwrap();
        profile.apply(&["tech".to_string()], 1.0, 0.2);
        assert!((profile.weight("tech") - 0.545).abs() < 0.001);
        assert!((profile.weight("sports") - 0.455).abs() < 0.001);
    }

    #[test]
    fn test_new_topic_enters_at_zero_and_degenerate_resets() {
        let mut profile = PreferenceProfile::uniform(&["tech".to_string()]);
        profile.apply(&["music".to_string()], 1.0, 0.2);
        // music: 0.2, tech: 1.0 -> normalized over 1.2
        assert!((profile.weight("music") - 0.2 / 1.2).abs() < 1e-9);

        let mut zeroed = PreferenceProfile::uniform(&["a".to_string(), "b".to_string()]);
        zeroed.apply(&["a".to_string(), "b".to_string()], 0.0, 1.0);
        assert!((zeroed.weight("a") - 0.5).abs() < 1e-9);
        assert!((zeroed.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_profiles_are_rejected() {
        assert!(PreferenceProfile::from_weights(BTreeMap::new()).is_err());
        assert!(PreferenceProfile::from_weights(weights(&[("a", -1.0)])).is_err());
        assert!(PreferenceProfile::from_weights(weights(&[("a", f64::NAN)])).is_err());
    }

    #[tokio::test]
    async fn test_record_event_uses_catalog_and_remembers_feedback() {
        let learner = learner();
        let default = learner.get_profile("u1").await;
        assert_eq!(default.top_topics(5), vec!["business", "technology"]);

        let err = learner
            .record_event("u1", EngagementEvent::new("u1", "digest-1", SignalType::Click, 1.0))
            .await
            .unwrap_err();
        assert_eq!(err, LearnerError::UnknownContent("digest-1".to_string()));

        learner.register_content("digest-1", &["Technology".to_string()]);
        let profile = learner
            .record_event("u1", EngagementEvent::new("u1", "digest-1", SignalType::Rating, 5.0))
            .await
            .unwrap();
        assert!(profile.weight("technology") > profile.weight("business"));
        assert_eq!(learner.top_topics("u1", 1).await, vec!["technology"]);
        assert_eq!(learner.memory.len("u1"), 1);
    }

    #[tokio::test]
    async fn test_batch_skips_unknown_and_rejects_foreign_events() {
        let learner = learner();
        let events = vec![
            EngagementEvent::new("u1", "a", SignalType::Dismiss, 0.0).with_topics(["business"]),
            EngagementEvent::new("u1", "missing", SignalType::Click, 1.0),
        ];
        let summary = learner.record_events("u1", events).await.unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.skipped, vec!["missing".to_string()]);
        assert!(summary.profile.weight("technology") > summary.profile.weight("business"));

        let foreign = vec![EngagementEvent::new("u2", "a", SignalType::Click, 1.0)];
        assert!(matches!(
            learner.record_events("u1", foreign).await,
            Err(LearnerError::UserMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_profile_then_rating_matches_worked_example() {
        let learner = learner();
        learner
            .set_profile("u1", weights(&[("tech", 0.5), ("sports", 0.5)]))
            .await
            .unwrap();
        let event = EngagementEvent::new("u1", "d1", SignalType::Rating, 5.0).with_topics(["tech"]);
        let profile = learner.record_event("u1", event).await.unwrap();
        assert!((profile.weight("tech") - 0.545).abs() < 0.001);
        assert!((profile.weight("sports") - 0.455).abs() < 0.001);

        assert_eq!(
            learner.set_profile("", weights(&[("tech", 1.0)])).await.unwrap_err(),
            LearnerError::EmptyUserId
        );
    }

    #[tokio::test]
    async fn test_catalog_is_bounded_and_falls_back_to_memory() {
        let locks = Arc::new(UserLocks::new());
        let memory = Arc::new(RetrievalMemory::with_hash_embedder(
            MemoryConfig::default(),
            locks.clone(),
        ));
        let config = LearnerConfig {
            catalog_capacity: 2,
            ..LearnerConfig::default()
        };
        let learner = PreferenceLearner::new(config, memory.clone(), locks);

        let mut meta = Map::new();
        meta.insert("kind".to_string(), json!("digest"));
        meta.insert("content_id".to_string(), json!("d1"));
        meta.insert("topics".to_string(), json!(["rust"]));
        memory.remember("u1", "weekly rust digest", meta).await.unwrap();

        for id in ["d1", "d2", "d3"] {
            learner.register_content(id, &["rust".to_string()]);
        }
        assert_eq!(learner.topics_for("d1"), None);
        assert_eq!(learner.topics_for("d3"), Some(vec!["rust".to_string()]));

        let profile = learner
            .record_event("u1", EngagementEvent::new("u1", "d1", SignalType::Click, 1.0))
            .await
            .unwrap();
        assert!(profile.weight("rust") > 0.0);

        let err = learner
            .record_event("u2", EngagementEvent::new("u2", "d1", SignalType::Click, 1.0))
            .await
            .unwrap_err();
        assert_eq!(err, LearnerError::UnknownContent("d1".to_string()));
    }

    #[tokio::test]
    async fn test_engagement_stats_and_clear_user() {
        let learner = learner();
        assert_eq!(learner.engagement_stats("u1").await, EngagementStats::default());

        let events = vec![
            EngagementEvent::new("u1", "a", SignalType::Rating, 5.0).with_topics(["rust"]),
            EngagementEvent::new("u1", "b", SignalType::Rating, 4.0).with_topics(["rust", "go"]),
            EngagementEvent::new("u1", "c", SignalType::Rating, 1.0).with_topics(["sports"]),
            EngagementEvent::new("u1", "d", SignalType::Click, 1.0).with_topics(["go"]),
            EngagementEvent::new("u1", "e", SignalType::Dismiss, 0.0).with_topics(["sports"]),
            EngagementEvent::new("u1", "f", SignalType::ReadDuration, 90.0).with_topics(["go"]),
        ];
        learner.record_events("u1", events).await.unwrap();

        let stats = learner.engagement_stats("u1").await;
        assert_eq!(stats.total_events, 6);
        assert_eq!(stats.ratings, 3);
        assert!((stats.average_rating.unwrap() - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.rating_distribution.get("5"), Some(&1));
        assert_eq!(stats.rating_distribution.get("1"), Some(&1));
        assert_eq!(stats.clicks, 1);
        assert_eq!(stats.dismissals, 1);
        assert_eq!(stats.total_read_secs, 90.0);
        // rust: liked twice; go: liked twice (rating 4, click); read of 90s is 0.375 -> disliked.
        assert_eq!(stats.most_liked_topics, vec!["go", "rust"]);
        assert_eq!(stats.most_disliked_topics, vec!["sports", "go"]);
        assert!(stats.last_event_at.is_some());

        assert!(learner.clear_user("u1").await);
        assert_eq!(learner.engagement_stats("u1").await, EngagementStats::default());
        assert_eq!(learner.get_profile("u1").await, learner.default_profile());
        assert!(!learner.clear_user("u1").await);
    }

    proptest! {
        #[test]
        fn prop_weights_sum_to_one_after_every_update(
            initial in proptest::collection::btree_map("[a-e]", 0.0f64..10.0, 1..5),
            updates in proptest::collection::vec(("[a-g]", 0.0f64..=1.0), 0..20),
            alpha in 0.01f64..=1.0,
        ) {
            let mut profile = PreferenceProfile::from_weights(initial).unwrap();
            prop_assert!((profile.sum() - 1.0).abs() < 1e-9);
            for (topic, strength) in updates {
                profile.apply(&[topic], strength, alpha);
                prop_assert!((profile.sum() - 1.0).abs() < 1e-9);
                prop_assert!(profile.weights().values().all(|w| (0.0..=1.0).contains(w)));
            }
        }
    }
}
