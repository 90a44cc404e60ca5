//! Adaptive response engine.
//!
//! Online statistics over `(context_key, category, response)` rows. Each row
//! counts observations and successes; prediction picks the best-scoring row
//! for a `(context_key, category)` bucket and turns its counts into a
//! confidence.
//!
//! # Confidence
//!
//! ```text
//!   w    = n / (n + k)                    sample-size factor
//!   conf = w · (s / n) + (1 − w) · p      blend of success rate and prior
//!        = (s + p·k) / (n + k)
//!   conf = clamp(conf, 0, cap)
//! ```
//!
//! `p` is the cold-start confidence, `k` the prior weight. With no
//! observations the engine returns the category default at `p`; successes
//! raise confidence towards `cap`, failures lower it towards zero, and a
//! single observation moves it by at most `1 / (1 + k)`.
//!
//! A row holds at most `observation_cap` observations. At the cap the row acts
//! as a sliding window: a success displaces one stored failure and a failure
//! displaces one stored success, so recent outcomes keep their weight and an
//! outcome never moves confidence the wrong way.
//!
//! # Concurrency
//!
//! Buckets live behind one `RwLock`; every row has its own `Mutex`, so
//! concurrent `record` calls on the same row serialize while different rows
//! proceed independently. `predict` and `snapshot` never mutate state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::detector::{PromptCategory, PromptClassification};

// =============================================================================
// Configuration
// =============================================================================

/// Static responses used before anything has been learned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultResponses {
    pub trust: String,
    pub selection: String,
    pub yes_no: String,
}

impl Default for DefaultResponses {
    fn default() -> Self {
        Self {
            trust: "1".to_string(),
            selection: "1".to_string(),
            yes_no: "yes".to_string(),
        }
    }
}

impl DefaultResponses {
    /// Default for an actionable category.
    #[must_use]
    pub fn for_category(&self, category: PromptCategory) -> Option<&str> {
        match category {
            PromptCategory::Trust => Some(&self.trust),
            PromptCategory::Selection(_) => Some(&self.selection),
            PromptCategory::YesNo => Some(&self.yes_no),
            _ => None,
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on any returned confidence.
    pub confidence_cap: f64,
    /// Pseudo-observations given to the prior (`k`).
    pub prior_weight: f64,
    /// Confidence of a cold-start default (`p`).
    pub cold_start_confidence: f64,
    /// Most observations a row retains.
    pub observation_cap: u32,
    /// When false, `record` is a no-op.
    pub learning_enabled: bool,
    pub defaults: DefaultResponses,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_cap: 0.95,
            prior_weight: 3.0,
            cold_start_confidence: 0.5,
            observation_cap: 100,
            learning_enabled: true,
            defaults: DefaultResponses::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values into their valid ranges.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.confidence_cap = self.confidence_cap.clamp(0.0, 1.0);
        self.cold_start_confidence = self.cold_start_confidence.clamp(0.0, self.confidence_cap);
        if !self.prior_weight.is_finite() || self.prior_weight <= 0.0 {
            self.prior_weight = 1.0;
        }
        self.observation_cap = self.observation_cap.max(1);
        self
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Learned statistics for one candidate response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStat {
    pub context_key: String,
    pub category: PromptCategory,
    pub response_value: String,
    pub observations: u32,
    pub successes: u32,
    pub last_updated: DateTime<Utc>,
}

impl ResponseStat {
    fn new(context_key: &str, category: PromptCategory, response: &str) -> Self {
        Self {
            context_key: context_key.to_string(),
            category,
            response_value: response.to_string(),
            observations: 0,
            successes: 0,
            last_updated: Utc::now(),
        }
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.observations)
        }
    }

    /// Smoothed confidence under `config`.
    #[must_use]
    pub fn confidence(&self, config: &EngineConfig) -> f64 {
        let n = f64::from(self.observations);
        let s = f64::from(self.successes.min(self.observations));
        let k = config.prior_weight;
        let p = config.cold_start_confidence;
        let conf = (s + p * k) / (n + k);
        if conf.is_finite() {
            conf.clamp(0.0, config.confidence_cap)
        } else {
            0.0
        }
    }

    fn apply(&mut self, success: bool, config: &EngineConfig) {
        if self.observations >= config.observation_cap {
            // window is full: the outcome replaces one of the opposite kind
            self.observations = config.observation_cap;
            self.successes = if success {
                self.successes.saturating_add(1).min(self.observations)
            } else {
                self.successes.min(self.observations).saturating_sub(1)
            };
        } else {
            self.observations += 1;
            if success {
                self.successes = self.successes.saturating_add(1);
            }
        }
        self.last_updated = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    context_key: String,
    category: PromptCategory,
}

type Row = Arc<Mutex<ResponseStat>>;

// =============================================================================
// Predictions
// =============================================================================

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    /// Learned statistics
    Learned,
    /// Static default, nothing learned yet
    ColdStart,
    /// Category is never answered automatically
    NotActionable,
    /// Fixed by a per-session manual override
    Override,
}

/// Suggested response and its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub response: Option<String>,
    pub confidence: f64,
    pub source: PredictionSource,
    /// Observations behind the chosen response.
    pub observations: u32,
}

impl Prediction {
    #[must_use]
    pub fn none() -> Self {
        Self {
            response: None,
            confidence: 0.0,
            source: PredictionSource::NotActionable,
            observations: 0,
        }
    }
}

/// Best learned response for one `(context, category)` in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResponse {
    pub response: String,
    pub confidence: f64,
    pub observations: u32,
    pub successes: u32,
}

/// Read-only export: context → category key → best response.
pub type LearnedSnapshot = BTreeMap<String, BTreeMap<String, BestResponse>>;

// =============================================================================
// Engine
// =============================================================================

/// Online-learning response predictor.
#[derive(Debug)]
pub struct AdaptiveResponseEngine {
    config: EngineConfig,
    learning_enabled: AtomicBool,
    buckets: RwLock<HashMap<BucketKey, Vec<Row>>>,
}

impl Default for AdaptiveResponseEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl AdaptiveResponseEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let config = config.normalized();
        Self {
            learning_enabled: AtomicBool::new(config.learning_enabled),
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_learning_enabled(&self, enabled: bool) {
        self.learning_enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn learning_enabled(&self) -> bool {
        self.learning_enabled.load(Ordering::SeqCst)
    }

    /// Predict a response for a classification.
    #[must_use]
    pub fn predict(&self, classification: &PromptClassification, context_key: &str) -> Prediction {
        self.predict_category(classification.category, context_key)
    }

    /// Predict a response for a category.
    ///
    /// Non-actionable categories (typing, idle, unknown) always yield no
    /// response at confidence 0.
    #[must_use]
    pub fn predict_category(&self, category: PromptCategory, context_key: &str) -> Prediction {
        let Some(default) = self.config.defaults.for_category(category) else {
            return Prediction::none();
        };

        let key = BucketKey {
            context_key: context_key.to_string(),
            category,
        };
        let best = {
            let buckets = self.buckets.read().expect("response stats lock poisoned");
            buckets.get(&key).and_then(|rows| self.best_of(rows))
        };

        match best {
            Some(stat) => {
                let confidence = stat.confidence(&self.config);
                trace!(
                    context_key,
                    category = %category,
                    confidence,
                    observations = stat.observations,
                    "Learned prediction"
                );
                Prediction {
                    response: Some(stat.response_value),
                    confidence,
                    source: PredictionSource::Learned,
                    observations: stat.observations,
                }
            }
            None => Prediction {
                response: Some(default.to_string()),
                confidence: self.config.cold_start_confidence,
                source: PredictionSource::ColdStart,
                observations: 0,
            },
        }
    }

    /// Highest confidence row; ties go to more observations, then the
    /// lexically smaller response.
    fn best_of(&self, rows: &[Row]) -> Option<ResponseStat> {
        rows.iter()
            .map(|row| row.lock().expect("response row lock poisoned").clone())
            .filter(|stat| stat.observations > 0)
            .max_by(|a, b| {
                a.confidence(&self.config)
                    .partial_cmp(&b.confidence(&self.config))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.observations.cmp(&b.observations))
                    .then_with(|| b.response_value.cmp(&a.response_value))
            })
    }

    /// Record the outcome of sending `response` to a `category` prompt.
    pub fn record(
        &self,
        context_key: &str,
        category: PromptCategory,
        response: &str,
        success: bool,
    ) {
        if !self.learning_enabled() {
            trace!(context_key, "Learning disabled; outcome ignored");
            return;
        }
        if !category.is_actionable() || response.is_empty() {
            debug!(category = %category, "Ignoring outcome for non-actionable category");
            return;
        }

        let row = self.row(context_key, category, response);
        let mut stat = row.lock().expect("response row lock poisoned");
        stat.apply(success, &self.config);
        debug!(
            context_key,
            category = %category,
            success,
            observations = stat.observations,
            successes = stat.successes,
            "Recorded response outcome"
        );
    }

    /// Learn from a response a human chose by hand.
    pub fn learn_from_manual(&self, context_key: &str, category: PromptCategory, response: &str) {
        self.record(context_key, category, response, true);
    }

    fn row(&self, context_key: &str, category: PromptCategory, response: &str) -> Row {
        let key = BucketKey {
            context_key: context_key.to_string(),
            category,
        };
        {
            let buckets = self.buckets.read().expect("response stats lock poisoned");
            if let Some(row) = buckets.get(&key).and_then(|rows| find_row(rows, response)) {
                return row;
            }
        }
        let mut buckets = self.buckets.write().expect("response stats lock poisoned");
        let rows = buckets.entry(key).or_default();
        if let Some(row) = find_row(rows, response) {
            return row;
        }
        let row = Arc::new(Mutex::new(ResponseStat::new(context_key, category, response)));
        rows.push(Arc::clone(&row));
        row
    }

    /// Copy of every row.
    #[must_use]
    pub fn stats(&self) -> Vec<ResponseStat> {
        let buckets = self.buckets.read().expect("response stats lock poisoned");
        let mut rows: Vec<ResponseStat> = buckets
            .values()
            .flatten()
            .map(|row| row.lock().expect("response row lock poisoned").clone())
            .collect();
        rows.sort_by(|a, b| {
            (&a.context_key, a.category, &a.response_value).cmp(&(
                &b.context_key,
                b.category,
                &b.response_value,
            ))
        });
        rows
    }

    /// Seed the store from previously exported rows; existing rows with the
    /// same key are replaced.
    pub fn import(&self, stats: impl IntoIterator<Item = ResponseStat>) {
        let mut buckets = self.buckets.write().expect("response stats lock poisoned");
        for mut stat in stats {
            if !stat.category.is_actionable() {
                continue;
            }
            stat.observations = stat.observations.min(self.config.observation_cap);
            stat.successes = stat.successes.min(stat.observations);
            let key = BucketKey {
                context_key: stat.context_key.clone(),
                category: stat.category,
            };
            let rows = buckets.entry(key).or_default();
            if let Some(row) = find_row(rows, &stat.response_value) {
                *row.lock().expect("response row lock poisoned") = stat;
            } else {
                rows.push(Arc::new(Mutex::new(stat)));
            }
        }
    }

    /// Best learned response per context and category.
    #[must_use]
    pub fn snapshot(&self) -> LearnedSnapshot {
        let buckets = self.buckets.read().expect("response stats lock poisoned");
        let mut out = LearnedSnapshot::new();
        for (key, rows) in buckets.iter() {
            if let Some(best) = self.best_of(rows) {
                out.entry(key.context_key.clone()).or_default().insert(
                    key.category.key(),
                    BestResponse {
                        confidence: best.confidence(&self.config),
                        response: best.response_value,
                        observations: best.observations,
                        successes: best.successes,
                    },
                );
            }
        }
        out
    }
}

fn find_row(rows: &[Row], response: &str) -> Option<Row> {
    rows.iter()
        .find(|row| row.lock().expect("response row lock poisoned").response_value == response)
        .cloned()
}
