//! Property-based tests for the adaptive response engine.
//!
//! Verifies:
//! - Confidence is bounded by [0, confidence_cap] for any outcome history
//! - A success never lowers confidence; a failure never raises it
//! - Counters stay consistent: successes <= observations <= observation_cap
//! - Non-actionable categories never yield a response
//! - Learning is scoped per context key
//! - Disabled learning leaves the store untouched

use proptest::prelude::*;
use yesman_core::adaptive::{AdaptiveResponseEngine, EngineConfig, PredictionSource};
use yesman_core::detector::PromptCategory;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_actionable() -> impl Strategy<Value = PromptCategory> {
    prop_oneof![
        Just(PromptCategory::Trust),
        (2u8..=9).prop_map(PromptCategory::Selection),
        Just(PromptCategory::YesNo),
    ]
}

fn arb_passive() -> impl Strategy<Value = PromptCategory> {
    prop_oneof![
        Just(PromptCategory::TypingInProgress),
        Just(PromptCategory::Idle),
        Just(PromptCategory::Unknown),
    ]
}

fn arb_response() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("1"), Just("2"), Just("3"), Just("yes"), Just("no")]
}

/// Outcome histories long enough to run well past the observation cap.
fn arb_history() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..300)
}

fn arb_long_history() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..400)
}

fn arb_config() -> impl Strategy<Value = EngineConfig> {
    (0.5f64..=1.0, 0.5f64..10.0, 0.0f64..=1.0).prop_map(|(cap, k, p)| EngineConfig {
        confidence_cap: cap,
        prior_weight: k,
        cold_start_confidence: p,
        ..EngineConfig::default()
    })
}

const CONTEXT: &str = "work";

// ────────────────────────────────────────────────────────────────────
// Confidence bounds
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Whatever happened, confidence lies in [0, cap].
    #[test]
    fn prop_confidence_bounded(
        config in arb_config(),
        category in arb_actionable(),
        history in prop::collection::vec((arb_response(), any::<bool>()), 0..200),
    ) {
        let engine = AdaptiveResponseEngine::new(config);
        let cap = engine.config().confidence_cap;
        for (response, success) in history {
            engine.record(CONTEXT, category, response, success);
            let p = engine.predict_category(category, CONTEXT);
            prop_assert!(p.confidence >= 0.0 && p.confidence <= cap,
                "confidence {} outside [0, {}]", p.confidence, cap);
            prop_assert!(p.response.is_some());
        }
    }

    /// The default cap of 0.95 holds after any run of successes.
    #[test]
    fn prop_default_cap_holds(n in 1usize..300) {
        let engine = AdaptiveResponseEngine::default();
        for _ in 0..n {
            engine.record(CONTEXT, PromptCategory::YesNo, "yes", true);
        }
        let p = engine.predict_category(PromptCategory::YesNo, CONTEXT);
        prop_assert!(p.confidence <= 0.95);
        prop_assert_eq!(p.source, PredictionSource::Learned);
        prop_assert_eq!(p.response.as_deref(), Some("yes"));
    }
}

// ────────────────────────────────────────────────────────────────────
// Monotonicity
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// With a single candidate, a success never lowers confidence and a
    /// failure never raises it, including once the row is full.
    #[test]
    fn prop_outcome_direction(
        category in arb_actionable(),
        history in arb_history(),
    ) {
        let engine = AdaptiveResponseEngine::default();
        let mut before = engine.predict_category(category, CONTEXT).confidence;
        for success in history {
            engine.record(CONTEXT, category, "1", success);
            let after = engine.predict_category(category, CONTEXT).confidence;
            if success {
                prop_assert!(after >= before, "success lowered {} -> {}", before, after);
            } else {
                prop_assert!(after <= before, "failure raised {} -> {}", before, after);
            }
            before = after;
        }
    }

    /// Once the row holds `observation_cap` outcomes, one more outcome still
    /// moves confidence in its own direction.
    #[test]
    fn prop_full_window_keeps_direction(
        prefix in prop::collection::vec(any::<bool>(), 100..=160),
        extra in any::<bool>(),
    ) {
        let engine = AdaptiveResponseEngine::default();
        for success in prefix {
            engine.record(CONTEXT, PromptCategory::YesNo, "yes", success);
        }
        let before = engine.predict_category(PromptCategory::YesNo, CONTEXT).confidence;
        engine.record(CONTEXT, PromptCategory::YesNo, "yes", extra);
        let after = engine.predict_category(PromptCategory::YesNo, CONTEXT).confidence;
        if extra {
            prop_assert!(after >= before, "success lowered {} -> {}", before, after);
        } else {
            prop_assert!(after <= before, "failure raised {} -> {}", before, after);
        }
    }

    /// A failure strictly lowers confidence below the cap.
    #[test]
    fn prop_failure_strictly_lowers(
        successes in 0usize..20,
        failures in 0usize..20,
    ) {
        let engine = AdaptiveResponseEngine::default();
        for _ in 0..successes {
            engine.record(CONTEXT, PromptCategory::Trust, "1", true);
        }
        for _ in 0..failures {
            engine.record(CONTEXT, PromptCategory::Trust, "1", false);
        }
        let before = engine.predict_category(PromptCategory::Trust, CONTEXT).confidence;
        engine.record(CONTEXT, PromptCategory::Trust, "1", false);
        let after = engine.predict_category(PromptCategory::Trust, CONTEXT).confidence;
        prop_assert!(after < before, "{} -> {}", before, after);
    }
}

// ────────────────────────────────────────────────────────────────────
// Counters and the observation window
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// successes <= observations <= observation_cap at every step.
    #[test]
    fn prop_counters_consistent(
        category in arb_actionable(),
        history in arb_long_history(),
    ) {
        let engine = AdaptiveResponseEngine::default();
        let cap = engine.config().observation_cap;
        for success in history {
            engine.record(CONTEXT, category, "yes", success);
            for stat in engine.stats() {
                prop_assert!(stat.successes <= stat.observations);
                prop_assert!(stat.observations <= cap,
                    "observations {} exceed cap {}", stat.observations, cap);
                prop_assert!(stat.observations >= 1);
            }
        }
    }

    /// Snapshot reports exactly the contexts and categories that were fed.
    #[test]
    fn prop_snapshot_covers_recorded(
        entries in prop::collection::vec(
            (prop_oneof![Just("alpha"), Just("beta"), Just("gamma")], arb_actionable(), arb_response()),
            1..30,
        ),
    ) {
        let engine = AdaptiveResponseEngine::default();
        for (context, category, response) in &entries {
            engine.record(context, *category, response, true);
        }
        let snapshot = engine.snapshot();
        for (context, category, _) in &entries {
            let best = snapshot
                .get(*context)
                .and_then(|by_category| by_category.get(&category.key()));
            prop_assert!(best.is_some(), "missing {}/{}", context, category);
        }
        let total: usize = snapshot.values().map(|m| m.len()).sum();
        let mut distinct: Vec<(&str, PromptCategory)> =
            entries.iter().map(|(c, cat, _)| (*c, *cat)).collect();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(total, distinct.len());
    }
}

// ────────────────────────────────────────────────────────────────────
// Scoping
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Non-actionable categories never produce a response, and recording
    /// outcomes for them stores nothing.
    #[test]
    fn prop_passive_never_answered(
        category in arb_passive(),
        response in arb_response(),
        success in any::<bool>(),
    ) {
        let engine = AdaptiveResponseEngine::default();
        engine.record(CONTEXT, category, response, success);
        let p = engine.predict_category(category, CONTEXT);
        prop_assert!(p.response.is_none());
        prop_assert_eq!(p.confidence, 0.0);
        prop_assert_eq!(p.source, PredictionSource::NotActionable);
        prop_assert!(engine.stats().is_empty());
    }

    /// Learning in one context leaves another at its cold-start default.
    #[test]
    fn prop_contexts_isolated(
        category in arb_actionable(),
        history in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let engine = AdaptiveResponseEngine::default();
        for success in history {
            engine.record("alpha", category, "2", success);
        }
        let other = engine.predict_category(category, "beta");
        prop_assert_eq!(other.source, PredictionSource::ColdStart);
        prop_assert_eq!(other.confidence, engine.config().cold_start_confidence);
        prop_assert_eq!(other.observations, 0);
    }

    /// With learning disabled, records are ignored.
    #[test]
    fn prop_disabled_learning_is_inert(
        category in arb_actionable(),
        history in prop::collection::vec((arb_response(), any::<bool>()), 1..40),
    ) {
        let engine = AdaptiveResponseEngine::default();
        engine.set_learning_enabled(false);
        for (response, success) in history {
            engine.record(CONTEXT, category, response, success);
        }
        prop_assert!(engine.stats().is_empty());
        prop_assert_eq!(
            engine.predict_category(category, CONTEXT).source,
            PredictionSource::ColdStart
        );
    }
}
