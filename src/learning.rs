//! Step 2: learning classification
//!
//! High-accuracy analyses (score > 0.8) become LearningItems, routed
//! entity-scoped or pairing-scoped by a keyword taxonomy over the
//! pattern key. Low-accuracy analyses (score < 0.4) schedule a decay
//! directive per contributing factor so systematically unreliable
//! reasoning loses influence over time; directives are recorded here
//! and applied in the step-5 sweep.

use crate::types::{
    AccuracyAnalysis, DecayDirective, EventOutcome, LearningItem, LearningScope,
};

/// Analyses scoring above this become learning items.
pub const LEARN_THRESHOLD: f64 = 0.8;

/// Analyses scoring below this schedule factor decay.
pub const MISS_THRESHOLD: f64 = 0.4;

/// Largest share of confidence one scheduled decay can remove.
const MAX_FACTOR_PENALTY: f64 = 0.25;

/// Which kind of knowledge a pattern key describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternScope {
    Entity,
    Pairing,
}

/// Routes a pattern key to entity- or pairing-scoped knowledge.
/// A seam so the keyword taxonomy can be swapped without touching the
/// workflow engine.
pub trait InsightClassifier: Send + Sync {
    fn classify(&self, pattern_key: &str) -> PatternScope;
}

const ENTITY_KEYWORDS: &[&str] = &[
    "home-field",
    "offensive-style",
    "defensive-strength",
    "coaching",
    "individual-performance",
];

const PAIRING_KEYWORDS: &[&str] = &[
    "head-to-head",
    "style-matchup",
    "historical-performance",
    "rivalry",
    "repeated-pairing",
];

/// Default substring-match classifier. Ties (including zero hits on
/// both lists) default to entity scope.
pub struct KeywordClassifier;

impl InsightClassifier for KeywordClassifier {
    fn classify(&self, pattern_key: &str) -> PatternScope {
        let key = pattern_key.to_lowercase();
        let hits = |keywords: &[&str]| keywords.iter().filter(|k| key.contains(*k)).count();

        if hits(PAIRING_KEYWORDS) > hits(ENTITY_KEYWORDS) {
            PatternScope::Pairing
        } else {
            PatternScope::Entity
        }
    }
}

/// Output of step 2: the insights to persist and the decays to apply
/// later in step 5.
#[derive(Debug, Default)]
pub struct ClassifiedLearning {
    pub items: Vec<LearningItem>,
    pub decays: Vec<DecayDirective>,
}

/// Descriptive pattern key for an analysis: the category plus the
/// reasoning factors that backed it.
fn pattern_key(analysis: &AccuracyAnalysis) -> String {
    if analysis.factors.is_empty() {
        format!("accurate-{}", analysis.category)
    } else {
        format!("{}: {}", analysis.category, analysis.factors.join(", "))
    }
}

/// Entity a validated insight is attributed to: the realized winner,
/// falling back to the home participant on a draw.
fn attributed_entity(outcome: &EventOutcome) -> String {
    outcome
        .winner()
        .unwrap_or(&outcome.home_entity)
        .to_string()
}

/// Classify all analyses for one event.
pub fn classify_analyses(
    outcome: &EventOutcome,
    analyses: &[AccuracyAnalysis],
    classifier: &dyn InsightClassifier,
) -> ClassifiedLearning {
    let mut result = ClassifiedLearning::default();

    for analysis in analyses {
        if analysis.score > LEARN_THRESHOLD {
            let key = pattern_key(analysis);
            let scope = match classifier.classify(&key) {
                PatternScope::Entity => LearningScope::Entity {
                    entity_id: attributed_entity(outcome),
                },
                PatternScope::Pairing => LearningScope::Pairing {
                    pair_key: outcome.pair_key(),
                },
            };
            result.items.push(LearningItem {
                expert_id: analysis.expert_id.clone(),
                scope,
                pattern_key: key,
                validation: analysis.score,
            });
        } else if analysis.score < MISS_THRESHOLD {
            // Normalized miss magnitude is 1 - score (the scoring
            // formula already divided by the category scale).
            let penalty = 1.0 - MAX_FACTOR_PENALTY * (1.0 - analysis.score);
            for factor in &analysis.factors {
                result.decays.push(DecayDirective {
                    expert_id: analysis.expert_id.clone(),
                    factor: factor.clone(),
                    penalty,
                });
            }
        }
    }

    result
}
