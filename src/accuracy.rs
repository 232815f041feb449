//! Step 1: accuracy analysis
//!
//! Compares every predicted category against the realized outcome
//! through the fixed category->extractor mapping. Categorical
//! categories score exact-match 1.0/0.0; numeric categories score
//! `max(0, 1 - |predicted - actual| / scale)` with a per-category
//! scale. Unknown categories are an error, not a no-op: a new
//! category added upstream must be taught to this module before any
//! forecast naming it can reconcile.

use anyhow::{anyhow, Result};

use crate::types::{AccuracyAnalysis, Category, CategoryValue, EventOutcome, ExpertForecast};

/// |confidence - accuracy| below this counts as well-calibrated.
pub const CALIBRATION_TOLERANCE: f64 = 0.3;

/// Stated confidence assumed when an expert omitted one for a category.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Extract the realized value for a category from a final outcome.
pub fn extract_actual(outcome: &EventOutcome, category: Category) -> Result<CategoryValue> {
    match category {
        Category::Winner => Ok(CategoryValue::Categorical(
            outcome.winner().unwrap_or("draw").to_string(),
        )),
        Category::Margin => outcome
            .margin()
            .map(CategoryValue::Numeric)
            .ok_or_else(|| anyhow!("event {} has no final scores", outcome.id)),
        Category::Total => outcome
            .total()
            .map(CategoryValue::Numeric)
            .ok_or_else(|| anyhow!("event {} has no final scores", outcome.id)),
    }
}

fn score_categorical(predicted: &str, actual: &str) -> f64 {
    if predicted == actual {
        1.0
    } else {
        0.0
    }
}

fn score_numeric(predicted: f64, actual: f64, scale: f64) -> f64 {
    (1.0 - (predicted - actual).abs() / scale).max(0.0)
}

/// Analyze one expert's forecast against the outcome, one result per
/// predicted category.
pub fn analyze_forecast(
    outcome: &EventOutcome,
    forecast: &ExpertForecast,
) -> Result<Vec<AccuracyAnalysis>> {
    let mut analyses = Vec::with_capacity(forecast.predictions.len());

    // Deterministic order regardless of map iteration
    let mut categories: Vec<&String> = forecast.predictions.keys().collect();
    categories.sort();

    for name in categories {
        let predicted = &forecast.predictions[name];
        let category = Category::parse(name)
            .ok_or_else(|| anyhow!("unknown forecast category '{}'", name))?;
        let actual = extract_actual(outcome, category)?;

        let (score, error) = match (predicted, &actual) {
            (CategoryValue::Categorical(p), CategoryValue::Categorical(a)) => {
                let score = score_categorical(p, a);
                (score, 1.0 - score)
            }
            (CategoryValue::Numeric(p), CategoryValue::Numeric(a)) => {
                let scale = category
                    .scale()
                    .ok_or_else(|| anyhow!("category '{}' has no numeric scale", name))?;
                (score_numeric(*p, *a, scale), p - a)
            }
            _ => {
                return Err(anyhow!(
                    "category '{}' prediction kind does not match its extractor",
                    name
                ))
            }
        };

        let confidence = forecast
            .confidence
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE);

        analyses.push(AccuracyAnalysis {
            expert_id: forecast.expert_id.clone(),
            category: name.clone(),
            predicted: predicted.clone(),
            actual,
            score,
            calibrated: (confidence - score).abs() < CALIBRATION_TOLERANCE,
            factors: forecast.reasoning_factors.clone(),
            error,
        });
    }

    Ok(analyses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventStatus;
    use chrono::Utc;
    use std::collections::HashMap;

    fn outcome(home: f64, away: f64) -> EventOutcome {
        EventOutcome {
            id: "evt-1".into(),
            home_entity: "lakers".into(),
            away_entity: "celtics".into(),
            home_score: Some(home),
            away_score: Some(away),
            event_date: Utc::now(),
            status: EventStatus::Final,
            final_stats: serde_json::json!({}),
            reconciled: false,
            reconciled_at: None,
        }
    }

    fn forecast(predictions: Vec<(&str, CategoryValue)>, confidence: Vec<(&str, f64)>) -> ExpertForecast {
        ExpertForecast {
            id: "f-1".into(),
            expert_id: "expert-a".into(),
            event_id: "evt-1".into(),
            predictions: predictions
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            confidence: confidence
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<HashMap<_, _>>(),
            reasoning_factors: vec!["home-field advantage".into()],
        }
    }

    #[test]
    fn test_categorical_exact_match() {
        let o = outcome(110.0, 98.0);
        let f = forecast(
            vec![("winner", CategoryValue::Categorical("lakers".into()))],
            vec![("winner", 0.85)],
        );
        let a = &analyze_forecast(&o, &f).unwrap()[0];
        assert_eq!(a.score, 1.0);
        assert_eq!(a.error, 0.0);
        assert!(a.calibrated); // |0.85 - 1.0| < 0.3

        let f = forecast(
            vec![("winner", CategoryValue::Categorical("celtics".into()))],
            vec![("winner", 0.85)],
        );
        let a = &analyze_forecast(&o, &f).unwrap()[0];
        assert_eq!(a.score, 0.0);
        assert_eq!(a.error, 1.0);
        assert!(!a.calibrated); // confidently wrong
    }

    #[test]
    fn test_numeric_scoring() {
        // Actual margin 12, predicted 8: score = 1 - 4/50 = 0.92
        let o = outcome(110.0, 98.0);
        let f = forecast(
            vec![("margin", CategoryValue::Numeric(8.0))],
            vec![("margin", 0.7)],
        );
        let a = &analyze_forecast(&o, &f).unwrap()[0];
        assert!((a.score - 0.92).abs() < 1e-9);
        assert_eq!(a.error, -4.0);
        assert!(a.calibrated);
    }

    #[test]
    fn test_numeric_score_floors_at_zero() {
        // Predicted margin 80 vs actual 12: raw 1 - 68/50 < 0
        let o = outcome(110.0, 98.0);
        let f = forecast(vec![("margin", CategoryValue::Numeric(80.0))], vec![]);
        let a = &analyze_forecast(&o, &f).unwrap()[0];
        assert_eq!(a.score, 0.0);
    }

    #[test]
    fn test_scores_always_in_unit_interval() {
        let o = outcome(110.0, 98.0);
        for predicted in [-500.0, -12.0, 0.0, 12.0, 208.0, 500.0] {
            let f = forecast(
                vec![
                    ("margin", CategoryValue::Numeric(predicted)),
                    ("total", CategoryValue::Numeric(predicted)),
                ],
                vec![],
            );
            for a in analyze_forecast(&o, &f).unwrap() {
                assert!(a.score >= 0.0 && a.score <= 1.0, "score {} out of range", a.score);
            }
        }
    }

    #[test]
    fn test_unknown_category_fails_loudly() {
        let o = outcome(110.0, 98.0);
        let f = forecast(
            vec![("possession_time", CategoryValue::Numeric(30.0))],
            vec![],
        );
        let err = analyze_forecast(&o, &f).unwrap_err();
        assert!(err.to_string().contains("possession_time"));
    }

    #[test]
    fn test_kind_mismatch_fails() {
        let o = outcome(110.0, 98.0);
        let f = forecast(
            vec![("margin", CategoryValue::Categorical("big".into()))],
            vec![],
        );
        assert!(analyze_forecast(&o, &f).is_err());
    }

    #[test]
    fn test_draw_winner_extraction() {
        let o = outcome(100.0, 100.0);
        let actual = extract_actual(&o, Category::Winner).unwrap();
        assert_eq!(actual, CategoryValue::Categorical("draw".into()));
    }

    #[test]
    fn test_missing_confidence_defaults_to_midpoint() {
        let o = outcome(110.0, 98.0);
        let f = forecast(vec![("winner", CategoryValue::Categorical("lakers".into()))], vec![]);
        let a = &analyze_forecast(&o, &f).unwrap()[0];
        // score 1.0 vs assumed 0.5: |0.5| >= 0.3, not calibrated
        assert!(!a.calibrated);
    }
}
