//! Turns raw model output into percentile ranks and attribution columns.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::endpoint::{AttributionResponse, ModelEndpoint, ScoreResponse};
use crate::error::ScoringError;
use crate::matrix::FeatureMatrix;
use crate::models::{
    ActorAggregate, ActorPrediction, EventPrediction, FeaturizedRecord, ScoredTable,
};

pub const DEFAULT_ATTRIBUTION_BATCH_SIZE: usize = 1000;
pub const IMPACT_COLUMN_PREFIX: &str = "model_impact_score_";

/// Reference scores in ascending order with NaNs removed, the form
/// `percentile_of_score` expects.
pub fn sorted_reference(reference: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = reference.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Percentile-of-score over a sorted reference distribution using the
/// "mean" convention: values strictly below count fully, ties count half.
/// `None` when the reference is empty or the score is NaN.
pub fn percentile_of_score(sorted: &[f64], score: f64) -> Option<f64> {
    if sorted.is_empty() || score.is_nan() {
        return None;
    }
    let below = sorted.partition_point(|&v| v < score);
    let at_or_below = sorted.partition_point(|&v| v <= score);
    let ties = at_or_below - below;
    Some((below as f64 + 0.5 * ties as f64) / sorted.len() as f64 * 100.0)
}

/// Percentiles for many scores against one reference, sorting it once.
pub fn percentiles(reference: &[f64], scores: &[f64]) -> Vec<Option<f64>> {
    let sorted = sorted_reference(reference);
    scores
        .iter()
        .map(|&score| percentile_of_score(&sorted, score))
        .collect()
}

pub fn confidence_rank(percentile: Option<f64>) -> Option<f64> {
    percentile.map(|p| 100.0 - p)
}

/// Sign-inverted attribution values aligned to the model input rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributions {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Attributions {
    pub fn empty(features: &[String]) -> Self {
        Self {
            columns: impact_columns(features),
            rows: Vec::new(),
        }
    }

    fn append(&mut self, mut other: Attributions) {
        self.rows.append(&mut other.rows);
    }
}

pub fn impact_columns(features: &[String]) -> Vec<String> {
    features
        .iter()
        .map(|f| format!("{IMPACT_COLUMN_PREFIX}{f}"))
        .collect()
}

/// Picks each input feature's values out of an explainer response (keyed by
/// bare or `model_impact_score_`-prefixed name), checks the row count and
/// negates every value so that positive means "pushes towards anomalous".
pub fn align_attributions(
    mut response: AttributionResponse,
    features: &[String],
    expected_rows: usize,
) -> Result<Attributions, ScoringError> {
    let mut per_feature = Vec::with_capacity(features.len());
    for feature in features {
        let values = response
            .remove(feature)
            .or_else(|| response.remove(&format!("{IMPACT_COLUMN_PREFIX}{feature}")))
            .ok_or_else(|| ScoringError::MissingFeature(feature.clone()))?
            .into_vec();

        if values.len() != expected_rows {
            return Err(ScoringError::RowCountMismatch {
                what: format!("attributions for `{feature}`"),
                expected: expected_rows,
                actual: values.len(),
            });
        }
        per_feature.push(values);
    }

    let rows = (0..expected_rows)
        .map(|row| per_feature.iter().map(|values| -values[row]).collect())
        .collect();

    Ok(Attributions {
        columns: impact_columns(features),
        rows,
    })
}

/// Calls the explainer over sub-batches of at most `batch_size` rows with up
/// to `concurrency` requests in flight. Results are reassembled by batch
/// index, so the output matches a single call over the whole input.
pub async fn explain_in_batches(
    endpoint: &dyn ModelEndpoint,
    input: &FeatureMatrix,
    batch_size: usize,
    concurrency: usize,
) -> Result<Attributions, ScoringError> {
    let batches = input.chunks(batch_size);
    debug!(
        endpoint = endpoint.name(),
        rows = input.len(),
        batches = batches.len(),
        "requesting attributions"
    );

    let mut results: Vec<(usize, Result<Attributions, ScoringError>)> =
        stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| async move {
                let result = match endpoint.explain(&batch).await {
                    Ok(response) => align_attributions(response, &batch.columns, batch.len()),
                    Err(err) => Err(err.into()),
                };
                (index, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    results.sort_by_key(|(index, _)| *index);

    let mut attributions = Attributions::empty(&input.columns);
    for (_, result) in results {
        attributions.append(result?);
    }
    Ok(attributions)
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<(), ScoringError> {
    if expected != actual {
        return Err(ScoringError::RowCountMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Event-level table: raw score, its percentile, attribution columns.
pub fn score_events(
    records: Vec<FeaturizedRecord>,
    scores: &ScoreResponse,
    attributions: Attributions,
) -> Result<ScoredTable<EventPrediction>, ScoringError> {
    check_len("predicted scores", records.len(), scores.predicted_decision_scores.len())?;
    check_len("attributions", records.len(), attributions.rows.len())?;

    let ranks = percentiles(&scores.fitted_decision_scores, &scores.predicted_decision_scores);
    let rows = records
        .into_iter()
        .zip(scores.predicted_decision_scores.iter())
        .zip(ranks)
        .zip(attributions.rows)
        .map(|(((record, &raw_score), score_percentile), impacts)| EventPrediction {
            record,
            raw_score,
            score_percentile,
            impacts,
        })
        .collect();

    Ok(ScoredTable {
        impact_columns: attributions.columns,
        rows,
    })
}

/// Actor-level table: raw score, `100 - percentile` as the confidence rank,
/// the scoring time and attribution columns.
pub fn score_actors(
    aggregates: Vec<ActorAggregate>,
    scores: &ScoreResponse,
    attributions: Attributions,
    date_predicted: DateTime<Utc>,
) -> Result<ScoredTable<ActorPrediction>, ScoringError> {
    check_len("predicted scores", aggregates.len(), scores.predicted_decision_scores.len())?;
    check_len("attributions", aggregates.len(), attributions.rows.len())?;

    let ranks = percentiles(&scores.fitted_decision_scores, &scores.predicted_decision_scores);
    let rows = aggregates
        .into_iter()
        .zip(scores.predicted_decision_scores.iter())
        .zip(ranks)
        .zip(attributions.rows)
        .map(|(((aggregate, &raw_score), percentile), impacts)| ActorPrediction {
            aggregate,
            raw_score,
            confidence_rank: confidence_rank(percentile),
            date_predicted,
            impacts,
        })
        .collect();

    Ok(ScoredTable {
        impact_columns: attributions.columns,
        rows,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::endpoint::AttributionValues;
    use crate::error::EndpointError;
    use crate::matrix::EVENT_FEATURES;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Explainer whose attribution for a cell is a pure function of the cell,
    /// so batched and unbatched calls must agree. Later batches answer first.
    pub(crate) struct EchoExplainer {
        pub calls: AtomicUsize,
    }

    impl EchoExplainer {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelEndpoint for EchoExplainer {
        fn name(&self) -> &str {
            "echo-explainer"
        }

        async fn invoke(&self, _input: &FeatureMatrix) -> Result<Vec<u8>, EndpointError> {
            unreachable!("explain is overridden")
        }

        async fn explain(&self, input: &FeatureMatrix) -> Result<AttributionResponse, EndpointError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let first = input.rows.first().and_then(|r| r[0]).unwrap_or(0.0);
            // later batches finish first
            let delay = 40u64.saturating_sub(first as u64 / 100);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            let mut response = HashMap::new();
            for (column, feature) in input.columns.iter().enumerate() {
                let values = input
                    .rows
                    .iter()
                    .map(|row| row[column].unwrap_or(0.0) * 2.0)
                    .collect();
                response.insert(feature.clone(), AttributionValues::List(values));
            }
            Ok(response)
        }
    }

    #[test]
    fn percentile_counts_ties_at_half_weight() {
        let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_of_score(&reference, 3.0), Some(50.0));
        assert_eq!(percentile_of_score(&reference, 0.0), Some(0.0));
        assert_eq!(percentile_of_score(&reference, 9.0), Some(100.0));
        assert_eq!(percentile_of_score(&reference, 3.5), Some(60.0));
        assert_eq!(percentile_of_score(&[2.0, 2.0], 2.0), Some(50.0));
    }

    #[test]
    fn reference_is_sorted_without_nans() {
        let sorted = sorted_reference(&[3.0, f64::NAN, -1.0, 2.0]);
        assert_eq!(sorted, vec![-1.0, 2.0, 3.0]);
        assert_eq!(percentiles(&[3.0, f64::NAN, -1.0, 2.0], &[2.0]), vec![Some(50.0)]);
    }

    #[test]
    fn percentile_is_missing_without_reference() {
        assert_eq!(percentile_of_score(&[], 1.0), None);
        assert_eq!(percentile_of_score(&[1.0], f64::NAN), None);
    }

    #[test]
    fn percentiles_are_monotonic_and_repeatable() {
        let reference = [0.3, -0.1, 0.05, 0.2, 0.2, -0.4, 0.0];
        let scores: Vec<f64> = (-10..=10).map(|i| i as f64 * 0.05).collect();
        let first = percentiles(&reference, &scores);
        assert_eq!(first, percentiles(&reference, &scores));
        for pair in first.windows(2) {
            assert!(pair[0].unwrap() <= pair[1].unwrap());
        }
        let sorted = sorted_reference(&reference);
        for (score, p) in scores.iter().zip(&first) {
            assert_eq!(*p, percentile_of_score(&sorted, *score));
        }
    }

    #[test]
    fn confidence_rank_complements_percentile() {
        let reference = [0.1, 0.4, 0.4, 0.9];
        for score in [0.0, 0.4, 0.5, 1.0] {
            let p = percentile_of_score(&reference, score);
            assert_eq!(confidence_rank(p).unwrap() + p.unwrap(), 100.0);
        }
        assert_eq!(confidence_rank(None), None);
    }

    #[test]
    fn attributions_are_negated_and_renamed() {
        let features: Vec<String> = EVENT_FEATURES.iter().map(|f| f.to_string()).collect();
        let mut response = AttributionResponse::new();
        for (name, values) in [
            ("model_impact_score_elapsed_time", vec![0.5, -0.25]),
            ("distance", vec![1.0, 0.0]),
            ("revision", vec![0.0, 2.0]),
            ("save_and_exit_count", vec![-3.0, 3.0]),
        ] {
            response.insert(name.to_string(), AttributionValues::List(values));
        }

        let aligned = align_attributions(response, &features, 2).unwrap();
        assert_eq!(aligned.columns[0], "model_impact_score_elapsed_time");
        assert_eq!(aligned.rows[0], vec![-0.5, -1.0, 0.0, 3.0]);
        assert_eq!(aligned.rows[1], vec![0.25, 0.0, -2.0, -3.0]);
    }

    #[test]
    fn attribution_gaps_are_errors() {
        let features = vec!["distance".to_string()];
        let err = align_attributions(AttributionResponse::new(), &features, 1).unwrap_err();
        assert!(matches!(err, ScoringError::MissingFeature(f) if f == "distance"));

        let mut response = AttributionResponse::new();
        response.insert("distance".into(), AttributionValues::List(vec![1.0]));
        let err = align_attributions(response, &features, 2).unwrap_err();
        assert!(matches!(err, ScoringError::RowCountMismatch { expected: 2, actual: 1, .. }));
    }

    #[tokio::test]
    async fn batched_attributions_match_a_single_call() {
        let rows: Vec<Vec<Option<f64>>> = (0..3_500)
            .map(|i| {
                let i = i as f64;
                vec![Some(i), Some(i + 0.5), Some(1.0), Some(i * 3.0)]
            })
            .collect();
        let input = FeatureMatrix::new(&EVENT_FEATURES, rows);
        let explainer = EchoExplainer::new();

        let batched = explain_in_batches(&explainer, &input, 1_000, 4).await.unwrap();
        assert_eq!(explainer.calls.load(Ordering::SeqCst), 4);

        let single = explain_in_batches(&explainer, &input, 10_000, 4).await.unwrap();
        assert_eq!(batched, single);
        assert_eq!(batched.rows.len(), 3_500);
        assert_eq!(batched.rows[2_345][0], -4_690.0);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let input = FeatureMatrix::new(&EVENT_FEATURES, vec![]);
        let explainer = EchoExplainer::new();
        let result = explain_in_batches(&explainer, &input, 1_000, 4).await.unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.columns.len(), 4);
        assert_eq!(explainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn actor_scores_use_confidence_rank() {
        let aggregate = ActorAggregate {
            actor_id: 7,
            window_end: None,
            mean_distance: Some(1.0),
            mean_elapsed_time: Some(2.0),
            mean_revision: Some(1.0),
            mean_save_and_exit_count: None,
        };
        let scores = ScoreResponse {
            predicted_decision_scores: vec![3.0],
            fitted_decision_scores: vec![1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let attributions = Attributions {
            columns: vec!["model_impact_score_mean_distance".into()],
            rows: vec![vec![0.2]],
        };
        let now = Utc::now();

        let table = score_actors(vec![aggregate], &scores, attributions, now).unwrap();
        assert_eq!(table.rows[0].confidence_rank, Some(50.0));
        assert_eq!(table.rows[0].date_predicted, now);
        assert_eq!(table.impact_columns, vec!["model_impact_score_mean_distance"]);
    }

    #[test]
    fn score_count_mismatch_is_rejected() {
        let scores = ScoreResponse {
            predicted_decision_scores: vec![0.1, 0.2],
            fitted_decision_scores: vec![0.0],
        };
        let err = score_events(vec![], &scores, Attributions::empty(&[])).unwrap_err();
        assert!(matches!(err, ScoringError::RowCountMismatch { expected: 0, actual: 2, .. }));
    }
}
