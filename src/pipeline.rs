//! One scoring run: pull, featurize, score both targets, append.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::aggregate::snapshot_means;
use crate::db::{EventSource, ScoreSink};
use crate::endpoint::{ModelEndpoint, ScoreResponse};
use crate::featurize::featurize;
use crate::matrix::FeatureMatrix;
use crate::models::{ActorPrediction, EventPrediction, FeaturizedRecord, ScoredTable};
use crate::scoring::{self, explain_in_batches, Attributions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Event,
    PersonOfInterest,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Event => write!(f, "event"),
            Branch::PersonOfInterest => write!(f, "person_of_interest"),
        }
    }
}

/// Scorer and explainer for one classification target.
#[derive(Clone)]
pub struct ModelPair {
    pub scorer: Arc<dyn ModelEndpoint>,
    pub explainer: Arc<dyn ModelEndpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringOptions {
    pub attribution_batch_size: usize,
    pub max_concurrency: usize,
}

#[derive(Debug)]
pub struct BranchFailure {
    pub branch: Branch,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub raw_events: usize,
    pub featurized: usize,
    pub events: Option<ScoredTable<EventPrediction>>,
    pub actors: Option<ScoredTable<ActorPrediction>>,
    pub persisted: bool,
    pub failures: Vec<BranchFailure>,
}

impl RunSummary {
    /// Turns branch failures into the run's error once everything that could
    /// be persisted has been.
    pub fn ensure_complete(&self) -> anyhow::Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let detail: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{} branch: {:#}", f.branch, f.error))
            .collect();
        anyhow::bail!("scoring run incomplete: {}", detail.join("; "))
    }
}

pub struct Pipeline {
    event_models: ModelPair,
    actor_models: ModelPair,
    options: ScoringOptions,
}

impl Pipeline {
    pub fn new(event_models: ModelPair, actor_models: ModelPair, options: ScoringOptions) -> Self {
        Self {
            event_models,
            actor_models,
            options,
        }
    }

    /// Runs both branches over events from the trailing `lookback` interval.
    /// A failing branch does not stop the other; source and sink errors end
    /// the run. Nothing is written when `persist` is false.
    pub async fn run<S>(
        &self,
        store: &mut S,
        lookback: &str,
        persist: bool,
    ) -> anyhow::Result<RunSummary>
    where
        S: EventSource + ScoreSink,
    {
        let started_at = Utc::now();
        let raw = store.fetch_events(Some(lookback)).await?;
        let records = featurize(&raw);
        info!(raw_events = raw.len(), records = records.len(), "featurized visit events");

        let mut summary = RunSummary {
            started_at,
            raw_events: raw.len(),
            featurized: records.len(),
            events: None,
            actors: None,
            persisted: persist,
            failures: Vec::new(),
        };

        match self.event_predictions(records.clone()).await {
            Ok(table) => summary.events = Some(table),
            Err(error) => {
                error!(branch = %Branch::Event, error = ?error, "branch failed");
                summary.failures.push(BranchFailure {
                    branch: Branch::Event,
                    error,
                });
            }
        }

        match self.actor_predictions(&records, started_at).await {
            Ok(table) => summary.actors = Some(table),
            Err(error) => {
                error!(branch = %Branch::PersonOfInterest, error = ?error, "branch failed");
                summary.failures.push(BranchFailure {
                    branch: Branch::PersonOfInterest,
                    error,
                });
            }
        }

        if persist {
            if let Some(table) = &summary.events {
                store.append_event_predictions(table).await?;
            }
            if let Some(table) = &summary.actors {
                store.append_actor_predictions(table).await?;
            }
        }

        Ok(summary)
    }

    pub async fn event_predictions(
        &self,
        records: Vec<FeaturizedRecord>,
    ) -> anyhow::Result<ScoredTable<EventPrediction>> {
        let input = FeatureMatrix::for_events(&records);
        let (scores, attributions) = self.score(&self.event_models, &input).await?;
        let table = scoring::score_events(records, &scores, attributions)?;
        info!(rows = table.len(), "scored events");
        Ok(table)
    }

    pub async fn actor_predictions(
        &self,
        records: &[FeaturizedRecord],
        date_predicted: DateTime<Utc>,
    ) -> anyhow::Result<ScoredTable<ActorPrediction>> {
        let aggregates = snapshot_means(records);
        let input = FeatureMatrix::for_actors(&aggregates);
        let (scores, attributions) = self.score(&self.actor_models, &input).await?;
        let table = scoring::score_actors(aggregates, &scores, attributions, date_predicted)?;
        info!(rows = table.len(), "scored persons of interest");
        Ok(table)
    }

    async fn score(
        &self,
        models: &ModelPair,
        input: &FeatureMatrix,
    ) -> anyhow::Result<(ScoreResponse, Attributions)> {
        if input.is_empty() {
            let empty = ScoreResponse {
                predicted_decision_scores: Vec::new(),
                fitted_decision_scores: Vec::new(),
            };
            return Ok((empty, Attributions::empty(&input.columns)));
        }

        let scores = models
            .scorer
            .score(input)
            .await
            .with_context(|| format!("scoring with `{}` failed", models.scorer.name()))?;
        let attributions = explain_in_batches(
            models.explainer.as_ref(),
            input,
            self.options.attribution_batch_size,
            self.options.max_concurrency,
        )
        .await
        .with_context(|| format!("attribution with `{}` failed", models.explainer.name()))?;

        Ok((scores, attributions))
    }
}
