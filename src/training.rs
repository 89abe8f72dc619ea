//! Offline data preparation: model training CSVs and CSV featurization.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Duration;
use tracing::info;

use crate::aggregate::windowed_means;
use crate::db::EventSource;
use crate::featurize::featurize;
use crate::matrix::FeatureMatrix;
use crate::models::{FeaturizedRecord, RawEvent};

pub const EVENT_TRAINING_FILE: &str = "event_training_data.csv";
pub const ACTOR_TRAINING_FILE: &str = "person_of_interest_training_data.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingFiles {
    pub event_path: PathBuf,
    pub event_rows: usize,
    pub actor_path: PathBuf,
    pub actor_rows: usize,
}

/// Pulls the full event history and writes both training sets.
pub async fn export<S: EventSource>(
    source: &mut S,
    out_dir: &Path,
    window: Duration,
) -> anyhow::Result<TrainingFiles> {
    let raw = source.fetch_events(None).await?;
    let records = featurize(&raw);
    write_training_data(&records, out_dir, window)
}

/// Event set: the four per-visit features. Person-of-interest set: trailing
/// window means, one row per visit, blank where a mean is missing.
pub fn write_training_data(
    records: &[FeaturizedRecord],
    out_dir: &Path,
    window: Duration,
) -> anyhow::Result<TrainingFiles> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let event_matrix = FeatureMatrix::for_events(records);
    let event_path = out_dir.join(EVENT_TRAINING_FILE);
    write_matrix(&event_matrix, &event_path)?;

    let actor_matrix = FeatureMatrix::for_actors(&windowed_means(records, window));
    let actor_path = out_dir.join(ACTOR_TRAINING_FILE);
    write_matrix(&actor_matrix, &actor_path)?;

    info!(
        event_rows = event_matrix.len(),
        actor_rows = actor_matrix.len(),
        dir = %out_dir.display(),
        "wrote training data"
    );

    Ok(TrainingFiles {
        event_path,
        event_rows: event_matrix.len(),
        actor_path,
        actor_rows: actor_matrix.len(),
    })
}

fn write_matrix(matrix: &FeatureMatrix, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    matrix
        .write_csv(file, true)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Featurizes a CSV export of raw events (one row per event, with a header
/// naming the raw event fields) and writes the featurized records as CSV.
pub fn featurize_csv(input: &Path, output: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let mut events = Vec::new();
    for (line, result) in reader.deserialize::<RawEvent>().enumerate() {
        let event = result.with_context(|| format!("invalid event on data row {}", line + 1))?;
        events.push(event);
    }

    let records = featurize(&events);
    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    for record in &records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{two_visits, MemoryStore};

    #[tokio::test]
    async fn export_reads_full_history_and_writes_both_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore {
            events: two_visits(),
            ..Default::default()
        };

        let files = export(&mut store, dir.path(), Duration::days(7)).await.unwrap();
        assert_eq!(store.lookbacks, vec![None]);
        assert_eq!(files.event_rows, 3);
        assert_eq!(files.actor_rows, 3);

        let events = std::fs::read_to_string(&files.event_path).unwrap();
        let mut lines = events.lines();
        assert_eq!(
            lines.next(),
            Some("elapsed_time,distance,revision,save_and_exit_count")
        );
        assert!(lines.next().unwrap().starts_with("120,"));

        let actors = std::fs::read_to_string(&files.actor_path).unwrap();
        assert!(actors.starts_with(
            "mean_distance,mean_elapsed_time,mean_revision,mean_save_and_exit_count\n"
        ));
        assert_eq!(actors.lines().count(), 4);
    }

    #[test]
    fn featurize_csv_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("events.csv");
        let output = dir.path().join("features.csv");

        let mut writer = csv::Writer::from_path(&input).unwrap();
        for event in two_visits() {
            writer.serialize(event).unwrap();
        }
        writer.flush().unwrap();

        let count = featurize_csv(&input, &output).unwrap();
        assert_eq!(count, 3);

        let mut reader = csv::Reader::from_path(&output).unwrap();
        let records: Vec<FeaturizedRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(records[0].elapsed_time, 120);
        assert_eq!(records[1].save_and_exit_count, 2);
        assert_eq!(records[2].actor_id, 77);
    }
}
