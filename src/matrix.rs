//! Model input matrices for the two classification targets.

use crate::error::EndpointError;
use crate::models::{ActorAggregate, FeaturizedRecord};

pub const EVENT_FEATURES: [&str; 4] = [
    "elapsed_time",
    "distance",
    "revision",
    "save_and_exit_count",
];

pub const ACTOR_FEATURES: [&str; 4] = [
    "mean_distance",
    "mean_elapsed_time",
    "mean_revision",
    "mean_save_and_exit_count",
];

/// Row-major feature values. A `None` cell is a missing value and is
/// written as an empty CSV field.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<f64>>>,
}

impl FeatureMatrix {
    pub fn new(columns: &[&str], rows: Vec<Vec<Option<f64>>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn for_events(records: &[FeaturizedRecord]) -> Self {
        let rows = records
            .iter()
            .map(|r| {
                vec![
                    Some(r.elapsed_time as f64),
                    Some(r.distance),
                    Some(f64::from(r.revision)),
                    Some(r.save_and_exit_count as f64),
                ]
            })
            .collect();
        Self::new(&EVENT_FEATURES, rows)
    }

    pub fn for_actors(aggregates: &[ActorAggregate]) -> Self {
        let rows = aggregates
            .iter()
            .map(|a| {
                vec![
                    a.mean_distance,
                    a.mean_elapsed_time,
                    a.mean_revision,
                    a.mean_save_and_exit_count,
                ]
            })
            .collect();
        Self::new(&ACTOR_FEATURES, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits into consecutive sub-matrices of at most `size` rows.
    pub fn chunks(&self, size: usize) -> Vec<FeatureMatrix> {
        self.rows
            .chunks(size.max(1))
            .map(|rows| FeatureMatrix {
                columns: self.columns.clone(),
                rows: rows.to_vec(),
            })
            .collect()
    }

    pub fn write_csv<W: std::io::Write>(
        &self,
        writer: W,
        with_header: bool,
    ) -> Result<(), csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);

        if with_header {
            writer.write_record(&self.columns)?;
        }
        for row in &self.rows {
            writer.write_record(
                row.iter()
                    .map(|cell| cell.map(|v| v.to_string()).unwrap_or_default()),
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Headerless CSV body as sent to the model endpoints.
    pub fn to_csv_body(&self) -> Result<Vec<u8>, EndpointError> {
        let mut body = Vec::new();
        self.write_csv(&mut body, false)
            .map_err(|e| EndpointError::Encode(e.to_string()))?;
        Ok(body)
    }
}
