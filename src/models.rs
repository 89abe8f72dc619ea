use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event code recorded when a visit form is opened.
pub const START_EVENT_CODE: i32 = 13;
/// Event code recorded on "save and exit".
pub const END_EVENT_CODE: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Start,
    End,
    Other(i32),
}

impl EventType {
    pub fn from_code(code: i32) -> Self {
        match code {
            START_EVENT_CODE => EventType::Start,
            END_EVENT_CODE => EventType::End,
            other => EventType::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            EventType::Start => START_EVENT_CODE,
            EventType::End => END_EVENT_CODE,
            EventType::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawEvent {
    pub event_id: i64,
    pub entity_uuid: String,
    pub timestamp: DateTime<Utc>,
    pub event: i32,
    pub event_latitude: Option<f64>,
    pub event_longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub project_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub facility_latitude: Option<f64>,
    pub facility_longitude: Option<f64>,
    pub revision: i32,
    pub actor_id: i64,
}

impl RawEvent {
    pub fn event_type(&self) -> EventType {
        EventType::from_code(self.event)
    }
}

/// One completed START -> END pair, carrying the END row's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturizedRecord {
    pub event_id: i64,
    pub entity_uuid: String,
    pub timestamp: DateTime<Utc>,
    pub event: i32,
    pub event_latitude: Option<f64>,
    pub event_longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub project_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub facility_latitude: Option<f64>,
    pub facility_longitude: Option<f64>,
    pub revision: i32,
    pub actor_id: i64,
    pub elapsed_time: i64,
    pub distance: f64,
    pub save_and_exit_count: i64,
}

/// Per-actor means. `window_end` is set for trailing-window rows and empty
/// for whole-history snapshots. A mean is `None` when nothing qualified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorAggregate {
    pub actor_id: i64,
    pub window_end: Option<DateTime<Utc>>,
    pub mean_distance: Option<f64>,
    pub mean_elapsed_time: Option<f64>,
    pub mean_revision: Option<f64>,
    pub mean_save_and_exit_count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPrediction {
    pub record: FeaturizedRecord,
    pub raw_score: f64,
    pub score_percentile: Option<f64>,
    pub impacts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActorPrediction {
    pub aggregate: ActorAggregate,
    pub raw_score: f64,
    pub confidence_rank: Option<f64>,
    pub date_predicted: DateTime<Utc>,
    pub impacts: Vec<f64>,
}

/// Scored rows plus the attribution column names shared by every row;
/// `rows[i].impacts[j]` belongs to `impact_columns[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTable<T> {
    pub impact_columns: Vec<String>,
    pub rows: Vec<T>,
}

impl<T> ScoredTable<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
