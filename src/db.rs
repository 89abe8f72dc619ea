use anyhow::Context;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{ActorPrediction, EventPrediction, EventType, RawEvent, ScoredTable};
use crate::secrets::DbCredentials;

/// Rows per INSERT statement; keeps bind parameters well under the
/// Postgres limit of 65535.
const INSERT_CHUNK_ROWS: usize = 1000;

const EVENT_QUERY: &str = r#"
    SELECT h.id::bigint AS event_id,
           h.facility_uuid::text AS entity_uuid,
           h."timestamp"::timestamptz AS "timestamp",
           h."event"::int AS event,
           h.latitude::float8 AS event_latitude,
           h.longitude::float8 AS event_longitude,
           h.altitude::float8 AS altitude,
           v.project_id::bigint AS project_id,
           p.customer_id::bigint AS customer_id,
           v.latitude::float8 AS facility_latitude,
           v.longitude::float8 AS facility_longitude,
           v.revision::int AS revision,
           v.person_of_interest_id::bigint AS actor_id
    FROM custom h
    JOIN visit v ON v.uid = h.facility_uuid
    JOIN usr u ON v.person_of_interest_id = u.id
    JOIN project p ON p.id = v.project_id
    WHERE h."event" = ANY($1)
    "#;

const EVENT_COLUMNS: [&str; 18] = [
    "event_id",
    "entity_uuid",
    "timestamp",
    "event",
    "event_latitude",
    "event_longitude",
    "altitude",
    "project_id",
    "customer_id",
    "facility_latitude",
    "facility_longitude",
    "revision",
    "actor_id",
    "elapsed_time",
    "distance",
    "save_and_exit_count",
    "raw_score",
    "score_percentile",
];

const ACTOR_COLUMNS: [&str; 8] = [
    "actor_id",
    "mean_elapsed_time",
    "mean_distance",
    "mean_revision",
    "mean_save_and_exit_count",
    "raw_score",
    "confidence_rank",
    "date_predicted",
];

/// Where raw visit events come from.
#[async_trait]
pub trait EventSource: Send {
    /// START/END events, newest first. `lookback` is a Postgres interval
    /// literal such as `7 day`; `None` reads the full history.
    async fn fetch_events(&mut self, lookback: Option<&str>) -> anyhow::Result<Vec<RawEvent>>;
}

/// Append-only destination for scored tables. Each call writes all rows of
/// one table or none of them.
#[async_trait]
pub trait ScoreSink: Send {
    async fn append_event_predictions(
        &mut self,
        table: &ScoredTable<EventPrediction>,
    ) -> anyhow::Result<u64>;

    async fn append_actor_predictions(
        &mut self,
        table: &ScoredTable<ActorPrediction>,
    ) -> anyhow::Result<u64>;
}

/// One Postgres connection used for both reading and writing during a run.
pub struct PgStore {
    conn: PgConnection,
    schema: String,
    event_table: String,
    actor_table: String,
}

impl PgStore {
    pub async fn connect(credentials: &DbCredentials, config: &Config) -> anyhow::Result<Self> {
        let conn = PgConnection::connect_with(&credentials.connect_options())
            .await
            .with_context(|| format!("failed to connect to Postgres at {}", credentials.host))?;

        Ok(Self {
            conn,
            schema: config.schema.clone(),
            event_table: config.event_predicted_table.clone(),
            actor_table: config.actor_predicted_table.clone(),
        })
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.conn.close().await?;
        Ok(())
    }

    /// Closes the connection once `outcome` is known and reports it first.
    pub async fn close_after<T>(self, outcome: anyhow::Result<T>) -> anyhow::Result<T> {
        let closed = self.close().await;
        settle(outcome, closed)
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn insert_prefix(table: &str, columns: &[&str], impact_columns: &[String]) -> String {
    let names: Vec<String> = columns
        .iter()
        .copied()
        .chain(impact_columns.iter().map(String::as_str))
        .map(quote_ident)
        .collect();
    format!("INSERT INTO {table} ({}) ", names.join(", "))
}

pub fn event_query(lookback: Option<&str>) -> String {
    let mut query = String::from(EVENT_QUERY);
    if lookback.is_some() {
        query.push_str(r#"AND h."timestamp" > now() - $2::interval "#);
    }
    query.push_str(r#"ORDER BY h."timestamp" DESC"#);
    query
}

#[async_trait]
impl EventSource for PgStore {
    async fn fetch_events(&mut self, lookback: Option<&str>) -> anyhow::Result<Vec<RawEvent>> {
        let query = event_query(lookback);
        let mut rows = sqlx::query_as::<_, RawEvent>(&query)
            .bind(vec![EventType::Start.code(), EventType::End.code()]);
        if let Some(interval) = lookback {
            rows = rows.bind(interval);
        }

        let events = rows
            .fetch_all(&mut self.conn)
            .await
            .context("failed to fetch visit events")?;
        info!(rows = events.len(), lookback = lookback.unwrap_or("all"), "pulled visit events");
        Ok(events)
    }
}

#[async_trait]
impl ScoreSink for PgStore {
    async fn append_event_predictions(
        &mut self,
        table: &ScoredTable<EventPrediction>,
    ) -> anyhow::Result<u64> {
        if table.is_empty() {
            return Ok(0);
        }
        let target = self.qualified(&self.event_table);
        let prefix = insert_prefix(&target, &EVENT_COLUMNS, &table.impact_columns);

        let mut tx = self.conn.begin().await?;
        let mut inserted = 0u64;
        for chunk in table.rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(&prefix);
            builder.push_values(chunk, |mut row, prediction| {
                let record = &prediction.record;
                row.push_bind(record.event_id)
                    .push_bind(record.entity_uuid.clone())
                    .push_bind(record.timestamp)
                    .push_bind(record.event)
                    .push_bind(record.event_latitude)
                    .push_bind(record.event_longitude)
                    .push_bind(record.altitude)
                    .push_bind(record.project_id)
                    .push_bind(record.customer_id)
                    .push_bind(record.facility_latitude)
                    .push_bind(record.facility_longitude)
                    .push_bind(record.revision)
                    .push_bind(record.actor_id)
                    .push_bind(record.elapsed_time)
                    .push_bind(record.distance)
                    .push_bind(record.save_and_exit_count)
                    .push_bind(prediction.raw_score)
                    .push_bind(prediction.score_percentile);
                for impact in &prediction.impacts {
                    row.push_bind(*impact);
                }
            });
            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to append to {target}"))?
                .rows_affected();
        }
        tx.commit().await?;

        info!(table = %target, rows = inserted, "appended event predictions");
        Ok(inserted)
    }

    async fn append_actor_predictions(
        &mut self,
        table: &ScoredTable<ActorPrediction>,
    ) -> anyhow::Result<u64> {
        if table.is_empty() {
            return Ok(0);
        }
        let target = self.qualified(&self.actor_table);
        let prefix = insert_prefix(&target, &ACTOR_COLUMNS, &table.impact_columns);

        let mut tx = self.conn.begin().await?;
        let mut inserted = 0u64;
        for chunk in table.rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(&prefix);
            builder.push_values(chunk, |mut row, prediction| {
                let aggregate = &prediction.aggregate;
                row.push_bind(aggregate.actor_id)
                    .push_bind(aggregate.mean_elapsed_time)
                    .push_bind(aggregate.mean_distance)
                    .push_bind(aggregate.mean_revision)
                    .push_bind(aggregate.mean_save_and_exit_count)
                    .push_bind(prediction.raw_score)
                    .push_bind(prediction.confidence_rank)
                    .push_bind(prediction.date_predicted);
                for impact in &prediction.impacts {
                    row.push_bind(*impact);
                }
            });
            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to append to {target}"))?
                .rows_affected();
        }
        tx.commit().await?;

        info!(table = %target, rows = inserted, "appended person of interest predictions");
        Ok(inserted)
    }
}

/// A failed run keeps its own error; a failed close is only logged then.
fn settle<T>(outcome: anyhow::Result<T>, closed: anyhow::Result<()>) -> anyhow::Result<T> {
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err.context("failed to close Postgres connection")),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = ?close_err, "failed to close Postgres connection");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_outranks_close_error() {
        let err = settle::<()>(
            Err(anyhow::anyhow!("sink rejected rows")),
            Err(anyhow::anyhow!("connection reset")),
        )
        .unwrap_err();
        assert_eq!(format!("{err:#}"), "sink rejected rows");

        let err = settle(Ok(3), Err(anyhow::anyhow!("connection reset"))).unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            "failed to close Postgres connection: connection reset"
        );
        assert_eq!(settle(Ok(3), Ok(())).unwrap(), 3);
    }

    #[test]
    fn query_filters_by_lookback_only_when_given() {
        let windowed = event_query(Some("7 day"));
        assert!(windowed.contains("$2::interval"));
        assert!(windowed.trim_end().ends_with(r#"ORDER BY h."timestamp" DESC"#));

        let full = event_query(None);
        assert!(!full.contains("$2"));
        assert!(full.contains("JOIN project p ON p.id = v.project_id"));
    }

    #[test]
    fn insert_prefix_quotes_every_column() {
        let prefix = insert_prefix(
            "\"public\".\"person_of_interest_predicted\"",
            &ACTOR_COLUMNS[..2],
            &["model_impact_score_mean_distance".to_string()],
        );
        assert_eq!(
            prefix,
            "INSERT INTO \"public\".\"person_of_interest_predicted\" \
             (\"actor_id\", \"mean_elapsed_time\", \"model_impact_score_mean_distance\") "
        );
    }

    #[test]
    fn identifiers_escape_quotes() {
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
