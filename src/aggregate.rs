//! Historical per-actor means over featurized records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::{ActorAggregate, FeaturizedRecord};

pub const DEFAULT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct FeatureSums {
    distance: f64,
    elapsed_time: f64,
    revision: f64,
    save_and_exit_count: f64,
}

impl FeatureSums {
    fn add(&self, record: &FeaturizedRecord) -> Self {
        Self {
            distance: self.distance + record.distance,
            elapsed_time: self.elapsed_time + record.elapsed_time as f64,
            revision: self.revision + f64::from(record.revision),
            save_and_exit_count: self.save_and_exit_count + record.save_and_exit_count as f64,
        }
    }

    fn over(records: &[&FeaturizedRecord]) -> Self {
        records
            .iter()
            .fold(Self::default(), |sums, record| sums.add(record))
    }
}

fn mean(sum: f64, count: usize) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn aggregate_from(
    actor_id: i64,
    window_end: Option<DateTime<Utc>>,
    sums: &FeatureSums,
    count: usize,
) -> ActorAggregate {
    ActorAggregate {
        actor_id,
        window_end,
        mean_distance: mean(sums.distance, count),
        mean_elapsed_time: mean(sums.elapsed_time, count),
        mean_revision: mean(sums.revision, count),
        mean_save_and_exit_count: mean(sums.save_and_exit_count, count),
    }
}

fn group_by_actor(records: &[FeaturizedRecord]) -> BTreeMap<i64, Vec<&FeaturizedRecord>> {
    let mut groups: BTreeMap<i64, Vec<&FeaturizedRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.actor_id).or_default().push(record);
    }
    groups
}

/// One row per input record: the actor's means over every record whose
/// timestamp lies in `[timestamp - window, timestamp]`. Only past and
/// same-instant records contribute. Rows come out grouped by actor, newest
/// first within each actor.
pub fn windowed_means(records: &[FeaturizedRecord], window: Duration) -> Vec<ActorAggregate> {
    let mut output = Vec::with_capacity(records.len());

    for (actor_id, mut group) in group_by_actor(records) {
        group.sort_by_key(|record| record.timestamp);

        let mut actor_rows: Vec<ActorAggregate> = group
            .iter()
            .map(|record| {
                let end = group.partition_point(|r| r.timestamp <= record.timestamp);
                let start_at = record.timestamp - window;
                let start = group.partition_point(|r| r.timestamp < start_at);
                // summed per window, never as a difference of running totals
                let sums = FeatureSums::over(&group[start..end]);
                aggregate_from(actor_id, Some(record.timestamp), &sums, end - start)
            })
            .collect();

        actor_rows.reverse();
        output.extend(actor_rows);
    }

    output
}

/// Exactly one row per actor with means over the actor's whole history.
pub fn snapshot_means(records: &[FeaturizedRecord]) -> Vec<ActorAggregate> {
    group_by_actor(records)
        .into_iter()
        .map(|(actor_id, group)| {
            let sums = FeatureSums::over(&group);
            aggregate_from(actor_id, None, &sums, group.len())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::featurize::tests::base_time;

    fn record(
        actor_id: i64,
        timestamp: DateTime<Utc>,
        elapsed_time: i64,
        distance: f64,
    ) -> FeaturizedRecord {
        FeaturizedRecord {
            event_id: timestamp.timestamp(),
            entity_uuid: format!("visit-{actor_id}"),
            timestamp,
            event: 9,
            event_latitude: Some(0.0),
            event_longitude: Some(0.0),
            altitude: None,
            project_id: None,
            customer_id: None,
            facility_latitude: Some(0.0),
            facility_longitude: Some(0.0),
            revision: 1,
            actor_id,
            elapsed_time,
            distance,
            save_and_exit_count: 1,
        }
    }

    #[test]
    fn windowed_means_use_trailing_seven_days() {
        let t0 = base_time();
        let records = vec![
            record(1, t0, 100, 10.0),
            record(1, t0 + Duration::days(3), 200, 20.0),
            record(1, t0 + Duration::days(7), 300, 30.0),
            record(1, t0 + Duration::days(12), 400, 40.0),
        ];

        let rows = windowed_means(&records, Duration::days(DEFAULT_WINDOW_DAYS));
        assert_eq!(rows.len(), 4);
        // newest first
        assert_eq!(rows[0].window_end, Some(t0 + Duration::days(12)));
        assert_eq!(rows[0].mean_elapsed_time, Some(350.0));
        // window [t0, t0+7d] is closed on both ends
        assert_eq!(rows[1].mean_elapsed_time, Some(200.0));
        assert_eq!(rows[1].mean_distance, Some(20.0));
        assert_eq!(rows[2].mean_elapsed_time, Some(150.0));
        assert_eq!(rows[3].mean_elapsed_time, Some(100.0));
        assert_eq!(rows[3].mean_revision, Some(1.0));
    }

    #[test]
    fn windowed_means_ignore_future_records() {
        let t0 = base_time();
        let mut records = vec![
            record(5, t0, 60, 1.0),
            record(5, t0 + Duration::days(1), 120, 3.0),
        ];
        let before = windowed_means(&records, Duration::days(7));

        records.push(record(5, t0 + Duration::days(2), 9_000, 500.0));
        records.push(record(5, t0 + Duration::days(3), 1, 0.0));
        let after = windowed_means(&records, Duration::days(7));

        let find = |rows: &[ActorAggregate], ts: DateTime<Utc>| {
            rows.iter()
                .find(|row| row.window_end == Some(ts))
                .cloned()
                .unwrap()
        };
        assert_eq!(find(&before, t0), find(&after, t0));
        assert_eq!(
            find(&before, t0 + Duration::days(1)),
            find(&after, t0 + Duration::days(1))
        );
    }

    #[test]
    fn small_window_after_large_history_is_exact() {
        let t0 = base_time();
        let records = vec![
            record(3, t0, 1_000_000_000, 1e9),
            record(3, t0 + Duration::days(30), 1, 0.1),
        ];

        let rows = windowed_means(&records, Duration::days(7));
        assert_eq!(rows[0].window_end, Some(t0 + Duration::days(30)));
        assert_eq!(rows[0].mean_distance, Some(0.1));
        assert_eq!(rows[0].mean_elapsed_time, Some(1.0));
        assert_eq!(rows[1].mean_distance, Some(1e9));
    }

    #[test]
    fn windowed_means_keep_actors_apart() {
        let t0 = base_time();
        let records = vec![record(1, t0, 10, 0.0), record(2, t0, 30, 0.0)];
        let rows = windowed_means(&records, Duration::days(7));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].actor_id, 1);
        assert_eq!(rows[0].mean_elapsed_time, Some(10.0));
        assert_eq!(rows[1].mean_elapsed_time, Some(30.0));
    }

    #[test]
    fn empty_window_is_missing_not_zero() {
        let row = aggregate_from(9, None, &FeatureSums::default(), 0);
        assert_eq!(row.mean_distance, None);
        assert_eq!(row.mean_elapsed_time, None);
        assert_eq!(row.mean_revision, None);
        assert_eq!(row.mean_save_and_exit_count, None);
    }

    #[test]
    fn snapshot_has_one_row_per_actor() {
        let t0 = base_time();
        let records = vec![
            record(1, t0, 10, 2.0),
            record(2, t0, 50, 8.0),
            record(1, t0 + Duration::days(40), 30, 4.0),
        ];

        let rows = snapshot_means(&records);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].actor_id, 1);
        assert_eq!(rows[0].window_end, None);
        assert_eq!(rows[0].mean_elapsed_time, Some(20.0));
        assert_eq!(rows[0].mean_distance, Some(3.0));
        assert_eq!(rows[1].mean_elapsed_time, Some(50.0));
    }
}
