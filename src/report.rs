use std::fmt::Write;

use crate::models::{ActorPrediction, EventPrediction};
use crate::pipeline::RunSummary;

const TOP_ROWS: usize = 10;

fn rank_desc<T>(rows: &[T], key: impl Fn(&T) -> Option<f64>) -> Vec<&T> {
    let mut ranked: Vec<&T> = rows.iter().filter(|row| key(*row).is_some()).collect();
    ranked.sort_by(|a, b| {
        key(*b)
            .partial_cmp(&key(*a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

pub fn top_events(rows: &[EventPrediction]) -> Vec<&EventPrediction> {
    rank_desc(rows, |row| row.score_percentile)
}

pub fn top_actors(rows: &[ActorPrediction]) -> Vec<&ActorPrediction> {
    rank_desc(rows, |row| row.confidence_rank)
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn build_report(summary: &RunSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Visit Anomaly Scoring Report");
    let _ = writeln!(
        output,
        "Run started {} ({})",
        summary.started_at.to_rfc3339(),
        if summary.persisted { "appended" } else { "dry run" }
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Run Summary");
    let _ = writeln!(output, "- Raw events pulled: {}", summary.raw_events);
    let _ = writeln!(output, "- Completed visits featurized: {}", summary.featurized);
    let _ = writeln!(
        output,
        "- Event rows scored: {}",
        summary.events.as_ref().map(|t| t.len()).unwrap_or(0)
    );
    let _ = writeln!(
        output,
        "- Persons of interest scored: {}",
        summary.actors.as_ref().map(|t| t.len()).unwrap_or(0)
    );
    for failure in &summary.failures {
        let _ = writeln!(output, "- {} branch FAILED: {:#}", failure.branch, failure.error);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Percentile Events");

    match &summary.events {
        Some(table) if !table.is_empty() => {
            for row in top_events(&table.rows).into_iter().take(TOP_ROWS) {
                let record = &row.record;
                let _ = writeln!(
                    output,
                    "- event {} (visit {}, person {}) percentile {} raw {:.4}: {}s elapsed, {:.0}m away, save #{}",
                    record.event_id,
                    record.entity_uuid,
                    record.actor_id,
                    fmt_opt(row.score_percentile),
                    row.raw_score,
                    record.elapsed_time,
                    record.distance,
                    record.save_and_exit_count
                );
            }
        }
        _ => {
            let _ = writeln!(output, "No events scored in this run.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Confidence Persons of Interest");

    match &summary.actors {
        Some(table) if !table.is_empty() => {
            for row in top_actors(&table.rows).into_iter().take(TOP_ROWS) {
                let aggregate = &row.aggregate;
                let _ = writeln!(
                    output,
                    "- person {} confidence rank {} raw {:.4}: mean {}s elapsed, mean {}m away",
                    aggregate.actor_id,
                    fmt_opt(row.confidence_rank),
                    row.raw_score,
                    fmt_opt(aggregate.mean_elapsed_time),
                    fmt_opt(aggregate.mean_distance)
                );
            }
        }
        _ => {
            let _ = writeln!(output, "No persons of interest scored in this run.");
        }
    }

    output
}
