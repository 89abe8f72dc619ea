//! Pairs START/END events per entity and derives elapsed time, distance and
//! the running save-and-exit count.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::FeatureError;
use crate::models::{EventType, FeaturizedRecord, RawEvent};

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance in meters between two `(latitude, longitude)` points
/// given in degrees.
pub fn haversine_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Featurizes every entity group independently. A group that fails is
/// dropped as a whole and logged; the others are unaffected.
pub fn featurize(events: &[RawEvent]) -> Vec<FeaturizedRecord> {
    let mut groups: BTreeMap<&str, Vec<&RawEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.entity_uuid.as_str()).or_default().push(event);
    }

    let mut records = Vec::new();
    let mut excluded = 0usize;

    for (entity_uuid, group) in groups {
        match featurize_group(group) {
            Ok(mut group_records) => records.append(&mut group_records),
            Err(err) => {
                excluded += 1;
                warn!(entity_uuid, error = %err, "excluding entity from featurization");
            }
        }
    }

    debug!(records = records.len(), excluded, "featurization finished");
    records
}

/// Walks one entity's events in time order. Events sharing a timestamp are
/// ordered START before END.
pub fn featurize_group(mut events: Vec<&RawEvent>) -> Result<Vec<FeaturizedRecord>, FeatureError> {
    events.sort_by_key(|event| (event.timestamp, pairing_order(event.event_type())));

    let mut open_start = None;
    let mut pairs = 0i64;
    let mut records = Vec::new();

    for event in events {
        match event.event_type() {
            EventType::Start => open_start = Some(event.timestamp),
            EventType::End => {
                let Some(started_at) = open_start.take() else {
                    warn!(
                        entity_uuid = %event.entity_uuid,
                        event_id = event.event_id,
                        "skipping END event without an open START"
                    );
                    continue;
                };

                let event_point = coordinates(
                    event,
                    "event_latitude",
                    event.event_latitude,
                    "event_longitude",
                    event.event_longitude,
                )?;
                let facility_point = coordinates(
                    event,
                    "facility_latitude",
                    event.facility_latitude,
                    "facility_longitude",
                    event.facility_longitude,
                )?;

                pairs += 1;
                records.push(FeaturizedRecord {
                    event_id: event.event_id,
                    entity_uuid: event.entity_uuid.clone(),
                    timestamp: event.timestamp,
                    event: event.event,
                    event_latitude: event.event_latitude,
                    event_longitude: event.event_longitude,
                    altitude: event.altitude,
                    project_id: event.project_id,
                    customer_id: event.customer_id,
                    facility_latitude: event.facility_latitude,
                    facility_longitude: event.facility_longitude,
                    revision: event.revision,
                    actor_id: event.actor_id,
                    elapsed_time: (event.timestamp - started_at).num_seconds().max(0),
                    distance: haversine_distance(event_point, facility_point),
                    save_and_exit_count: pairs,
                });
            }
            EventType::Other(_) => {}
        }
    }

    Ok(records)
}

fn pairing_order(event_type: EventType) -> u8 {
    match event_type {
        EventType::Start => 0,
        EventType::End => 1,
        EventType::Other(_) => 2,
    }
}

fn coordinates(
    event: &RawEvent,
    lat_field: &'static str,
    lat: Option<f64>,
    lon_field: &'static str,
    lon: Option<f64>,
) -> Result<(f64, f64), FeatureError> {
    let lat = checked_degrees(event.event_id, lat_field, lat, 90.0)?;
    let lon = checked_degrees(event.event_id, lon_field, lon, 180.0)?;
    Ok((lat, lon))
}

fn checked_degrees(
    event_id: i64,
    field: &'static str,
    value: Option<f64>,
    bound: f64,
) -> Result<f64, FeatureError> {
    let value = value.ok_or(FeatureError::MissingCoordinate { event_id, field })?;
    if !value.is_finite() || value.abs() > bound {
        return Err(FeatureError::InvalidCoordinate {
            event_id,
            field,
            value,
        });
    }
    Ok(value)
}
