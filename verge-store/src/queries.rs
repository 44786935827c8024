//! Read-side queries over the persisted schema, for reporting and the
//! external API surface. All functions take a reader connection from
//! [`crate::open_reader`].

use rusqlite::params;

use verge_types::{
    BackgroundSnapshotRow, Classification, ObjectClass, SensorId, TrackId, TrackObservationRow,
    TrackState,
};

use crate::Result;

/// Flat track summary as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub id: TrackId,
    pub sensor_id: SensorId,
    pub state: TrackState,
    pub observation_count: u64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub classification: Option<Classification>,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
}

fn parse_state(state: &str) -> TrackState {
    match state {
        "tentative" => TrackState::Tentative,
        "confirmed" => TrackState::Confirmed,
        _ => TrackState::Deleted,
    }
}

fn parse_class(class: &str) -> ObjectClass {
    match class {
        "pedestrian" => ObjectClass::Pedestrian,
        "car" => ObjectClass::Car,
        "bird" => ObjectClass::Bird,
        _ => ObjectClass::Other,
    }
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<TrackSummary> {
    let id: String = row.get("id")?;
    let sensor_id: String = row.get("sensor_id")?;
    let state: String = row.get("state")?;
    let class: Option<String> = row.get("class")?;
    let classification = match class {
        Some(class) => Some(Classification {
            class: parse_class(&class),
            confidence: row.get::<_, Option<f64>>("class_confidence")?.unwrap_or(0.0),
            model: row
                .get::<_, Option<String>>("class_model")?
                .unwrap_or_default(),
        }),
        None => None,
    };
    Ok(TrackSummary {
        id: id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        sensor_id: SensorId::new(sensor_id),
        state: parse_state(&state),
        observation_count: row.get::<_, i64>("observation_count")? as u64,
        avg_speed_mps: row.get("avg_speed_mps")?,
        peak_speed_mps: row.get("peak_speed_mps")?,
        classification,
        first_seen_ns: row.get("first_seen_ns")?,
        last_seen_ns: row.get("last_seen_ns")?,
    })
}

/// Tracks for one sensor, optionally restricted by lifecycle state,
/// newest first.
pub fn tracks_for_sensor(
    conn: &rusqlite::Connection,
    sensor: &SensorId,
    state: Option<TrackState>,
) -> Result<Vec<TrackSummary>> {
    let mut out = Vec::new();
    match state {
        Some(state) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM track WHERE sensor_id = ?1 AND state = ?2
                 ORDER BY last_seen_ns DESC",
            )?;
            let rows = stmt.query_map(params![sensor.as_str(), state.as_str()], |r| {
                row_to_summary(r)
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM track WHERE sensor_id = ?1 ORDER BY last_seen_ns DESC",
            )?;
            let rows = stmt.query_map(params![sensor.as_str()], |r| row_to_summary(r))?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

/// Full observation trail for one track, in timestamp order.
pub fn observations_for_track(
    conn: &rusqlite::Connection,
    id: TrackId,
) -> Result<Vec<TrackObservationRow>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp_ns, x, y, vx, vy, speed_mps, heading_rad,
                obb_length_m, obb_width_m, obb_height_m
         FROM track_observation WHERE track_id = ?1 ORDER BY timestamp_ns",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |r| {
        Ok(TrackObservationRow {
            track_id: id,
            timestamp_ns: r.get(0)?,
            x: r.get(1)?,
            y: r.get(2)?,
            vx: r.get(3)?,
            vy: r.get(4)?,
            speed_mps: r.get(5)?,
            heading_rad: r.get(6)?,
            obb_length_m: r.get(7)?,
            obb_width_m: r.get(8)?,
            obb_height_m: r.get(9)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Number of persisted frames for one sensor.
pub fn frame_count(conn: &rusqlite::Connection, sensor: &SensorId) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sensor_frame WHERE sensor_id = ?1",
        params![sensor.as_str()],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

/// The most recent background snapshot for one sensor, if any.
pub fn latest_snapshot(
    conn: &rusqlite::Connection,
    sensor: &SensorId,
) -> Result<Option<BackgroundSnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT taken_at_ns, reason, blob FROM background_snapshot
         WHERE sensor_id = ?1 ORDER BY taken_at_ns DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![sensor.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(BackgroundSnapshotRow {
            sensor_id: sensor.clone(),
            taken_at_ns: row.get(0)?,
            reason: row.get(1)?,
            blob: row.get(2)?,
        })),
        None => Ok(None),
    }
}
