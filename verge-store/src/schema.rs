use std::path::Path;

use crate::{Error, Result};

/// Version written by this binary's bootstrap. The out-of-process migration
/// runner owns forward migrations; we only bootstrap empty databases and
/// verify compatibility.
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sensor_frame (
    sensor_id TEXT NOT NULL,
    frame INTEGER NOT NULL,
    started_at_ns INTEGER NOT NULL,
    ended_at_ns INTEGER NOT NULL,
    point_count INTEGER NOT NULL,
    foreground_count INTEGER NOT NULL,
    background_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sensor_frame_sensor
    ON sensor_frame(sensor_id, frame);

CREATE TABLE IF NOT EXISTS foreground_cluster (
    sensor_id TEXT NOT NULL,
    frame INTEGER NOT NULL,
    timestamp_ns INTEGER NOT NULL,
    cluster_id INTEGER NOT NULL,
    centroid_x REAL NOT NULL,
    centroid_y REAL NOT NULL,
    centroid_z REAL NOT NULL,
    centroid_sensor_id TEXT NOT NULL,
    aabb_min_x REAL NOT NULL,
    aabb_min_y REAL NOT NULL,
    aabb_min_z REAL NOT NULL,
    aabb_max_x REAL NOT NULL,
    aabb_max_y REAL NOT NULL,
    aabb_max_z REAL NOT NULL,
    obb_cx REAL NOT NULL,
    obb_cy REAL NOT NULL,
    obb_length_m REAL NOT NULL,
    obb_width_m REAL NOT NULL,
    obb_height_m REAL NOT NULL,
    obb_heading_rad REAL NOT NULL,
    point_count INTEGER NOT NULL,
    intensity_mean REAL NOT NULL,
    height_p95 REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_foreground_cluster_frame
    ON foreground_cluster(sensor_id, frame);

CREATE TABLE IF NOT EXISTS track (
    id TEXT PRIMARY KEY NOT NULL,
    sensor_id TEXT NOT NULL,
    state TEXT NOT NULL,
    observation_count INTEGER NOT NULL,
    avg_length_m REAL NOT NULL,
    avg_width_m REAL NOT NULL,
    avg_height_m REAL NOT NULL,
    max_height_p95_m REAL NOT NULL,
    avg_speed_mps REAL NOT NULL,
    peak_speed_mps REAL NOT NULL,
    velocity_alignment_rad REAL NOT NULL,
    heading_jitter_rad REAL NOT NULL,
    speed_jitter_mps REAL NOT NULL,
    occlusion_count INTEGER NOT NULL,
    max_occlusion_frames INTEGER NOT NULL,
    merge_candidate INTEGER NOT NULL,
    split_candidate INTEGER NOT NULL,
    class TEXT,
    class_confidence REAL,
    class_model TEXT,
    first_seen_ns INTEGER NOT NULL,
    last_seen_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_track_sensor_state ON track(sensor_id, state);

CREATE TABLE IF NOT EXISTS track_observation (
    track_id TEXT NOT NULL REFERENCES track(id) ON DELETE CASCADE,
    timestamp_ns INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    vx REAL NOT NULL,
    vy REAL NOT NULL,
    speed_mps REAL NOT NULL,
    heading_rad REAL NOT NULL,
    obb_length_m REAL NOT NULL,
    obb_width_m REAL NOT NULL,
    obb_height_m REAL NOT NULL,
    PRIMARY KEY (track_id, timestamp_ns)
);

CREATE TABLE IF NOT EXISTS background_snapshot (
    sensor_id TEXT NOT NULL,
    taken_at_ns INTEGER NOT NULL,
    reason TEXT NOT NULL,
    blob BLOB NOT NULL
);
";

/// Bootstrap an empty database or verify an existing one is usable.
pub fn ensure_schema(conn: &rusqlite::Connection, path: &Path) -> Result<()> {
    let existing: Option<(i64, bool)> = {
        let has_version_table: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;
        if has_version_table {
            conn.query_row(
                "SELECT version, dirty FROM schema_version LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .unwrap_or(None)
        } else {
            None
        }
    };

    match existing {
        Some((version, true)) => {
            // A migration died partway. Abort before touching anything.
            Err(Error::DirtySchema {
                path: path.to_path_buf(),
                version,
            })
        }
        Some((version, false)) if version > SCHEMA_VERSION => Err(Error::SchemaTooNew {
            actual: version,
            supported: SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
        None => {
            conn.execute_batch(CREATE_SQL)?;
            conn.execute(
                "INSERT INTO schema_version (version, dirty) VALUES (?1, 0)",
                [SCHEMA_VERSION],
            )?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        {
            let conn = crate::open_store(&path).unwrap();
            let version: i64 = conn
                .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
                .unwrap();
            assert_eq!(version, SCHEMA_VERSION);
        }
        // Second open must be a no-op, not a re-bootstrap.
        let conn = crate::open_store(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn dirty_schema_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        {
            let conn = crate::open_store(&path).unwrap();
            conn.execute("UPDATE schema_version SET dirty = 1", []).unwrap();
        }
        match crate::open_store(&path) {
            Err(Error::DirtySchema { version, .. }) => assert_eq!(version, SCHEMA_VERSION),
            other => panic!("expected DirtySchema, got {other:?}"),
        }
    }
}
