use crossbeam_channel::Receiver;
use rusqlite::params;
use tracing::{debug, error, info};

use verge_types::{
    ForegroundClusterRow, SensorFrameRow, TrackObservationRow, TrackRow,
};

use crate::{Result, StoreMsg};

/// Run the single-writer loop until `QuitNow` or sender disconnect.
///
/// Each wakeup drains whatever is ready so consecutive messages land in one
/// transaction. A failed transaction is retried once with the next batch;
/// if it fails again it is dropped so ingest is never wedged behind a
/// poisoned write.
pub fn writer_thread_main(mut conn: rusqlite::Connection, rx: Receiver<StoreMsg>) -> Result<()> {
    let mut pending: Vec<StoreMsg> = Vec::new();
    let mut already_retried = false;
    let mut written: u64 = 0;

    loop {
        let quit = match rx.recv() {
            Ok(StoreMsg::QuitNow) => true,
            Ok(msg) => {
                pending.push(msg);
                let mut saw_quit = false;
                while let Ok(more) = rx.try_recv() {
                    if matches!(more, StoreMsg::QuitNow) {
                        saw_quit = true;
                        break;
                    }
                    pending.push(more);
                }
                saw_quit
            }
            // Sender disconnected; flush what we have and exit.
            Err(_) => true,
        };

        if !pending.is_empty() {
            match write_batch(&mut conn, &pending) {
                Ok(n) => {
                    written += n;
                    pending.clear();
                    already_retried = false;
                }
                Err(e) => {
                    if already_retried {
                        error!(
                            "store batch failed twice, dropping {} messages: {e}",
                            pending.len()
                        );
                        pending.clear();
                        already_retried = false;
                    } else {
                        error!("store batch failed, will retry with next batch: {e}");
                        already_retried = true;
                    }
                }
            }
        }

        if quit {
            break;
        }
    }

    info!("store writer exiting after {written} rows");
    Ok(())
}

fn write_batch(conn: &mut rusqlite::Connection, batch: &[StoreMsg]) -> rusqlite::Result<u64> {
    let tx = conn.transaction()?;
    let mut rows = 0u64;
    for msg in batch {
        match msg {
            StoreMsg::Frame(row) => {
                insert_frame(&tx, row)?;
                rows += 1;
            }
            StoreMsg::Clusters(clusters) => {
                for c in clusters {
                    insert_cluster(&tx, c)?;
                    rows += 1;
                }
            }
            StoreMsg::Observation(row) => {
                insert_observation(&tx, row)?;
                rows += 1;
            }
            StoreMsg::UpsertTrack(row) => {
                upsert_track(&tx, row)?;
                rows += 1;
            }
            StoreMsg::Snapshot(row) => {
                tx.execute(
                    "INSERT INTO background_snapshot (sensor_id, taken_at_ns, reason, blob)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.sensor_id.as_str(), row.taken_at_ns, row.reason, row.blob],
                )?;
                debug!(
                    "background snapshot persisted ({} bytes, {})",
                    row.blob.len(),
                    row.reason
                );
                rows += 1;
            }
            StoreMsg::QuitNow => {}
        }
    }
    tx.commit()?;
    Ok(rows)
}

fn insert_frame(tx: &rusqlite::Transaction, row: &SensorFrameRow) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO sensor_frame
         (sensor_id, frame, started_at_ns, ended_at_ns, point_count,
          foreground_count, background_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.sensor_id.as_str(),
            row.frame.0,
            row.started_at_ns,
            row.ended_at_ns,
            row.point_count,
            row.foreground_count,
            row.background_count,
        ],
    )?;
    Ok(())
}

fn insert_cluster(tx: &rusqlite::Transaction, row: &ForegroundClusterRow) -> rusqlite::Result<()> {
    let c = &row.cluster;
    tx.execute(
        "INSERT INTO foreground_cluster
         (sensor_id, frame, timestamp_ns, cluster_id,
          centroid_x, centroid_y, centroid_z, centroid_sensor_id,
          aabb_min_x, aabb_min_y, aabb_min_z,
          aabb_max_x, aabb_max_y, aabb_max_z,
          obb_cx, obb_cy, obb_length_m, obb_width_m, obb_height_m, obb_heading_rad,
          point_count, intensity_mean, height_p95)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                 ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            row.sensor_id.as_str(),
            row.frame.0,
            row.timestamp_ns,
            c.cluster_id,
            c.centroid.x,
            c.centroid.y,
            c.centroid.z,
            c.centroid.sensor_id.as_str(),
            c.aabb_min[0],
            c.aabb_min[1],
            c.aabb_min[2],
            c.aabb_max[0],
            c.aabb_max[1],
            c.aabb_max[2],
            c.obb.cx,
            c.obb.cy,
            c.obb.length_m,
            c.obb.width_m,
            c.obb.height_m,
            c.obb.heading_rad,
            c.point_count,
            c.intensity_mean,
            c.height_p95,
        ],
    )?;
    Ok(())
}

fn insert_observation(
    tx: &rusqlite::Transaction,
    row: &TrackObservationRow,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO track_observation
         (track_id, timestamp_ns, x, y, vx, vy, speed_mps, heading_rad,
          obb_length_m, obb_width_m, obb_height_m)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            row.track_id.to_string(),
            row.timestamp_ns,
            row.x,
            row.y,
            row.vx,
            row.vy,
            row.speed_mps,
            row.heading_rad,
            row.obb_length_m,
            row.obb_width_m,
            row.obb_height_m,
        ],
    )?;
    Ok(())
}

fn upsert_track(tx: &rusqlite::Transaction, row: &TrackRow) -> rusqlite::Result<()> {
    let (class, confidence, model) = match &row.classification {
        Some(c) => (
            Some(c.class.as_str()),
            Some(c.confidence),
            Some(c.model.as_str()),
        ),
        None => (None, None, None),
    };
    tx.execute(
        "INSERT INTO track
         (id, sensor_id, state, observation_count,
          avg_length_m, avg_width_m, avg_height_m, max_height_p95_m,
          avg_speed_mps, peak_speed_mps,
          velocity_alignment_rad, heading_jitter_rad, speed_jitter_mps,
          occlusion_count, max_occlusion_frames, merge_candidate, split_candidate,
          class, class_confidence, class_model, first_seen_ns, last_seen_ns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
         ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            observation_count = excluded.observation_count,
            avg_length_m = excluded.avg_length_m,
            avg_width_m = excluded.avg_width_m,
            avg_height_m = excluded.avg_height_m,
            max_height_p95_m = excluded.max_height_p95_m,
            avg_speed_mps = excluded.avg_speed_mps,
            peak_speed_mps = excluded.peak_speed_mps,
            velocity_alignment_rad = excluded.velocity_alignment_rad,
            heading_jitter_rad = excluded.heading_jitter_rad,
            speed_jitter_mps = excluded.speed_jitter_mps,
            occlusion_count = excluded.occlusion_count,
            max_occlusion_frames = excluded.max_occlusion_frames,
            merge_candidate = excluded.merge_candidate,
            split_candidate = excluded.split_candidate,
            class = excluded.class,
            class_confidence = excluded.class_confidence,
            class_model = excluded.class_model,
            last_seen_ns = excluded.last_seen_ns",
        params![
            row.id.to_string(),
            row.sensor_id.as_str(),
            row.state.as_str(),
            row.observation_count,
            row.avg_length_m,
            row.avg_width_m,
            row.avg_height_m,
            row.max_height_p95_m,
            row.avg_speed_mps,
            row.peak_speed_mps,
            row.quality.velocity_alignment_rad,
            row.quality.heading_jitter_rad,
            row.quality.speed_jitter_mps,
            row.quality.occlusion_count,
            row.quality.max_occlusion_frames,
            row.quality.merge_candidate,
            row.quality.split_candidate,
            class,
            confidence,
            model,
            row.first_seen_ns,
            row.last_seen_ns,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_types::{
        Classification, Obb, ObjectClass, SensorId, SweepFno, TrackId, TrackQuality, TrackState,
        WorldCluster, WorldPoint,
    };

    fn sample_track_row(id: TrackId, state: TrackState) -> TrackRow {
        TrackRow {
            id,
            sensor_id: SensorId::new("s1"),
            state,
            observation_count: 12,
            avg_length_m: 4.2,
            avg_width_m: 1.8,
            avg_height_m: 1.5,
            max_height_p95_m: 1.6,
            avg_speed_mps: 8.0,
            peak_speed_mps: 11.0,
            quality: TrackQuality::default(),
            classification: Some(Classification {
                class: ObjectClass::Car,
                confidence: 0.8,
                model: "rules-v1".to_string(),
            }),
            first_seen_ns: 1_000,
            last_seen_ns: 2_000,
        }
    }

    #[test]
    fn writer_persists_and_quits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let (handle, join) = crate::spawn_store_writer(&path, 64).unwrap();

        let track_id = TrackId::new_random();
        handle.send(StoreMsg::Frame(SensorFrameRow {
            sensor_id: SensorId::new("s1"),
            frame: SweepFno(1),
            started_at_ns: 0,
            ended_at_ns: 100_000_000,
            point_count: 28_000,
            foreground_count: 40,
            background_count: 27_960,
        }));
        handle.send(StoreMsg::Clusters(vec![ForegroundClusterRow {
            sensor_id: SensorId::new("s1"),
            frame: SweepFno(1),
            timestamp_ns: 50_000_000,
            cluster: WorldCluster {
                cluster_id: 0,
                centroid: WorldPoint {
                    x: 1.0,
                    y: 2.0,
                    z: 0.5,
                    intensity: 17,
                    timestamp_ns: 50_000_000,
                    sensor_id: SensorId::new("s1"),
                },
                aabb_min: [0.5, 1.5, 0.0],
                aabb_max: [1.5, 2.5, 1.0],
                obb: Obb {
                    cx: 1.0,
                    cy: 2.0,
                    length_m: 1.0,
                    width_m: 0.6,
                    height_m: 1.0,
                    heading_rad: 0.3,
                },
                point_count: 25,
                intensity_mean: 17.0,
                height_p95: 0.9,
            },
        }]));
        handle.send(StoreMsg::UpsertTrack(sample_track_row(
            track_id,
            TrackState::Confirmed,
        )));
        handle.send(StoreMsg::Observation(TrackObservationRow {
            track_id,
            timestamp_ns: 50_000_000,
            x: 1.0,
            y: 2.0,
            vx: 0.5,
            vy: 0.0,
            speed_mps: 0.5,
            heading_rad: 0.0,
            obb_length_m: 1.0,
            obb_width_m: 0.6,
            obb_height_m: 1.0,
        }));
        handle.quit();
        join.join().unwrap().unwrap();

        let conn = crate::open_reader(&path).unwrap();
        let frames: i64 = conn
            .query_row("SELECT COUNT(*) FROM sensor_frame", [], |r| r.get(0))
            .unwrap();
        let clusters: i64 = conn
            .query_row("SELECT COUNT(*) FROM foreground_cluster", [], |r| r.get(0))
            .unwrap();
        let observations: i64 = conn
            .query_row("SELECT COUNT(*) FROM track_observation", [], |r| r.get(0))
            .unwrap();
        assert_eq!((frames, clusters, observations), (1, 1, 1));
    }

    #[test]
    fn track_upsert_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let mut conn = crate::open_store(&path).unwrap();

        let id = TrackId::new_random();
        write_batch(
            &mut conn,
            &[StoreMsg::UpsertTrack(sample_track_row(
                id,
                TrackState::Confirmed,
            ))],
        )
        .unwrap();
        write_batch(
            &mut conn,
            &[StoreMsg::UpsertTrack(sample_track_row(
                id,
                TrackState::Deleted,
            ))],
        )
        .unwrap();

        let (count, state): (i64, String) = conn
            .query_row("SELECT COUNT(*), MAX(state) FROM track", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(state, "deleted");
    }

    #[test]
    fn observation_cascades_with_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let mut conn = crate::open_store(&path).unwrap();

        let id = TrackId::new_random();
        write_batch(
            &mut conn,
            &[
                StoreMsg::UpsertTrack(sample_track_row(id, TrackState::Confirmed)),
                StoreMsg::Observation(TrackObservationRow {
                    track_id: id,
                    timestamp_ns: 1,
                    x: 0.0,
                    y: 0.0,
                    vx: 0.0,
                    vy: 0.0,
                    speed_mps: 0.0,
                    heading_rad: 0.0,
                    obb_length_m: 0.0,
                    obb_width_m: 0.0,
                    obb_height_m: 0.0,
                }),
            ],
        )
        .unwrap();

        conn.execute("DELETE FROM track WHERE id = ?1", [id.to_string()])
            .unwrap();
        let observations: i64 = conn
            .query_row("SELECT COUNT(*) FROM track_observation", [], |r| r.get(0))
            .unwrap();
        assert_eq!(observations, 0);
    }
}
