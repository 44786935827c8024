//! The per-sensor frame processor: stages 4 through 9, serially.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use verge_config_data::TuningRegistry;
use verge_store::{StoreHandle, StoreMsg};
use verge_types::{
    BackgroundSnapshotRow, ForegroundClusterRow, PointPolar, RingCalibration, SensorFrameRow,
    SensorId, SweepFno, SweepFrame, TrackState,
};

use crate::background_model::{serialize_snapshot, BackgroundGrid};
use crate::classifier;
use crate::clusterer::cluster_frame;
use crate::stats::PipelineStats;
use crate::tracker::Tracker;
use crate::transform::{transform_and_filter, SensorPose};
use crate::Result;

/// Diagnostics cadence, in frames.
const DIAGNOSTICS_EVERY: u64 = 100;

/// Foreground-only payload handed to the optional re-emission task.
#[derive(Debug, Clone)]
pub struct ForegroundFrame {
    pub sensor: SensorId,
    pub frame: SweepFno,
    pub timestamp_ns: i64,
    pub points: Vec<PointPolar>,
}

/// Per-frame status returned to the caller, also used by the end-to-end
/// tests.
#[derive(Debug, Clone, Default)]
pub struct FrameSummary {
    pub frame: SweepFno,
    pub returns: usize,
    pub foreground: usize,
    pub world_points: usize,
    pub clusters: usize,
    pub active_tracks: usize,
    pub confirmed_tracks: usize,
}

/// Runs background classification, transform, clustering, tracking,
/// classification and persistence for one sensor, one frame at a time.
///
/// The grid and tracker live behind reader-writer locks so snapshot takers
/// and queries can deep-copy them; all mutation happens here, on the one
/// task calling [`SweepProcessor::process_frame`].
pub struct SweepProcessor {
    sensor: SensorId,
    registry: TuningRegistry,
    calibration: RingCalibration,
    pose: SensorPose,
    grid: Arc<RwLock<BackgroundGrid>>,
    tracker: Arc<RwLock<Tracker>>,
    store: StoreHandle,
    foreground_tx: Option<tokio::sync::mpsc::Sender<ForegroundFrame>>,
    stats: Arc<PipelineStats>,
}

impl SweepProcessor {
    pub fn new(
        sensor: SensorId,
        registry: TuningRegistry,
        calibration: RingCalibration,
        pose: SensorPose,
        store: StoreHandle,
    ) -> Self {
        SweepProcessor {
            grid: Arc::new(RwLock::new(BackgroundGrid::new(sensor.clone()))),
            tracker: Arc::new(RwLock::new(Tracker::new(sensor.clone()))),
            sensor,
            registry,
            calibration,
            pose,
            store,
            foreground_tx: None,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Attach the bounded foreground re-emission queue. Overflow drops the
    /// frame and counts it; the processor never blocks on the tap.
    pub fn with_foreground_tap(
        mut self,
        tx: tokio::sync::mpsc::Sender<ForegroundFrame>,
    ) -> Self {
        self.foreground_tx = Some(tx);
        self
    }

    pub fn sensor(&self) -> &SensorId {
        &self.sensor
    }

    pub fn grid(&self) -> Arc<RwLock<BackgroundGrid>> {
        self.grid.clone()
    }

    pub fn tracker(&self) -> Arc<RwLock<Tracker>> {
        self.tracker.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run stages 4-9 for one completed frame.
    pub fn process_frame(&self, frame: SweepFrame) -> FrameSummary {
        // One consistent parameter set per frame; hot reloads land on the
        // next frame boundary.
        let params = self.registry.current();

        let background = self.grid.write().process_frame(&frame, &params);

        if let Some(tx) = &self.foreground_tx {
            if !background.foreground_points.is_empty() {
                let payload = ForegroundFrame {
                    sensor: self.sensor.clone(),
                    frame: frame.frame,
                    timestamp_ns: frame.ended_at_ns,
                    points: background.foreground_points.clone(),
                };
                if let Err(tokio::sync::mpsc::error::TrySendError::Full(_)) = tx.try_send(payload)
                {
                    self.stats.record_tap_drop();
                }
            }
        }

        let world = transform_and_filter(
            &background.foreground_points,
            &self.sensor,
            &self.calibration,
            &self.pose,
            &params,
        );
        let clusters = cluster_frame(&world, &params);

        let (output, active_tracks, confirmed_tracks) = {
            let mut tracker = self.tracker.write();
            let output = tracker.update(&clusters, frame.ended_at_ns, &params);

            // Classify on deep-copied features; write back through the
            // tracker so track mutation stays serialised here.
            for track in tracker.snapshot_tracks() {
                if track.state != TrackState::Confirmed {
                    continue;
                }
                if let Some(classification) = classifier::classify(
                    &track.features(),
                    params.min_observations_for_classification,
                ) {
                    if track.classification.as_ref() != Some(&classification) {
                        tracker.update_classification(track.id, classification);
                    }
                }
            }

            let active = tracker.active_count();
            let confirmed = tracker
                .snapshot_tracks()
                .iter()
                .filter(|t| t.state == TrackState::Confirmed)
                .count();
            (output, active, confirmed)
        };

        // Summary rows first so observation rows always reference an
        // existing track.
        for row in output.upserts {
            self.store.send(StoreMsg::UpsertTrack(row));
        }
        self.store.send(StoreMsg::Frame(SensorFrameRow {
            sensor_id: self.sensor.clone(),
            frame: frame.frame,
            started_at_ns: frame.started_at_ns,
            ended_at_ns: frame.ended_at_ns,
            point_count: background.total,
            foreground_count: background.foreground,
            background_count: background.background,
        }));
        if !clusters.is_empty() {
            let rows = clusters
                .iter()
                .map(|cluster| ForegroundClusterRow {
                    sensor_id: self.sensor.clone(),
                    frame: frame.frame,
                    timestamp_ns: frame.ended_at_ns,
                    cluster: cluster.clone(),
                })
                .collect();
            self.store.send(StoreMsg::Clusters(rows));
        }
        for observation in output.observations {
            self.store.send(StoreMsg::Observation(observation));
        }

        self.stats
            .record_frame(background.total, background.foreground, clusters.len());
        let frames = self
            .stats
            .frames_processed
            .load(std::sync::atomic::Ordering::Relaxed);
        if params.enable_diagnostics && frames % DIAGNOSTICS_EVERY == 0 {
            self.stats.log_summary();
        }

        debug!(
            "frame {}: {} foreground, {} clusters, {} tracks",
            frame.frame,
            background.foreground,
            clusters.len(),
            active_tracks
        );

        FrameSummary {
            frame: frame.frame,
            returns: background.total,
            foreground: background.foreground,
            world_points: world.len(),
            clusters: clusters.len(),
            active_tracks,
            confirmed_tracks,
        }
    }

    /// Deep-copy the grid under the read lock, then compress outside it.
    pub fn snapshot_row(&self, reason: &str, taken_at_ns: i64) -> Result<BackgroundSnapshotRow> {
        let snapshot = {
            let grid = self.grid.read();
            grid.snapshot(&self.calibration.elevations_deg, taken_at_ns)
        };
        let blob = serialize_snapshot(&snapshot)?;
        Ok(BackgroundSnapshotRow {
            sensor_id: self.sensor.clone(),
            taken_at_ns,
            reason: reason.to_string(),
            blob,
        })
    }

    /// Take a snapshot and queue it for persistence.
    pub fn flush_snapshot(&self, reason: &str, taken_at_ns: i64) -> Result<()> {
        let row = self.snapshot_row(reason, taken_at_ns)?;
        self.store.send(StoreMsg::Snapshot(row));
        Ok(())
    }
}
