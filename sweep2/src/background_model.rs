use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use verge_config_data::TuningParams;
use verge_types::{PointPolar, SensorId, SweepFrame, AZIMUTH_BIN_COUNT, RING_COUNT};

use crate::Result;

/// Learning rate while a cell is still warming up.
const WARMUP_UPDATE_FRACTION: f32 = 0.3;
/// Same-ring bin window searched for confirming neighbours.
const NEIGHBOR_WINDOW_BINS: i32 = 2;
/// A settled cell freezes (drops to the post-settle learning rate) after
/// this multiple of the warmup frame count.
const FREEZE_FRAME_MULTIPLE: u32 = 10;

/// Online statistics for one (ring, azimuth-bin) cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundCell {
    /// Exponential moving average of observed distance, meters.
    pub mean_distance_m: f32,
    /// Spread estimate (EMA of absolute deviation), meters.
    pub spread_m: f32,
    /// Number of frames in which this cell saw a return.
    pub observations: u32,
    pub warmed_up: bool,
    pub frozen: bool,
    pub last_update_ns: i64,
}

impl BackgroundCell {
    fn empty() -> Self {
        BackgroundCell {
            mean_distance_m: 0.0,
            spread_m: 0.0,
            observations: 0,
            warmed_up: false,
            frozen: false,
            last_update_ns: 0,
        }
    }

    /// Spread with the relative noise floor applied.
    #[inline]
    fn effective_spread(&self, noise_relative: f32) -> f32 {
        self.spread_m.max(noise_relative * self.mean_distance_m)
    }
}

/// Per-frame output of the background stage.
#[derive(Debug, Clone)]
pub struct BackgroundOutput {
    /// One entry per input point; `true` means confirmed foreground.
    pub mask: Vec<bool>,
    /// Points with a valid return.
    pub total: usize,
    pub foreground: usize,
    pub background: usize,
    pub foreground_points: Vec<PointPolar>,
}

/// The full polar background grid for one sensor.
///
/// Mutated only on the processor task. Snapshot readers deep-copy under the
/// read lock and serialise outside it, so frame processing never blocks on
/// I/O.
#[derive(Debug, Clone)]
pub struct BackgroundGrid {
    sensor: SensorId,
    cells: Vec<BackgroundCell>,
    /// Frame number last folded into each cell, for per-frame observation
    /// counting. Runs parallel to `cells`.
    last_frame: Vec<Option<u64>>,
    first_frame_ns: Option<i64>,
    frames_seen: u64,
}

#[inline]
fn cell_index(ring: u8, bin: usize) -> usize {
    ring as usize * AZIMUTH_BIN_COUNT + bin
}

impl BackgroundGrid {
    pub fn new(sensor: SensorId) -> Self {
        BackgroundGrid {
            sensor,
            cells: vec![BackgroundCell::empty(); RING_COUNT * AZIMUTH_BIN_COUNT],
            last_frame: vec![None; RING_COUNT * AZIMUTH_BIN_COUNT],
            first_frame_ns: None,
            frames_seen: 0,
        }
    }

    /// Rebuild a live grid from a persisted snapshot, so a restarted
    /// process can skip the warmup period.
    pub fn from_snapshot(snapshot: &BackgroundSnapshotData) -> Self {
        let cells = snapshot.cells.clone();
        BackgroundGrid {
            sensor: snapshot.sensor_id.clone(),
            last_frame: vec![None; cells.len()],
            cells,
            first_frame_ns: None,
            frames_seen: 0,
        }
    }

    pub fn sensor(&self) -> &SensorId {
        &self.sensor
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn cell(&self, ring: u8, bin: usize) -> &BackgroundCell {
        &self.cells[cell_index(ring, bin)]
    }

    /// Classify every return in `frame` and fold background returns into
    /// the per-cell statistics.
    pub fn process_frame(&mut self, frame: &SweepFrame, params: &TuningParams) -> BackgroundOutput {
        let started = *self.first_frame_ns.get_or_insert(frame.started_at_ns);
        let elapsed_ns = frame.ended_at_ns.saturating_sub(started) as u64;
        let in_warmup_window = elapsed_ns < params.warmup_duration_nanos;
        self.frames_seen += 1;

        let noise_relative = params.noise_relative as f32;
        let closeness = params.closeness_multiplier as f32;
        let margin = params.safety_margin_meters as f32;

        // Pass 1: per-cell verdicts. Candidates are remembered per ring for
        // the neighbour-confirmation pass.
        let mut mask = vec![false; frame.points.len()];
        let mut candidate: Vec<bool> = vec![false; frame.points.len()];
        let mut candidate_bins: Vec<Vec<i32>> = vec![Vec::new(); RING_COUNT];
        let mut total = 0usize;

        for (idx, pt) in frame.points.iter().enumerate() {
            if pt.distance_m <= 0.0 {
                continue;
            }
            total += 1;
            let bin = pt.azimuth_bin();
            let ci = cell_index(pt.ring, bin);

            // Per-frame observation counting.
            if self.last_frame[ci] != Some(frame.frame.0) {
                self.last_frame[ci] = Some(frame.frame.0);
                self.cells[ci].observations += 1;
            }
            let cell = &mut self.cells[ci];

            let warming = cell.observations < params.warmup_min_frames && in_warmup_window;
            if warming {
                // Accept everything while warming; learn fast.
                if cell.observations <= 1 && params.seed_from_first {
                    cell.mean_distance_m = pt.distance_m;
                    cell.spread_m = 0.0;
                } else {
                    let dev = (pt.distance_m - cell.mean_distance_m).abs();
                    cell.mean_distance_m +=
                        WARMUP_UPDATE_FRACTION * (pt.distance_m - cell.mean_distance_m);
                    cell.spread_m += WARMUP_UPDATE_FRACTION * (dev - cell.spread_m);
                }
                cell.spread_m = cell.effective_spread(noise_relative);
                cell.last_update_ns = pt.timestamp_ns;
                continue;
            }

            if !cell.warmed_up {
                cell.warmed_up = true;
            }
            if !cell.frozen
                && cell.observations >= params.warmup_min_frames * FREEZE_FRAME_MULTIPLE
            {
                cell.frozen = true;
            }

            let threshold = closeness * cell.effective_spread(noise_relative) + margin;
            let deviation = pt.distance_m - cell.mean_distance_m;
            if deviation.abs() <= threshold {
                let fraction = if cell.frozen {
                    params.post_settle_update_fraction as f32
                } else {
                    params.background_update_fraction as f32
                };
                cell.mean_distance_m += fraction * deviation;
                cell.spread_m += fraction * (deviation.abs() - cell.spread_m);
                cell.spread_m = cell.effective_spread(noise_relative);
                cell.last_update_ns = pt.timestamp_ns;
            } else {
                candidate[idx] = true;
                candidate_bins[pt.ring as usize].push(bin as i32);
            }
        }

        for bins in candidate_bins.iter_mut() {
            bins.sort_unstable();
        }

        // Pass 2: neighbour confirmation. An isolated disagreement is noise
        // and is folded into the cell spread instead of being reported.
        let mut foreground = 0usize;
        let mut foreground_points = Vec::new();
        for (idx, pt) in frame.points.iter().enumerate() {
            if !candidate[idx] {
                continue;
            }
            let bin = pt.azimuth_bin() as i32;
            let bins = &candidate_bins[pt.ring as usize];
            let lo = bins.partition_point(|&b| b < bin - NEIGHBOR_WINDOW_BINS);
            let hi = bins.partition_point(|&b| b <= bin + NEIGHBOR_WINDOW_BINS);
            // Excluding this return itself.
            let neighbours = (hi - lo).saturating_sub(1) as u32;

            if neighbours >= params.neighbor_confirmation_count {
                mask[idx] = true;
                foreground += 1;
                foreground_points.push(pt.clone());
            } else {
                let cell = &mut self.cells[cell_index(pt.ring, pt.azimuth_bin())];
                let fraction = if cell.frozen {
                    params.post_settle_update_fraction as f32
                } else {
                    params.background_update_fraction as f32
                };
                let dev = (pt.distance_m - cell.mean_distance_m).abs();
                cell.spread_m += fraction * (dev - cell.spread_m);
                cell.spread_m = cell.effective_spread(noise_relative);
            }
        }

        debug!(
            "frame {}: {total} returns, {foreground} foreground",
            frame.frame
        );

        BackgroundOutput {
            mask,
            total,
            foreground,
            background: total - foreground,
            foreground_points,
        }
    }

    /// Deep-copy the grid into a serialisable snapshot. Cheap enough to run
    /// under the read lock; compression happens afterwards.
    pub fn snapshot(&self, ring_elevations_deg: &[f32], taken_at_ns: i64) -> BackgroundSnapshotData {
        BackgroundSnapshotData {
            sensor_id: self.sensor.clone(),
            taken_at_ns,
            ring_elevations_deg: ring_elevations_deg.to_vec(),
            cells: self.cells.clone(),
        }
    }
}

/// Serialisable form of the grid, with the ring elevations embedded so an
/// exported frame can be re-projected without the live model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSnapshotData {
    pub sensor_id: SensorId,
    pub taken_at_ns: i64,
    pub ring_elevations_deg: Vec<f32>,
    pub cells: Vec<BackgroundCell>,
}

/// Gzip-compress a snapshot into an opaque blob.
pub fn serialize_snapshot(snapshot: &BackgroundSnapshotData) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(snapshot)?;
    let mut encoder = libflate::gzip::Encoder::new(Vec::new())?;
    encoder.write_all(&json)?;
    Ok(encoder.finish().into_result()?)
}

pub fn deserialize_snapshot(blob: &[u8]) -> Result<BackgroundSnapshotData> {
    let mut decoder = libflate::gzip::Decoder::new(blob)?;
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_types::{SweepFno, SweepFrame};

    const FRAME_PERIOD_NS: i64 = 100_000_000;

    /// A full frame whose per-point distances come from the closure.
    fn synth_frame(fno: u64, mut distance_at: impl FnMut(u8, f32) -> f32) -> SweepFrame {
        let start = fno as i64 * FRAME_PERIOD_NS;
        let mut points = Vec::new();
        for ring in 0..RING_COUNT as u8 {
            for b in 0..AZIMUTH_BIN_COUNT {
                let az = b as f32 + 0.5;
                points.push(PointPolar {
                    ring,
                    azimuth_deg: az,
                    distance_m: distance_at(ring, az).max(0.0),
                    intensity: 40,
                    timestamp_ns: start + (b as i64 * FRAME_PERIOD_NS) / AZIMUTH_BIN_COUNT as i64,
                    block_azimuth: (az * 100.0) as u16,
                });
            }
        }
        SweepFrame {
            frame: SweepFno(fno),
            sensor: SensorId::new("s1"),
            started_at_ns: start,
            ended_at_ns: start + FRAME_PERIOD_NS - 1,
            points,
        }
    }

    fn warmup_params() -> TuningParams {
        let mut p = TuningParams::recommended();
        p.warmup_min_frames = 10;
        p.warmup_duration_nanos = 5_000_000_000;
        p
    }

    #[test]
    fn constant_scene_has_no_foreground_after_warmup() {
        let params = warmup_params();
        let mut grid = BackgroundGrid::new(SensorId::new("s1"));

        let mut noise_phase = 0u32;
        for fno in 0..100 {
            // +-5 cm deterministic jitter.
            let out = grid.process_frame(
                &synth_frame(fno, |_, _| {
                    noise_phase = noise_phase.wrapping_mul(1664525).wrapping_add(1013904223);
                    20.0 + ((noise_phase >> 16) as f32 / 65535.0 - 0.5) * 0.1
                }),
                &params,
            );
            if fno >= 20 {
                assert_eq!(out.foreground, 0, "frame {fno} reported foreground");
            }
        }
        let cell = grid.cell(3, 100);
        assert!(cell.warmed_up);
        assert!((cell.mean_distance_m - 20.0).abs() < 0.1);
    }

    #[test]
    fn large_deviation_with_neighbours_is_foreground() {
        let params = warmup_params();
        let mut grid = BackgroundGrid::new(SensorId::new("s1"));
        for fno in 0..20 {
            grid.process_frame(&synth_frame(fno, |_, _| 20.0), &params);
        }
        // An object at 10 m spanning azimuth 100..104 on one ring.
        let out = grid.process_frame(
            &synth_frame(20, |ring, az| {
                if ring == 5 && (100.0..104.0).contains(&az) {
                    10.0
                } else {
                    20.0
                }
            }),
            &params,
        );
        assert_eq!(out.foreground, 4);
        assert_eq!(out.background, out.total - 4);
    }

    #[test]
    fn isolated_deviation_is_noise() {
        let params = warmup_params();
        let mut grid = BackgroundGrid::new(SensorId::new("s1"));
        for fno in 0..20 {
            grid.process_frame(&synth_frame(fno, |_, _| 20.0), &params);
        }
        let spread_before = grid.cell(5, 100).spread_m;
        let out = grid.process_frame(
            &synth_frame(20, |ring, az| {
                if ring == 5 && (100.0..101.0).contains(&az) {
                    10.0
                } else {
                    20.0
                }
            }),
            &params,
        );
        assert_eq!(out.foreground, 0);
        // The disagreement was folded into the spread estimate.
        assert!(grid.cell(5, 100).spread_m > spread_before);
    }

    #[test]
    fn restored_grid_skips_warmup() {
        let params = warmup_params();
        let mut grid = BackgroundGrid::new(SensorId::new("s1"));
        for fno in 0..30 {
            grid.process_frame(&synth_frame(fno, |_, _| 20.0), &params);
        }
        let snap = grid.snapshot(&[0.0; RING_COUNT], 0);

        // A fresh process restores the model and classifies immediately.
        let mut restored = BackgroundGrid::from_snapshot(&snap);
        let out = restored.process_frame(
            &synth_frame(0, |ring, az| {
                if ring == 5 && (100.0..104.0).contains(&az) {
                    10.0
                } else {
                    20.0
                }
            }),
            &params,
        );
        assert_eq!(out.foreground, 4);
    }

    #[test]
    fn snapshot_roundtrip_is_exact() {
        let params = warmup_params();
        let mut grid = BackgroundGrid::new(SensorId::new("s1"));
        for fno in 0..30 {
            grid.process_frame(
                &synth_frame(fno, |ring, az| 15.0 + ring as f32 + az * 0.01),
                &params,
            );
        }
        let elevations: Vec<f32> = (0..RING_COUNT).map(|r| r as f32 - 7.5).collect();
        let snap = grid.snapshot(&elevations, 123_456_789);
        let blob = serialize_snapshot(&snap).unwrap();
        let restored = deserialize_snapshot(&blob).unwrap();
        assert_eq!(snap, restored);
        // Worthwhile compression on a structured grid.
        assert!(blob.len() < serde_json::to_vec(&snap).unwrap().len());
    }
}
