//! Multi-object Kalman tracker with global assignment and lifecycle
//! management.

use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, PI};

use adskalman::{CovarianceUpdateMethod, ObservationModel, StateAndCovariance};
use nalgebra::{Matrix4, Vector2, Vector4, U4};
use tracing::{debug, warn};

use tracking::{ConstantVelocity2DModel, PositionObservation2D};
use verge_config_data::TuningParams;
use verge_types::{
    Classification, Obb, SensorId, TrackId, TrackObservationRow, TrackQuality, TrackRow,
    TrackState, WorldCluster,
};

use crate::assignment::{assign_min_cost, FORBIDDEN_COST};
use crate::classifier::TrackFeatures;

/// dt assumed for the very first frame.
const FIRST_FRAME_DT: f64 = 0.1;
/// Innovation covariance determinants below this are treated as singular
/// and gate the pair out.
const S_DETERMINANT_FLOOR: f64 = 1e-9;
/// Kalman speed below which PCA heading cannot be disambiguated from
/// velocity.
const HEADING_SPEED_FLOOR_MPS: f64 = 0.5;
/// Minimum trail displacement usable as a heading reference.
const HEADING_TRAIL_FLOOR_M: f64 = 0.1;
/// Velocity variance seeded into new tracks.
const INITIAL_VELOCITY_VARIANCE: f64 = 25.0;
/// Beam angular spread used to widen measurement noise with range.
const BEAM_ANGULAR_SPREAD_RAD: f64 = 0.003;

/// Horizontal range of a cluster from the site origin, where the sensor
/// is mounted.
#[inline]
fn cluster_range_m(cluster: &WorldCluster) -> f64 {
    cluster.centroid.x.hypot(cluster.centroid.y)
}

/// Measurement model for one cluster: base noise widened by its range.
fn observation_model_for(cluster: &WorldCluster, params: &TuningParams) -> PositionObservation2D<f64> {
    PositionObservation2D::for_range(
        params.measurement_noise,
        cluster_range_m(cluster),
        BEAM_ANGULAR_SPREAD_RAD,
    )
}

#[inline]
fn wrap_angle(a: f64) -> f64 {
    let mut a = (a + PI) % (2.0 * PI);
    if a < 0.0 {
        a += 2.0 * PI;
    }
    a - PI
}

/// One tracked object. Owned exclusively by the [`Tracker`]; readers get
/// deep copies.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub sensor: SensorId,
    pub state: TrackState,
    /// Consecutive frames with an associated cluster.
    pub hits: u32,
    /// Consecutive frames without one.
    pub misses: u32,
    estimate: StateAndCovariance<f64, U4>,
    /// EMA-smoothed box; centre follows the Kalman position.
    pub obb: Obb,
    heading_initialized: bool,
    pub observation_count: u64,
    pub avg_length_m: f64,
    pub avg_width_m: f64,
    pub avg_height_m: f64,
    pub max_height_p95_m: f64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    /// Recent (x, y, timestamp_ns), capped at `max_track_history_length`.
    pub history: VecDeque<(f64, f64, i64)>,
    pub speed_history: VecDeque<f64>,
    pub quality: TrackQuality,
    pub classification: Option<Classification>,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
    heading_delta_sq_sum: f64,
    heading_delta_count: u64,
    speed_delta_sq_sum: f64,
    speed_delta_count: u64,
    last_heading: Option<f64>,
    last_speed: Option<f64>,
    current_occlusion_run: u32,
    avg_area_m2: f64,
    deleted_at_ns: Option<i64>,
}

impl Track {
    fn new(sensor: SensorId, cluster: &WorldCluster, now_ns: i64, params: &TuningParams) -> Self {
        let state = Vector4::new(cluster.centroid.x, cluster.centroid.y, 0.0, 0.0);
        #[rustfmt::skip]
        let covariance = Matrix4::from_diagonal(&Vector4::new(
            params.measurement_noise,
            params.measurement_noise,
            INITIAL_VELOCITY_VARIANCE,
            INITIAL_VELOCITY_VARIANCE,
        ));
        let mut history = VecDeque::new();
        history.push_back((cluster.centroid.x, cluster.centroid.y, now_ns));
        let area = cluster.obb.length_m * cluster.obb.width_m;
        Track {
            id: TrackId::new_random(),
            sensor,
            state: TrackState::Tentative,
            hits: 1,
            misses: 0,
            estimate: StateAndCovariance::new(state, covariance),
            obb: Obb {
                cx: cluster.centroid.x,
                cy: cluster.centroid.y,
                ..cluster.obb
            },
            heading_initialized: false,
            observation_count: 1,
            avg_length_m: cluster.obb.length_m,
            avg_width_m: cluster.obb.width_m,
            avg_height_m: cluster.obb.height_m,
            max_height_p95_m: cluster.height_p95,
            avg_speed_mps: 0.0,
            peak_speed_mps: 0.0,
            history,
            speed_history: VecDeque::new(),
            quality: TrackQuality::default(),
            classification: None,
            first_seen_ns: now_ns,
            last_seen_ns: now_ns,
            heading_delta_sq_sum: 0.0,
            heading_delta_count: 0,
            speed_delta_sq_sum: 0.0,
            speed_delta_count: 0,
            last_heading: None,
            last_speed: None,
            current_occlusion_run: 0,
            avg_area_m2: area,
            deleted_at_ns: None,
        }
    }

    #[inline]
    pub fn position(&self) -> (f64, f64) {
        let s = self.estimate.state();
        (s[0], s[1])
    }

    #[inline]
    pub fn velocity(&self) -> (f64, f64) {
        let s = self.estimate.state();
        (s[2], s[3])
    }

    #[inline]
    pub fn speed_mps(&self) -> f64 {
        let (vx, vy) = self.velocity();
        (vx * vx + vy * vy).sqrt()
    }

    pub fn covariance(&self) -> &Matrix4<f64> {
        self.estimate.covariance()
    }

    /// Clamp the speed magnitude while preserving direction.
    fn clamp_speed(&mut self, max_speed: f64) {
        let speed = self.speed_mps();
        if speed > max_speed && speed > 0.0 {
            let scale = max_speed / speed;
            let s = self.estimate.state();
            let clamped = Vector4::new(s[0], s[1], s[2] * scale, s[3] * scale);
            self.estimate = StateAndCovariance::new(clamped, *self.estimate.covariance());
        }
    }

    /// Clamp covariance diagonal entries so coasting cannot grow the gate
    /// without bound.
    fn clamp_covariance(&mut self, max_diag: f64) {
        let mut covariance = *self.estimate.covariance();
        let mut touched = false;
        for i in 0..4 {
            if covariance[(i, i)] > max_diag {
                covariance[(i, i)] = max_diag;
                touched = true;
            }
        }
        if touched {
            self.estimate = StateAndCovariance::new(*self.estimate.state(), covariance);
        }
    }

    fn is_finite_state(&self) -> bool {
        self.estimate.state().iter().all(|v| v.is_finite())
            && self.estimate.covariance().iter().all(|v| v.is_finite())
    }

    /// Force the track to the zero state and delete it. Applied whenever a
    /// numeric non-finite leaks into the Kalman state.
    fn reset_and_delete(&mut self, now_ns: i64) {
        self.estimate = StateAndCovariance::new(Vector4::zeros(), Matrix4::identity());
        self.state = TrackState::Deleted;
        self.deleted_at_ns = Some(now_ns);
    }

    pub fn features(&self) -> TrackFeatures {
        TrackFeatures {
            observation_count: self.observation_count,
            avg_length_m: self.avg_length_m,
            avg_width_m: self.avg_width_m,
            avg_height_m: self.avg_height_m,
            max_height_p95_m: self.max_height_p95_m,
            avg_speed_mps: self.avg_speed_mps,
            peak_speed_mps: self.peak_speed_mps,
        }
    }

    pub fn to_row(&self) -> TrackRow {
        TrackRow {
            id: self.id,
            sensor_id: self.sensor.clone(),
            state: self.state,
            observation_count: self.observation_count,
            avg_length_m: self.avg_length_m,
            avg_width_m: self.avg_width_m,
            avg_height_m: self.avg_height_m,
            max_height_p95_m: self.max_height_p95_m,
            avg_speed_mps: self.avg_speed_mps,
            peak_speed_mps: self.peak_speed_mps,
            quality: self.quality.clone(),
            classification: self.classification.clone(),
            first_seen_ns: self.first_seen_ns,
            last_seen_ns: self.last_seen_ns,
        }
    }

    fn observation_row(&self, timestamp_ns: i64) -> TrackObservationRow {
        let (x, y) = self.position();
        let (vx, vy) = self.velocity();
        TrackObservationRow {
            track_id: self.id,
            timestamp_ns,
            x,
            y,
            vx,
            vy,
            speed_mps: self.speed_mps(),
            heading_rad: self.obb.heading_rad,
            obb_length_m: self.obb.length_m,
            obb_width_m: self.obb.width_m,
            obb_height_m: self.obb.height_m,
        }
    }

    fn push_history(&mut self, now_ns: i64, params: &TuningParams) {
        let (x, y) = self.position();
        self.history.push_back((x, y, now_ns));
        while self.history.len() > params.max_track_history_length {
            self.history.pop_front();
        }
    }

    /// Direction of the most recent trail displacement of at least
    /// `HEADING_TRAIL_FLOOR_M`, if any.
    fn trail_direction(&self) -> Option<f64> {
        let &(xn, yn, _) = self.history.back()?;
        for &(x, y, _) in self.history.iter().rev().skip(1) {
            let dx = xn - x;
            let dy = yn - y;
            if (dx * dx + dy * dy).sqrt() >= HEADING_TRAIL_FLOOR_M {
                return Some(dy.atan2(dx));
            }
        }
        None
    }

    fn update_heading(&mut self, cluster: &WorldCluster, params: &TuningParams) {
        let l = cluster.obb.length_m;
        let w = cluster.obb.width_m;
        let longest = l.max(w);
        // The principal axis is only trustworthy on well-populated,
        // clearly elongated clusters.
        let pca_usable = cluster.point_count >= params.min_points_for_pca
            && longest > 0.0
            && (l - w).abs() / longest >= params.obb_aspect_ratio_lock_threshold;

        let candidate = if pca_usable {
            let mut candidate = cluster.obb.heading_rad;
            // PCA heading is 180-degree ambiguous; resolve it against the
            // direction of travel when we have one.
            let reference = if self.speed_mps() > HEADING_SPEED_FLOOR_MPS {
                let (vx, vy) = self.velocity();
                Some(vy.atan2(vx))
            } else {
                self.trail_direction()
            };
            if let Some(reference) = reference {
                if wrap_angle(candidate - reference).abs() > FRAC_PI_2 {
                    candidate = wrap_angle(candidate + PI);
                }
            }
            candidate
        } else if self.speed_mps() > HEADING_SPEED_FLOOR_MPS {
            // No usable axis (sparse or near-square cluster): the motion
            // direction is the best heading available.
            let (vx, vy) = self.velocity();
            vy.atan2(vx)
        } else {
            return;
        };

        if !self.heading_initialized {
            self.obb.heading_rad = candidate;
            self.heading_initialized = true;
        } else {
            let delta = wrap_angle(candidate - self.obb.heading_rad);
            self.obb.heading_rad = wrap_angle(
                self.obb.heading_rad + params.obb_heading_smoothing_alpha * delta,
            );
        }
    }

    fn absorb_match(
        &mut self,
        cluster: &WorldCluster,
        now_ns: i64,
        params: &TuningParams,
    ) -> MatchEvents {
        let mut events = MatchEvents::default();

        if self.current_occlusion_run > 0 {
            self.quality.occlusion_count += 1;
            self.quality.max_occlusion_frames = self
                .quality
                .max_occlusion_frames
                .max(self.current_occlusion_run);
            self.current_occlusion_run = 0;
        }

        self.hits += 1;
        self.misses = 0;
        if self.state == TrackState::Tentative && self.hits >= params.hits_to_confirm {
            self.state = TrackState::Confirmed;
            events.confirmed = true;
        }

        self.push_history(now_ns, params);
        let speed = self.speed_mps();
        self.speed_history.push_back(speed);
        while self.speed_history.len() > params.max_speed_history_length {
            self.speed_history.pop_front();
        }

        self.observation_count += 1;
        let n = self.observation_count as f64;
        self.avg_length_m += (cluster.obb.length_m - self.avg_length_m) / n;
        self.avg_width_m += (cluster.obb.width_m - self.avg_width_m) / n;
        self.avg_height_m += (cluster.obb.height_m - self.avg_height_m) / n;
        self.max_height_p95_m = self.max_height_p95_m.max(cluster.height_p95);
        self.avg_speed_mps += (speed - self.avg_speed_mps) / n;
        self.peak_speed_mps = self.peak_speed_mps.max(speed);
        self.last_seen_ns = now_ns;

        // Box smoothing: dimensions by EMA, centre pinned to the filter.
        let alpha = params.obb_heading_smoothing_alpha;
        self.obb.length_m += alpha * (cluster.obb.length_m - self.obb.length_m);
        self.obb.width_m += alpha * (cluster.obb.width_m - self.obb.width_m);
        self.obb.height_m += alpha * (cluster.obb.height_m - self.obb.height_m);
        let (px, py) = self.position();
        self.obb.cx = px;
        self.obb.cy = py;
        self.update_heading(cluster, params);

        // Quality metrics.
        if speed > HEADING_SPEED_FLOOR_MPS {
            if let Some(trail_dir) = self.trail_direction() {
                let (vx, vy) = self.velocity();
                self.quality.velocity_alignment_rad =
                    wrap_angle(vy.atan2(vx) - trail_dir).abs();
            }
        }
        if let Some(prev) = self.last_heading {
            let delta = wrap_angle(self.obb.heading_rad - prev);
            self.heading_delta_sq_sum += delta * delta;
            self.heading_delta_count += 1;
            self.quality.heading_jitter_rad =
                (self.heading_delta_sq_sum / self.heading_delta_count as f64).sqrt();
        }
        self.last_heading = Some(self.obb.heading_rad);
        if let Some(prev) = self.last_speed {
            let delta = speed - prev;
            self.speed_delta_sq_sum += delta * delta;
            self.speed_delta_count += 1;
            self.quality.speed_jitter_mps =
                (self.speed_delta_sq_sum / self.speed_delta_count as f64).sqrt();
        }
        self.last_speed = Some(speed);

        // Merge/split advisory: current cluster footprint against the
        // running average.
        let area = cluster.obb.length_m * cluster.obb.width_m;
        if self.avg_area_m2 > f64::EPSILON {
            let ratio = area / self.avg_area_m2;
            self.quality.merge_candidate = ratio > params.merge_size_ratio;
            self.quality.split_candidate = ratio < params.split_size_ratio;
        }
        self.avg_area_m2 += (area - self.avg_area_m2) / n;

        events
    }

    /// One frame without an associated cluster: coast.
    fn take_miss(&mut self, now_ns: i64, params: &TuningParams) -> bool {
        self.misses += 1;
        self.hits = 0;
        self.current_occlusion_run += 1;
        self.quality.max_occlusion_frames = self
            .quality
            .max_occlusion_frames
            .max(self.current_occlusion_run);

        let mut covariance = *self.estimate.covariance();
        for i in 0..4 {
            covariance[(i, i)] =
                (covariance[(i, i)] * params.occlusion_cov_inflation).min(params.max_covariance_diag);
        }
        self.estimate = StateAndCovariance::new(*self.estimate.state(), covariance);

        // The coasted (predicted) position still extends the trail.
        self.push_history(now_ns, params);

        let budget = match self.state {
            TrackState::Confirmed => params.max_misses_confirmed,
            _ => params.max_misses,
        };
        if self.misses >= budget {
            self.state = TrackState::Deleted;
            self.deleted_at_ns = Some(now_ns);
            true
        } else {
            false
        }
    }
}

/// Per-frame result handed to persistence.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    /// (track, cluster id) pairs that associated this frame.
    pub matched: Vec<(TrackId, u32)>,
    pub created: Vec<TrackId>,
    pub confirmed: Vec<TrackId>,
    pub deleted: Vec<TrackId>,
    /// Summary rows to upsert (confirmations and deletions).
    pub upserts: Vec<TrackRow>,
    /// One row per confirmed track for this frame.
    pub observations: Vec<TrackObservationRow>,
}

#[derive(Debug, Default)]
struct MatchEvents {
    confirmed: bool,
}

/// Owns every track for one sensor. All mutation happens on the processor
/// task; readers deep-copy through [`Tracker::snapshot_tracks`].
pub struct Tracker {
    sensor: SensorId,
    tracks: Vec<Track>,
    last_update_ns: Option<i64>,
}

impl Tracker {
    pub fn new(sensor: SensorId) -> Self {
        Tracker {
            sensor,
            tracks: Vec::new(),
            last_update_ns: None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state != TrackState::Deleted)
            .count()
    }

    /// Deep copies for readers (snapshot, queries, classifier features).
    pub fn snapshot_tracks(&self) -> Vec<Track> {
        self.tracks.clone()
    }

    /// Serialised write-back from the classifier. Idempotent.
    pub fn update_classification(&mut self, id: TrackId, classification: Classification) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(track) => {
                track.classification = Some(classification);
                true
            }
            None => false,
        }
    }

    /// Advance every track one frame and associate the frame's clusters.
    pub fn update(
        &mut self,
        clusters: &[WorldCluster],
        now_ns: i64,
        params: &TuningParams,
    ) -> TrackerOutput {
        let mut out = TrackerOutput::default();

        let dt = match self.last_update_ns {
            Some(prev) => (((now_ns - prev) as f64) / 1e9).clamp(1e-3, params.max_predict_dt),
            None => FIRST_FRAME_DT,
        };
        self.last_update_ns = Some(now_ns);

        let motion = ConstantVelocity2DModel::new(params.process_noise_pos, params.process_noise_vel)
            .calc_for_dt(dt);

        // Predict.
        use adskalman::TransitionModelLinearNoControl;
        for track in self.tracks.iter_mut() {
            if track.state == TrackState::Deleted {
                continue;
            }
            track.estimate = motion.predict(&track.estimate);
            track.clamp_covariance(params.max_covariance_diag);
            track.clamp_speed(params.max_reasonable_speed_mps);
            if !track.is_finite_state() {
                warn!("track {} went non-finite in predict; deleting", track.id);
                track.reset_and_delete(now_ns);
                out.deleted.push(track.id);
                out.upserts.push(track.to_row());
            }
        }

        // Associate.
        let eligible: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TrackState::Deleted)
            .map(|(i, _)| i)
            .collect();

        let costs: Vec<Vec<f64>> = eligible
            .iter()
            .map(|&ti| {
                let track = &self.tracks[ti];
                clusters
                    .iter()
                    .map(|cluster| association_cost(track, cluster, dt, params))
                    .collect()
            })
            .collect();
        let assignment = assign_min_cost(&costs);

        let mut track_matched = vec![false; eligible.len()];
        let mut cluster_matched = vec![false; clusters.len()];

        // Update matched tracks.
        for (row, col) in assignment {
            track_matched[row] = true;
            cluster_matched[col] = true;
            let track = &mut self.tracks[eligible[row]];
            let cluster = &clusters[col];
            let observation = Vector2::new(cluster.centroid.x, cluster.centroid.y);
            // The measurement model depends on where the cluster sits, so
            // it is rebuilt per association.
            let obs_model = observation_model_for(cluster, params);

            match obs_model.update(
                &track.estimate,
                &observation,
                CovarianceUpdateMethod::JosephForm,
            ) {
                Ok(posterior) => {
                    track.estimate = posterior;
                    track.clamp_speed(params.max_reasonable_speed_mps);
                    track.clamp_covariance(params.max_covariance_diag);
                    if !track.is_finite_state() {
                        warn!("track {} went non-finite in update; deleting", track.id);
                        track.reset_and_delete(now_ns);
                        out.deleted.push(track.id);
                        out.upserts.push(track.to_row());
                        continue;
                    }
                    let events = track.absorb_match(cluster, now_ns, params);
                    out.matched.push((track.id, cluster.cluster_id));
                    if events.confirmed {
                        debug!("track {} confirmed", track.id);
                        out.confirmed.push(track.id);
                        out.upserts.push(track.to_row());
                    }
                }
                Err(e) => {
                    // Degenerate update; treat like a reset.
                    warn!("kalman update failed for track {}: {e:?}", track.id);
                    track.reset_and_delete(now_ns);
                    out.deleted.push(track.id);
                    out.upserts.push(track.to_row());
                }
            }
        }

        // Coast unmatched tracks.
        for (row, &ti) in eligible.iter().enumerate() {
            if track_matched[row] {
                continue;
            }
            let track = &mut self.tracks[ti];
            if track.state == TrackState::Deleted {
                continue; // reset during this frame's update
            }
            if track.take_miss(now_ns, params) {
                debug!(
                    "track {} deleted after {} misses",
                    track.id, track.misses
                );
                out.deleted.push(track.id);
                out.upserts.push(track.to_row());
            }
        }

        // New tracks from unmatched clusters, within the track budget.
        let mut active = self.active_count();
        for (ci, cluster) in clusters.iter().enumerate() {
            if cluster_matched[ci] || active >= params.max_tracks {
                continue;
            }
            let mut track = Track::new(self.sensor.clone(), cluster, now_ns, params);
            if track.hits >= params.hits_to_confirm {
                track.state = TrackState::Confirmed;
                out.confirmed.push(track.id);
                out.upserts.push(track.to_row());
            }
            out.created.push(track.id);
            self.tracks.push(track);
            active += 1;
        }

        // Drop deleted tracks whose grace period expired.
        let grace_ns = (params.deleted_track_grace_period * 1e9) as i64;
        self.tracks.retain(|t| match (t.state, t.deleted_at_ns) {
            (TrackState::Deleted, Some(deleted_at)) => now_ns - deleted_at <= grace_ns,
            _ => true,
        });

        // Observation rows for every confirmed track, matched or coasting.
        for track in &self.tracks {
            if track.state == TrackState::Confirmed {
                out.observations.push(track.observation_row(now_ns));
            }
        }

        out
    }
}

/// Squared Mahalanobis distance with the gating rules applied; forbidden
/// pairs get the sentinel cost.
fn association_cost(track: &Track, cluster: &WorldCluster, dt: f64, params: &TuningParams) -> f64 {
    let (px, py) = track.position();
    let dx = cluster.centroid.x - px;
    let dy = cluster.centroid.y - py;
    let distance = (dx * dx + dy * dy).sqrt();

    if distance > params.max_position_jump_meters {
        return FORBIDDEN_COST;
    }
    if distance / dt > params.max_reasonable_speed_mps {
        return FORBIDDEN_COST;
    }

    let obs_model = observation_model_for(cluster, params);
    let p = track.estimate.covariance();
    let s = p.fixed_view::<2, 2>(0, 0) + obs_model.R();
    if s.determinant().abs() < S_DETERMINANT_FLOOR {
        return FORBIDDEN_COST;
    }
    let s_inv = match s.try_inverse() {
        Some(inv) => inv,
        None => return FORBIDDEN_COST,
    };
    let innovation = Vector2::new(dx, dy);
    let d2 = (innovation.transpose() * s_inv * innovation)[(0, 0)];
    if !d2.is_finite() || d2 > params.gating_distance_squared {
        return FORBIDDEN_COST;
    }
    d2
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_types::WorldPoint;

    fn cluster_at(x: f64, y: f64, id: u32) -> WorldCluster {
        WorldCluster {
            cluster_id: id,
            centroid: WorldPoint {
                x,
                y,
                z: 0.9,
                intensity: 80,
                timestamp_ns: 0,
                sensor_id: SensorId::new("s1"),
            },
            aabb_min: [x - 0.3, y - 0.3, 0.0],
            aabb_max: [x + 0.3, y + 0.3, 1.8],
            obb: Obb {
                cx: x,
                cy: y,
                length_m: 0.6,
                width_m: 0.4,
                height_m: 1.8,
                heading_rad: 0.0,
            },
            point_count: 30,
            intensity_mean: 80.0,
            height_p95: 1.7,
        }
    }

    fn params() -> TuningParams {
        TuningParams::recommended()
    }

    const FRAME_NS: i64 = 100_000_000;

    #[test]
    fn confirmation_happens_exactly_at_threshold() {
        let params = params();
        let mut tracker = Tracker::new(SensorId::new("s1"));

        // Frame 1 creates; hits = 1.
        let out = tracker.update(&[cluster_at(5.0, 0.0, 0)], FRAME_NS, &params);
        assert_eq!(out.created.len(), 1);
        assert!(out.confirmed.is_empty());

        // Frame 2: hits = 2, still tentative.
        let out = tracker.update(&[cluster_at(5.0, 0.1, 0)], 2 * FRAME_NS, &params);
        assert!(out.confirmed.is_empty());
        assert!(out.observations.is_empty());

        // Frame 3: hits = 3 = hits_to_confirm.
        let out = tracker.update(&[cluster_at(5.0, 0.2, 0)], 3 * FRAME_NS, &params);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.observations.len(), 1);
        assert_eq!(out.upserts.len(), 1);
        assert_eq!(out.upserts[0].state, TrackState::Confirmed);
    }

    #[test]
    fn tentative_track_dies_at_max_misses() {
        let params = params();
        let mut tracker = Tracker::new(SensorId::new("s1"));
        tracker.update(&[cluster_at(5.0, 0.0, 0)], FRAME_NS, &params);

        let mut deleted_on = None;
        for i in 0..params.max_misses + 1 {
            let now = (i as i64 + 2) * FRAME_NS;
            let out = tracker.update(&[], now, &params);
            if !out.deleted.is_empty() {
                deleted_on = Some(i + 1);
                break;
            }
        }
        assert_eq!(deleted_on, Some(params.max_misses));
    }

    #[test]
    fn confirmed_track_survives_occlusion_gap() {
        let mut params = params();
        params.hits_to_confirm = 2;
        let mut tracker = Tracker::new(SensorId::new("s1"));

        let mut now = 0i64;
        let mut step = |tracker: &mut Tracker, clusters: &[WorldCluster]| {
            now += FRAME_NS;
            tracker.update(clusters, now, &params)
        };

        step(&mut tracker, &[cluster_at(0.0, 0.0, 0)]);
        step(&mut tracker, &[cluster_at(0.1, 0.0, 0)]);
        let id = tracker.snapshot_tracks()[0].id;

        // Eight coasted frames (below max_misses_confirmed = 15).
        for _ in 0..8 {
            let out = step(&mut tracker, &[]);
            assert!(out.deleted.is_empty());
            // Confirmed tracks keep emitting observations while coasting.
            assert_eq!(out.observations.len(), 1);
        }

        // Reacquire: same identity, occlusion accounted.
        let out = step(&mut tracker, &[cluster_at(0.9, 0.0, 0)]);
        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].0, id);
        let track = &tracker.snapshot_tracks()[0];
        assert_eq!(track.quality.occlusion_count, 1);
        assert_eq!(track.quality.max_occlusion_frames, 8);
    }

    #[test]
    fn association_is_unique_per_cluster_and_track() {
        let params = params();
        let mut tracker = Tracker::new(SensorId::new("s1"));
        let clusters = [
            cluster_at(0.0, 0.0, 0),
            cluster_at(4.0, 0.0, 1),
            cluster_at(0.0, 4.0, 2),
        ];
        tracker.update(&clusters, FRAME_NS, &params);
        let out = tracker.update(&clusters, 2 * FRAME_NS, &params);

        let mut track_ids: Vec<_> = out.matched.iter().map(|(t, _)| *t).collect();
        let mut cluster_ids: Vec<_> = out.matched.iter().map(|(_, c)| *c).collect();
        track_ids.sort();
        track_ids.dedup();
        cluster_ids.sort();
        cluster_ids.dedup();
        assert_eq!(track_ids.len(), out.matched.len());
        assert_eq!(cluster_ids.len(), out.matched.len());
    }

    #[test]
    fn speed_stays_clamped() {
        let mut params = params();
        params.max_reasonable_speed_mps = 10.0;
        params.max_position_jump_meters = 50.0;
        params.gating_distance_squared = 1e9;
        let mut tracker = Tracker::new(SensorId::new("s1"));

        // Teleporting cluster tries to induce a huge velocity.
        let mut x = 0.0;
        for i in 1..=20i64 {
            x += 0.9; // 9 m/s, inside the jump gate
            tracker.update(&[cluster_at(x, 0.0, 0)], i * FRAME_NS, &params);
            for track in tracker.snapshot_tracks() {
                assert!(track.speed_mps() <= params.max_reasonable_speed_mps + 1e-9);
            }
        }
    }

    #[test]
    fn non_finite_state_resets_to_deleted() {
        let params = params();
        let mut tracker = Tracker::new(SensorId::new("s1"));
        tracker.update(&[cluster_at(1.0, 1.0, 0)], FRAME_NS, &params);

        tracker.tracks[0].estimate = StateAndCovariance::new(
            Vector4::new(f64::NAN, 0.0, 0.0, 0.0),
            Matrix4::identity(),
        );
        let out = tracker.update(&[], 2 * FRAME_NS, &params);
        assert_eq!(out.deleted.len(), 1);
        let track = &tracker.snapshot_tracks()[0];
        assert_eq!(track.state, TrackState::Deleted);
        assert!(track.is_finite_state());
    }

    #[test]
    fn deleted_track_removed_after_grace() {
        let mut params = params();
        params.deleted_track_grace_period = 0.5;
        let mut tracker = Tracker::new(SensorId::new("s1"));
        tracker.update(&[cluster_at(1.0, 1.0, 0)], FRAME_NS, &params);

        let mut now = FRAME_NS;
        for _ in 0..params.max_misses {
            now += FRAME_NS;
            tracker.update(&[], now, &params);
        }
        assert_eq!(tracker.snapshot_tracks().len(), 1);

        now += 600_000_000;
        tracker.update(&[], now, &params);
        assert!(tracker.snapshot_tracks().is_empty());
    }

    #[test]
    fn track_budget_is_respected() {
        let mut params = params();
        params.max_tracks = 2;
        let mut tracker = Tracker::new(SensorId::new("s1"));
        let clusters: Vec<_> = (0..5).map(|i| cluster_at(i as f64 * 10.0, 0.0, i)).collect();
        let out = tracker.update(&clusters, FRAME_NS, &params);
        assert_eq!(out.created.len(), 2);
        assert_eq!(tracker.active_count(), 2);
    }

    #[test]
    fn raising_confirm_threshold_midstream_delays_promotion() {
        let mut params = params();
        params.hits_to_confirm = 30; // out of reach at first
        let mut tracker = Tracker::new(SensorId::new("s1"));

        let mut now = 0i64;
        for _ in 0..4 {
            now += FRAME_NS;
            tracker.update(&[cluster_at(2.0, 0.0, 0)], now, &params);
        }
        assert_eq!(tracker.snapshot_tracks()[0].hits, 4);
        assert_eq!(tracker.snapshot_tracks()[0].state, TrackState::Tentative);

        // The reload: threshold becomes 5 while hits are already 4.
        params.hits_to_confirm = 5;
        now += FRAME_NS;
        let out = tracker.update(&[cluster_at(2.0, 0.0, 0)], now, &params);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(tracker.snapshot_tracks()[0].state, TrackState::Confirmed);
    }

    #[test]
    fn heading_follows_velocity_after_disambiguation() {
        let mut params = params();
        params.hits_to_confirm = 2;
        params.min_points_for_pca = 4;
        let mut tracker = Tracker::new(SensorId::new("s1"));

        // Move along +Y at 2 m/s; PCA heading is reported pointing the
        // wrong way (-Y).
        let mut now = 0i64;
        for i in 0..20 {
            now += FRAME_NS;
            let mut c = cluster_at(0.0, i as f64 * 0.2, 0);
            c.obb.length_m = 1.0;
            c.obb.width_m = 0.4;
            c.obb.heading_rad = -FRAC_PI_2; // 180 degrees off
            tracker.update(&[c], now, &params);
        }
        let track = &tracker.snapshot_tracks()[0];
        assert!(track.speed_mps() > 0.5);
        let (vx, vy) = track.velocity();
        let velocity_dir = vy.atan2(vx);
        assert!(
            wrap_angle(track.obb.heading_rad - velocity_dir).abs() <= FRAC_PI_2,
            "heading {} vs velocity {}",
            track.obb.heading_rad,
            velocity_dir
        );
    }

    #[test]
    fn classification_update_is_idempotent() {
        let params = params();
        let mut tracker = Tracker::new(SensorId::new("s1"));
        tracker.update(&[cluster_at(1.0, 1.0, 0)], FRAME_NS, &params);
        let id = tracker.snapshot_tracks()[0].id;

        let classification = Classification {
            class: verge_types::ObjectClass::Pedestrian,
            confidence: 0.8,
            model: "rules-v1".to_string(),
        };
        assert!(tracker.update_classification(id, classification.clone()));
        let once = tracker.snapshot_tracks()[0].clone();
        assert!(tracker.update_classification(id, classification));
        let twice = tracker.snapshot_tracks()[0].clone();
        assert_eq!(once.classification, twice.classification);
        assert_eq!(once.observation_count, twice.observation_count);
    }
}
