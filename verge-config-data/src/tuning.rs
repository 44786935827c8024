use serde::{Deserialize, Serialize};

use crate::{invalid, Result};

/// The explicitly enumerated set of numeric options.
///
/// Every key must be present in the loaded JSON document; there are no
/// fallback defaults in component code. Durations are seconds unless the
/// key name carries a unit suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningParams {
    // Background model.
    /// Relative noise floor: sigma is never below `noise_relative * mu`.
    pub noise_relative: f64,
    pub closeness_multiplier: f64,
    pub safety_margin_meters: f64,
    /// Same-ring neighbours that must also disagree with their background
    /// before a foreground verdict is reported.
    pub neighbor_confirmation_count: u32,
    pub warmup_duration_nanos: u64,
    pub warmup_min_frames: u32,
    pub background_update_fraction: f64,
    /// Learning rate after a cell has been frozen once.
    pub post_settle_update_fraction: f64,
    /// Seed a cell's mean from its first observation instead of zero.
    pub seed_from_first: bool,

    // Clustering.
    pub foreground_dbscan_eps: f64,
    pub foreground_min_cluster_points: usize,
    pub foreground_max_input_points: usize,
    pub min_cluster_diameter: f64,
    pub max_cluster_diameter: f64,
    pub max_cluster_aspect_ratio: f64,

    // Frame builder.
    pub enable_time_based: bool,
    /// Seconds a completed frame may wait in the hand-off buffer before the
    /// cleanup pass finalises it.
    pub buffer_timeout: f64,
    pub min_frame_points: usize,

    // Persistence.
    /// Seconds between background snapshot flushes.
    pub flush_interval: f64,
    /// Enables the periodic background snapshot flusher.
    pub background_flush: bool,

    // Tracker lifecycle.
    pub gating_distance_squared: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub measurement_noise: f64,
    pub occlusion_cov_inflation: f64,
    pub hits_to_confirm: u32,
    pub max_misses: u32,
    pub max_misses_confirmed: u32,
    pub max_tracks: usize,
    /// Seconds a deleted track is retained before removal.
    pub deleted_track_grace_period: f64,

    // Tracker kinematics.
    pub max_reasonable_speed_mps: f64,
    pub max_position_jump_meters: f64,
    /// Seconds; prediction steps are clamped to this.
    pub max_predict_dt: f64,
    pub max_covariance_diag: f64,
    pub min_points_for_pca: usize,
    pub obb_heading_smoothing_alpha: f64,
    /// Below this relative length/width difference the principal axis is
    /// ambiguous and heading updates are skipped.
    pub obb_aspect_ratio_lock_threshold: f64,
    pub max_track_history_length: usize,
    pub max_speed_history_length: usize,
    pub merge_size_ratio: f64,
    pub split_size_ratio: f64,

    // Geometric filter.
    pub height_band_floor: f64,
    pub height_band_ceiling: f64,
    pub remove_ground: bool,

    // Misc.
    pub min_observations_for_classification: u64,
    pub enable_diagnostics: bool,
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return invalid(format!("{name} must be within [0, 1], got {value}"));
    }
    Ok(())
}

fn check_duration_secs(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return invalid(format!("{name} must be a non-negative duration, got {value}"));
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return invalid(format!("{name} must be positive, got {value}"));
    }
    Ok(())
}

impl TuningParams {
    pub fn validate(&self) -> Result<()> {
        check_fraction("noise_relative", self.noise_relative)?;
        check_fraction("background_update_fraction", self.background_update_fraction)?;
        check_fraction(
            "post_settle_update_fraction",
            self.post_settle_update_fraction,
        )?;
        check_positive("closeness_multiplier", self.closeness_multiplier)?;
        if !self.safety_margin_meters.is_finite() || self.safety_margin_meters < 0.0 {
            return invalid("safety_margin_meters must be non-negative");
        }

        check_positive("foreground_dbscan_eps", self.foreground_dbscan_eps)?;
        if self.foreground_min_cluster_points == 0 {
            return invalid("foreground_min_cluster_points must be at least 1");
        }
        if self.foreground_max_input_points == 0 {
            return invalid("foreground_max_input_points must be at least 1");
        }
        check_positive("min_cluster_diameter", self.min_cluster_diameter)?;
        check_positive("max_cluster_diameter", self.max_cluster_diameter)?;
        if self.min_cluster_diameter >= self.max_cluster_diameter {
            return invalid("min_cluster_diameter must be below max_cluster_diameter");
        }
        if !self.max_cluster_aspect_ratio.is_finite() || self.max_cluster_aspect_ratio < 1.0 {
            return invalid("max_cluster_aspect_ratio must be at least 1");
        }

        check_duration_secs("buffer_timeout", self.buffer_timeout)?;
        check_duration_secs("flush_interval", self.flush_interval)?;
        check_duration_secs("deleted_track_grace_period", self.deleted_track_grace_period)?;
        check_duration_secs("max_predict_dt", self.max_predict_dt)?;

        check_positive("gating_distance_squared", self.gating_distance_squared)?;
        check_positive("process_noise_pos", self.process_noise_pos)?;
        check_positive("process_noise_vel", self.process_noise_vel)?;
        check_positive("measurement_noise", self.measurement_noise)?;
        check_positive("occlusion_cov_inflation", self.occlusion_cov_inflation)?;
        if self.max_tracks == 0 {
            return invalid("max_tracks must be at least 1");
        }

        check_positive("max_reasonable_speed_mps", self.max_reasonable_speed_mps)?;
        check_positive("max_position_jump_meters", self.max_position_jump_meters)?;
        check_positive("max_covariance_diag", self.max_covariance_diag)?;
        if self.obb_heading_smoothing_alpha <= 0.0 || self.obb_heading_smoothing_alpha > 1.0 {
            return invalid("obb_heading_smoothing_alpha must be within (0, 1]");
        }
        check_fraction(
            "obb_aspect_ratio_lock_threshold",
            self.obb_aspect_ratio_lock_threshold,
        )?;
        if self.max_track_history_length == 0 || self.max_speed_history_length == 0 {
            return invalid("history lengths must be at least 1");
        }
        check_positive("merge_size_ratio", self.merge_size_ratio)?;
        check_positive("split_size_ratio", self.split_size_ratio)?;
        if self.split_size_ratio >= self.merge_size_ratio {
            return invalid("split_size_ratio must be below merge_size_ratio");
        }

        if !self.height_band_floor.is_finite() || !self.height_band_ceiling.is_finite() {
            return invalid("height band bounds must be finite");
        }
        if self.height_band_floor >= self.height_band_ceiling {
            return invalid("height_band_floor must be below height_band_ceiling");
        }

        Ok(())
    }

    /// A complete, valid parameter set with the values we deploy with.
    ///
    /// Used by the `verge-default-config` generator and by tests; never as
    /// an implicit fallback.
    pub fn recommended() -> Self {
        TuningParams {
            noise_relative: 0.02,
            closeness_multiplier: 3.0,
            safety_margin_meters: 0.05,
            neighbor_confirmation_count: 2,
            warmup_duration_nanos: 30_000_000_000,
            warmup_min_frames: 50,
            background_update_fraction: 0.02,
            post_settle_update_fraction: 0.005,
            seed_from_first: true,

            foreground_dbscan_eps: 0.5,
            foreground_min_cluster_points: 4,
            foreground_max_input_points: 20_000,
            min_cluster_diameter: 0.1,
            max_cluster_diameter: 15.0,
            max_cluster_aspect_ratio: 8.0,

            enable_time_based: true,
            buffer_timeout: 0.5,
            min_frame_points: 1000,

            flush_interval: 60.0,
            background_flush: true,

            gating_distance_squared: 9.21,
            process_noise_pos: 0.1,
            process_noise_vel: 0.5,
            measurement_noise: 0.05,
            occlusion_cov_inflation: 1.3,
            hits_to_confirm: 3,
            max_misses: 5,
            max_misses_confirmed: 15,
            max_tracks: 64,
            deleted_track_grace_period: 2.0,

            max_reasonable_speed_mps: 60.0,
            max_position_jump_meters: 5.0,
            max_predict_dt: 1.0,
            max_covariance_diag: 100.0,
            min_points_for_pca: 8,
            obb_heading_smoothing_alpha: 0.3,
            obb_aspect_ratio_lock_threshold: 0.1,
            max_track_history_length: 200,
            max_speed_history_length: 50,
            merge_size_ratio: 2.5,
            split_size_ratio: 0.4,

            height_band_floor: 0.05,
            height_band_ceiling: 3.5,
            remove_ground: true,

            min_observations_for_classification: 10,
            enable_diagnostics: false,
        }
    }
}
