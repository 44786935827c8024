use nalgebra::{Matrix4, Vector4};

use verge_config_data::TuningParams;
use verge_types::{PointPolar, RingCalibration, SensorId, WorldPoint};

use crate::{Error, Result};

/// Points within this band above the estimated ground plane are removed
/// when ground removal is enabled.
const GROUND_BAND_M: f64 = 0.15;

/// Affine sensor-to-world pose.
#[derive(Debug, Clone)]
pub struct SensorPose {
    matrix: Matrix4<f64>,
}

impl Default for SensorPose {
    fn default() -> Self {
        Self::identity()
    }
}

impl SensorPose {
    pub fn identity() -> Self {
        SensorPose {
            matrix: Matrix4::identity(),
        }
    }

    /// Build from 16 row-major entries as carried in the config file.
    pub fn from_row_major(entries: &[f64]) -> Result<Self> {
        if entries.len() != 16 {
            return Err(Error::InvalidPose {
                what: format!("expected 16 entries, got {}", entries.len()),
            });
        }
        if entries.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidPose {
                what: "entries must be finite".to_string(),
            });
        }
        Ok(SensorPose {
            matrix: Matrix4::from_row_slice(entries),
        })
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        let v = &self.matrix * Vector4::new(x, y, z, 1.0);
        (v[0], v[1], v[2])
    }
}

/// Spherical to Cartesian in the sensor frame: X forward, Y right, Z up.
#[inline]
pub fn polar_to_sensor(pt: &PointPolar, calibration: &RingCalibration) -> (f64, f64, f64) {
    let elevation = (calibration.elevation_deg(pt.ring) as f64).to_radians();
    let azimuth = (pt.azimuth_deg as f64).to_radians();
    let d = pt.distance_m as f64;
    let horizontal = d * elevation.cos();
    (
        horizontal * azimuth.cos(),
        horizontal * azimuth.sin(),
        d * elevation.sin(),
    )
}

/// Transform foreground polar returns into world points and apply the
/// height-band and ground filters.
pub fn transform_and_filter(
    points: &[PointPolar],
    sensor: &SensorId,
    calibration: &RingCalibration,
    pose: &SensorPose,
    params: &TuningParams,
) -> Vec<WorldPoint> {
    let mut world: Vec<WorldPoint> = points
        .iter()
        .filter_map(|pt| {
            let (sx, sy, sz) = polar_to_sensor(pt, calibration);
            let (x, y, z) = pose.apply(sx, sy, sz);
            if z < params.height_band_floor || z > params.height_band_ceiling {
                return None;
            }
            Some(WorldPoint {
                x,
                y,
                z,
                intensity: pt.intensity,
                timestamp_ns: pt.timestamp_ns,
                sensor_id: sensor.clone(),
            })
        })
        .collect();

    if params.remove_ground && !world.is_empty() {
        // Estimate the local ground height as the 5th percentile of z and
        // drop points hugging it.
        let mut heights: Vec<f64> = world.iter().map(|p| p.z).collect();
        heights.sort_unstable_by(f64::total_cmp);
        let ground_z = heights[(heights.len() - 1) / 20];
        world.retain(|p| p.z > ground_z + GROUND_BAND_M);
    }

    world
}
