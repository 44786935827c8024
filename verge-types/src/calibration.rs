use serde::{Deserialize, Serialize};

use crate::RING_COUNT;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("expected {expected} ring elevations, got {actual}")]
    WrongRingCount { expected: usize, actual: usize },
}

/// Per-ring elevation angles for one sensor model.
///
/// The sensor fires its rings in an interleaved pattern, so the elevation
/// table is not monotonic in ring index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingCalibration {
    /// Elevation of each ring above the sensor's horizontal plane, degrees.
    pub elevations_deg: Vec<f32>,
}

impl RingCalibration {
    /// Factory calibration for the 16-ring sensor model.
    pub fn sr16() -> Self {
        RingCalibration {
            elevations_deg: vec![
                -15.0, 1.0, -13.0, 3.0, -11.0, 5.0, -9.0, 7.0, -7.0, 9.0, -5.0, 11.0, -3.0, 13.0,
                -1.0, 15.0,
            ],
        }
    }

    /// Load a site-specific calibration from a JSON file.
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, CalibrationError> {
        let buf = std::fs::read_to_string(path)?;
        let cal: RingCalibration = serde_json::from_str(&buf)?;
        cal.validate()?;
        Ok(cal)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.elevations_deg.len() != RING_COUNT {
            return Err(CalibrationError::WrongRingCount {
                expected: RING_COUNT,
                actual: self.elevations_deg.len(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn elevation_deg(&self, ring: u8) -> f32 {
        self.elevations_deg[ring as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_calibration_is_valid() {
        let cal = RingCalibration::sr16();
        cal.validate().unwrap();
        assert_eq!(cal.elevations_deg.len(), RING_COUNT);
        // Interleaved table: ring 0 looks down, ring 15 looks up.
        assert!(cal.elevation_deg(0) < 0.0);
        assert!(cal.elevation_deg(15) > 0.0);
    }

    #[test]
    fn wrong_ring_count_rejected() {
        let cal = RingCalibration {
            elevations_deg: vec![0.0; 8],
        };
        assert!(matches!(
            cal.validate(),
            Err(CalibrationError::WrongRingCount { .. })
        ));
    }
}
