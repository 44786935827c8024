//! Rule-based object classification from aggregate track features.

use verge_types::{Classification, ObjectClass};

/// Tag recorded with every classification result.
pub const MODEL_TAG: &str = "rules-v1";

/// Aggregate features the rules consume; a cheap projection of a track.
#[derive(Debug, Clone, Copy)]
pub struct TrackFeatures {
    pub observation_count: u64,
    pub avg_length_m: f64,
    pub avg_width_m: f64,
    pub avg_height_m: f64,
    pub max_height_p95_m: f64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
}

/// Classify a track once it has accumulated enough observations.
///
/// Deterministic, so re-applying the result to a track is idempotent.
pub fn classify(features: &TrackFeatures, min_observations: u64) -> Option<Classification> {
    if features.observation_count < min_observations {
        return None;
    }

    let f = features;
    let (class, confidence) = if is_bird(f) {
        (ObjectClass::Bird, 0.5 + 0.2 * airborne_margin(f))
    } else if is_pedestrian(f) {
        (ObjectClass::Pedestrian, 0.6 + 0.3 * pedestrian_margin(f))
    } else if is_car(f) {
        (ObjectClass::Car, 0.6 + 0.3 * car_margin(f))
    } else {
        (ObjectClass::Other, 0.3)
    };

    Some(Classification {
        class,
        confidence: confidence.clamp(0.0, 1.0),
        model: MODEL_TAG.to_string(),
    })
}

fn is_pedestrian(f: &TrackFeatures) -> bool {
    f.avg_length_m < 1.2
        && f.avg_width_m < 1.2
        && (0.3..=2.3).contains(&f.max_height_p95_m)
        && f.avg_speed_mps < 3.5
        && f.peak_speed_mps < 6.0
}

fn pedestrian_margin(f: &TrackFeatures) -> f64 {
    // Walking pace near 1.4 m/s is the strongest signal.
    1.0 - ((f.avg_speed_mps - 1.4).abs() / 3.0).min(1.0)
}

fn is_car(f: &TrackFeatures) -> bool {
    (2.0..=8.0).contains(&f.avg_length_m)
        && (1.2..=3.0).contains(&f.avg_width_m)
        && f.max_height_p95_m < 3.0
}

fn car_margin(f: &TrackFeatures) -> f64 {
    let length_fit = 1.0 - ((f.avg_length_m - 4.5).abs() / 4.0).min(1.0);
    let moving = (f.avg_speed_mps / 10.0).min(1.0);
    (length_fit + moving) / 2.0
}

fn is_bird(f: &TrackFeatures) -> bool {
    f.avg_length_m < 0.7 && f.avg_width_m < 0.7 && f.max_height_p95_m > 2.3
}

fn airborne_margin(f: &TrackFeatures) -> f64 {
    ((f.max_height_p95_m - 2.3) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> TrackFeatures {
        TrackFeatures {
            observation_count: 20,
            avg_length_m: 0.5,
            avg_width_m: 0.5,
            avg_height_m: 1.6,
            max_height_p95_m: 1.7,
            avg_speed_mps: 1.3,
            peak_speed_mps: 2.0,
        }
    }

    #[test]
    fn below_observation_floor_is_unclassified() {
        let f = features();
        assert!(classify(&f, 30).is_none());
        assert!(classify(&f, 10).is_some());
    }

    #[test]
    fn walker_is_pedestrian() {
        let result = classify(&features(), 10).unwrap();
        assert_eq!(result.class, ObjectClass::Pedestrian);
        assert!(result.confidence > 0.6);
        assert_eq!(result.model, MODEL_TAG);
    }

    #[test]
    fn sedan_is_car() {
        let f = TrackFeatures {
            observation_count: 40,
            avg_length_m: 4.6,
            avg_width_m: 1.9,
            avg_height_m: 1.4,
            max_height_p95_m: 1.5,
            avg_speed_mps: 12.0,
            peak_speed_mps: 15.0,
        };
        let result = classify(&f, 10).unwrap();
        assert_eq!(result.class, ObjectClass::Car);
    }

    #[test]
    fn small_high_object_is_bird() {
        let f = TrackFeatures {
            observation_count: 15,
            avg_length_m: 0.3,
            avg_width_m: 0.2,
            avg_height_m: 0.2,
            max_height_p95_m: 3.2,
            avg_speed_mps: 6.0,
            peak_speed_mps: 9.0,
        };
        let result = classify(&f, 10).unwrap();
        assert_eq!(result.class, ObjectClass::Bird);
    }

    #[test]
    fn classification_is_deterministic() {
        let f = features();
        assert_eq!(classify(&f, 10), classify(&f, 10));
    }
}
