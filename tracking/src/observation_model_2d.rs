use nalgebra::core::dimension::{U2, U4};
use nalgebra::{OMatrix, OVector, RealField};

use adskalman::ObservationModel;

/// position-only linear observation model for the planar motion model
///
/// Observes [x y] out of the state vector [x y xvel yvel]. Measurement
/// noise is diagonal and can be widened with range, since a scanning
/// sensor's lateral position error grows as range times beam spread.
#[derive(Debug)]
pub struct PositionObservation2D<R: RealField> {
    observation_matrix: OMatrix<R, U2, U4>,
    observation_matrix_transpose: OMatrix<R, U4, U2>,
    observation_noise_covariance: OMatrix<R, U2, U2>,
}

impl<R: RealField + Copy> PositionObservation2D<R> {
    /// Isotropic measurement noise with variance `measurement_noise`.
    pub fn new(measurement_noise: R) -> Self {
        Self::from_variances(measurement_noise, measurement_noise)
    }

    /// Noise widened for a target at `range`: the beam subtends
    /// `range * angular_spread_rad` laterally, and that spread adds to the
    /// base variance in quadrature.
    pub fn for_range(base_variance: R, range: R, angular_spread_rad: R) -> Self {
        let lateral = range * angular_spread_rad;
        let variance = base_variance + lateral * lateral;
        Self::from_variances(variance, variance)
    }

    pub fn from_variances(var_x: R, var_y: R) -> Self {
        // A rectangular identity selects the leading position components
        // of the state.
        let observation_matrix = OMatrix::<R, U2, U4>::identity();
        let observation_matrix_transpose = observation_matrix.transpose();
        let observation_noise_covariance =
            OMatrix::<R, U2, U2>::from_diagonal(&OVector::<R, U2>::new(var_x, var_y));
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }

    /// The diagonal of R, as (var_x, var_y).
    pub fn noise_variances(&self) -> (R, R) {
        (
            self.observation_noise_covariance[(0, 0)],
            self.observation_noise_covariance[(1, 1)],
        )
    }
}

impl<R: RealField> ObservationModel<R, U4, U2> for PositionObservation2D<R> {
    fn H(&self) -> &OMatrix<R, U2, U4> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<R, U4, U2> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &OMatrix<R, U2, U2> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<R, U4>) -> OVector<R, U2> {
        &self.observation_matrix * state
    }
}
