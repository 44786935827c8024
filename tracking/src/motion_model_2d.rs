use num_traits::{One, Zero};

use nalgebra::core::dimension::U4;
use nalgebra::{OMatrix, RealField};

use adskalman::TransitionModelLinearNoControl;

/// constant velocity planar motion model parameterized by `dt`
///
/// The important method is `calc_for_dt()`. Calling this
/// returns a motion model for a specific `dt`.
///
/// The state vector is [x y xvel yvel].
#[derive(Debug, Clone)]
pub struct ConstantVelocity2DModel<R: RealField> {
    process_noise_pos: R,
    process_noise_vel: R,
}

impl<R: RealField + Copy> ConstantVelocity2DModel<R> {
    pub fn new(process_noise_pos: R, process_noise_vel: R) -> Self {
        Self {
            process_noise_pos,
            process_noise_vel,
        }
    }

    /// For a given `dt`, create a new instance of the motion model.
    pub fn calc_for_dt(&self, dt: R) -> MotionModel2DFixedDt<R> {
        let zero: R = Zero::zero();
        let one: R = One::one();

        // Create transition model. 2D position and 2D velocity.
        // This is "A" in most Kalman filter descriptions.
        #[rustfmt::skip]
        let transition_model = OMatrix::<R,U4,U4>::new(
                          one, zero,   dt, zero,
                         zero,  one, zero,   dt,
                         zero, zero,  one, zero,
                         zero, zero, zero,  one);
        let transition_model_transpose = transition_model.transpose();

        // Diagonal process noise scaled by dt, position and velocity
        // components weighted independently. This is "Q" in most Kalman
        // filter descriptions.
        let qp = self.process_noise_pos * dt;
        let qv = self.process_noise_vel * dt;
        #[rustfmt::skip]
        let transition_noise_covariance = OMatrix::<R,U4,U4>::new(
                          qp, zero, zero, zero,
                        zero,   qp, zero, zero,
                        zero, zero,   qv, zero,
                        zero, zero, zero,   qv);
        MotionModel2DFixedDt {
            transition_model,
            transition_model_transpose,
            transition_noise_covariance,
        }
    }
}

/// constant velocity planar motion model for fixed dt
///
/// The state vector is [x y xvel yvel]
#[derive(Debug)]
pub struct MotionModel2DFixedDt<R: RealField> {
    transition_model: OMatrix<R, U4, U4>,
    transition_model_transpose: OMatrix<R, U4, U4>,
    transition_noise_covariance: OMatrix<R, U4, U4>,
}

impl<R: RealField> TransitionModelLinearNoControl<R, U4> for MotionModel2DFixedDt<R> {
    fn F(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_model
    }
    fn FT(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_noise_covariance
    }
}
