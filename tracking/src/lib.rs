pub mod motion_model_2d;
pub mod observation_model_2d;

pub use motion_model_2d::{ConstantVelocity2DModel, MotionModel2DFixedDt};
pub use observation_model_2d::PositionObservation2D;

#[cfg(test)]
mod tests {
    use adskalman::{ObservationModel, StateAndCovariance, TransitionModelLinearNoControl};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector2, Vector4};

    use crate::{ConstantVelocity2DModel, PositionObservation2D};

    #[test]
    fn predict_moves_state_and_grows_covariance() {
        let model = ConstantVelocity2DModel::new(0.1, 0.01);
        let fixed = model.calc_for_dt(0.5);

        let state = Vector4::new(1.0, 2.0, 2.0, -4.0);
        let covariance = Matrix4::identity();
        let prior = fixed.predict(&StateAndCovariance::new(state, covariance));

        assert_relative_eq!(prior.state()[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(prior.state()[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(prior.state()[2], 2.0, epsilon = 1e-12);
        assert_relative_eq!(prior.state()[3], -4.0, epsilon = 1e-12);

        // F P F' + Q must exceed the prior position variance.
        assert!(prior.covariance()[(0, 0)] > 1.0);
        assert!(prior.covariance()[(2, 2)] > 1.0);
    }

    #[test]
    fn process_noise_scales_with_dt() {
        let model = ConstantVelocity2DModel::new(0.2, 0.05);
        let short = model.calc_for_dt(0.1);
        let long = model.calc_for_dt(1.0);
        assert_relative_eq!(short.Q()[(0, 0)] * 10.0, long.Q()[(0, 0)], epsilon = 1e-12);
        assert_relative_eq!(short.Q()[(2, 2)] * 10.0, long.Q()[(2, 2)], epsilon = 1e-12);
    }

    #[test]
    fn measurement_noise_widens_with_range() {
        let near = PositionObservation2D::for_range(0.05, 5.0, 0.003);
        let far = PositionObservation2D::for_range(0.05, 80.0, 0.003);
        let (near_x, near_y) = near.noise_variances();
        let (far_x, far_y) = far.noise_variances();
        assert_relative_eq!(near_x, near_y, epsilon = 1e-12);
        assert_relative_eq!(near_x, 0.05 + 0.015f64.powi(2), epsilon = 1e-12);
        assert!(far_x > near_x);
        assert_relative_eq!(far_y, 0.05 + 0.24f64.powi(2), epsilon = 1e-12);
    }

    #[test]
    fn update_pulls_state_toward_observation() {
        let model = ConstantVelocity2DModel::new(0.1, 0.01);
        let fixed = model.calc_for_dt(0.1);
        let obs_model = PositionObservation2D::new(0.01);

        let state = Vector4::new(0.0, 0.0, 0.0, 0.0);
        let covariance = Matrix4::identity();
        let prior = fixed.predict(&StateAndCovariance::new(state, covariance));

        let observation = Vector2::new(1.0, -1.0);
        let posterior = obs_model
            .update(&prior, &observation, adskalman::CovarianceUpdateMethod::JosephForm)
            .unwrap();

        assert!(posterior.state()[0] > 0.9);
        assert!(posterior.state()[1] < -0.9);
        // Posterior variance shrinks after an observation.
        assert!(posterior.covariance()[(0, 0)] < prior.covariance()[(0, 0)]);
    }
}
