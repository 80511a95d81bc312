//! Stateless, batch-oriented linear Kalman filter over an 8-dimensional constant-velocity
//! box state `[cx, cy, w, h, vx, vy, vw, vh]`, measured against a 4-dimensional `[cx, cy, w, h]`
//! observation.
//!
//! Unlike a per-track filter object, every operation here takes and returns plain slices
//! of means/covariances: the track storage owns the state, this module only knows the
//! linear-algebra. Process and measurement noise are scaled by the track's current box
//! size, the standard choice for pixel-space box tracking.

use nalgebra::{SMatrix, SVector};

pub type Mean = SVector<f64, 8>;
pub type Cov = SMatrix<f64, 8, 8>;

#[derive(Clone, Copy, Debug)]
pub struct KalmanFilterXywh {
    std_weight_position: f64,
    std_weight_velocity: f64,
}

impl Default for KalmanFilterXywh {
    fn default() -> Self {
        Self {
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }
}

impl KalmanFilterXywh {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition_matrix() -> SMatrix<f64, 8, 8> {
        let mut f = SMatrix::<f64, 8, 8>::identity();
        f[(0, 4)] = 1.0;
        f[(1, 5)] = 1.0;
        f[(2, 6)] = 1.0;
        f[(3, 7)] = 1.0;
        f
    }

    fn measurement_matrix() -> SMatrix<f64, 4, 8> {
        let mut h = SMatrix::<f64, 4, 8>::zeros();
        for i in 0..4 {
            h[(i, i)] = 1.0;
        }
        h
    }

    /// Builds the initial mean/covariance for a freshly observed box. Velocity starts at
    /// zero; the covariance is wide on velocity and proportionally tighter on position.
    pub fn initiate(&self, bbox_xywh: [f64; 4]) -> (Mean, Cov) {
        let mut mean = Mean::zeros();
        mean[0] = bbox_xywh[0];
        mean[1] = bbox_xywh[1];
        mean[2] = bbox_xywh[2];
        mean[3] = bbox_xywh[3];

        let w = bbox_xywh[2];
        let h = bbox_xywh[3];
        let std = [
            2.0 * self.std_weight_position * w,
            2.0 * self.std_weight_position * h,
            2.0 * self.std_weight_position * w,
            2.0 * self.std_weight_position * h,
            10.0 * self.std_weight_velocity * w,
            10.0 * self.std_weight_velocity * h,
            10.0 * self.std_weight_velocity * w,
            10.0 * self.std_weight_velocity * h,
        ];
        let diag = SVector::<f64, 8>::from_iterator(std.iter().map(|s| s * s));
        (mean, Cov::from_diagonal(&diag))
    }

    fn process_noise(&self, mean: &Mean) -> Cov {
        let w = mean[2];
        let h = mean[3];
        let std_pos = [
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
        ];
        let std_vel = [
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
        ];
        let mut q_diag = [0.0; 8];
        q_diag[..4].copy_from_slice(&std_pos.map(|s| s * s));
        q_diag[4..].copy_from_slice(&std_vel.map(|s| s * s));
        Cov::from_diagonal(&SVector::<f64, 8>::from_column_slice(&q_diag))
    }

    fn measurement_noise(&self, mean: &Mean) -> SMatrix<f64, 4, 4> {
        let w = mean[2];
        let h = mean[3];
        let std = [
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
        ];
        SMatrix::<f64, 4, 4>::from_diagonal(&SVector::<f64, 4>::from_iterator(
            std.iter().map(|s| s * s),
        ))
    }

    fn project(&self, mean: &Mean, cov: &Cov) -> (SVector<f64, 4>, SMatrix<f64, 4, 4>) {
        let h = Self::measurement_matrix();
        let r = self.measurement_noise(mean);
        let projected_mean = h * mean;
        let projected_cov = h * cov * h.transpose() + r;
        (projected_mean, projected_cov)
    }

    fn is_finite(mean: &Mean, cov: &Cov) -> bool {
        mean.iter().all(|v| v.is_finite()) && cov.iter().all(|v| v.is_finite())
    }

    /// Advances every (mean, cov) pair by one step. Returns `None` for a pair whose
    /// result is non-finite (e.g. from an ill-conditioned covariance); the caller is
    /// expected to treat that as a `KalmanNumerical` failure for the corresponding track.
    pub fn multi_predict(&self, means: &[Mean], covs: &[Cov]) -> Vec<Option<(Mean, Cov)>> {
        let f = Self::transition_matrix();
        means
            .iter()
            .zip(covs.iter())
            .map(|(mean, cov)| {
                let q = self.process_noise(mean);
                let new_mean = f * mean;
                let new_cov = f * cov * f.transpose() + q;
                if Self::is_finite(&new_mean, &new_cov) {
                    Some((new_mean, new_cov))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Folds in a measurement for every (mean, cov, measurement) triple. Returns `None`
    /// when the innovation covariance is singular or the result is non-finite.
    pub fn multi_update(
        &self,
        means: &[Mean],
        covs: &[Cov],
        measurements: &[[f64; 4]],
    ) -> Vec<Option<(Mean, Cov)>> {
        let h = Self::measurement_matrix();
        means
            .iter()
            .zip(covs.iter())
            .zip(measurements.iter())
            .map(|((mean, cov), meas)| {
                let (projected_mean, projected_cov) = self.project(mean, cov);
                let Some(inv) = projected_cov.try_inverse() else {
                    return None;
                };
                let kalman_gain = cov * h.transpose() * inv;
                let measurement = SVector::<f64, 4>::from_column_slice(meas);
                let innovation = measurement - projected_mean;
                let new_mean = mean + kalman_gain * innovation;
                let new_cov = cov - kalman_gain * projected_cov * kalman_gain.transpose();
                if Self::is_finite(&new_mean, &new_cov) {
                    Some((new_mean, new_cov))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initiate_sets_position_and_zero_velocity() {
        let kf = KalmanFilterXywh::new();
        let (mean, _) = kf.initiate([10.0, 20.0, 4.0, 6.0]);
        assert_relative_eq!(mean[0], 10.0);
        assert_relative_eq!(mean[1], 20.0);
        assert_relative_eq!(mean[2], 4.0);
        assert_relative_eq!(mean[3], 6.0);
        assert_relative_eq!(mean[4], 0.0);
    }

    #[test]
    fn test_predict_advances_position_by_velocity() {
        let kf = KalmanFilterXywh::new();
        let (mut mean, cov) = kf.initiate([0.0, 0.0, 4.0, 4.0]);
        mean[4] = 1.0;
        mean[5] = 2.0;
        let result = kf.multi_predict(&[mean], &[cov]);
        let (new_mean, _) = result[0].expect("finite predict");
        assert_relative_eq!(new_mean[0], 1.0);
        assert_relative_eq!(new_mean[1], 2.0);
    }

    #[test]
    fn test_update_moves_mean_toward_measurement() {
        let kf = KalmanFilterXywh::new();
        let (mean, cov) = kf.initiate([0.0, 0.0, 4.0, 4.0]);
        let result = kf.multi_update(&[mean], &[cov], &[[10.0, 10.0, 4.0, 4.0]]);
        let (new_mean, _) = result[0].expect("finite update");
        assert!(new_mean[0] > 0.0 && new_mean[0] <= 10.0);
        assert!(new_mean[1] > 0.0 && new_mean[1] <= 10.0);
    }

    #[test]
    fn test_repeated_updates_converge_to_measurement() {
        let kf = KalmanFilterXywh::new();
        let (mut mean, mut cov) = kf.initiate([0.0, 0.0, 4.0, 4.0]);
        for _ in 0..50 {
            let predicted = kf.multi_predict(&[mean], &[cov])[0].unwrap();
            mean = predicted.0;
            cov = predicted.1;
            let updated = kf.multi_update(&[mean], &[cov], &[[10.0, 5.0, 4.0, 4.0]])[0].unwrap();
            mean = updated.0;
            cov = updated.1;
        }
        assert_relative_eq!(mean[0], 10.0, epsilon = 0.5);
        assert_relative_eq!(mean[1], 5.0, epsilon = 0.5);
    }
}
