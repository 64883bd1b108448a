use nalgebra::{Matrix3, RowVector3, Vector3};

/// 等加速度モデルのカルマンフィルタ（任意で RTS スムーザ）
///
/// 観測ノイズの標準偏差を1、プロセスノイズ（ジャーク）の標準偏差を `trust_ratio` とする。
/// 比が大きいほど観測を信用し、平滑化は弱くなる。
#[derive(Debug, Clone)]
pub struct Kalman {
    transition: Matrix3<f64>,
    process_noise: Matrix3<f64>,
    measurement_noise: f64,
    smooth: bool,
}

impl Kalman {
    pub fn new(trust_ratio: f64, smooth: bool, frame_rate: f64) -> Self {
        let dt = 1.0 / frame_rate;
        let transition = Matrix3::new(
            1.0, dt, 0.5 * dt * dt,
            0.0, 1.0, dt,
            0.0, 0.0, 1.0,
        );
        // 区分一定ジャークの離散化
        let g = Vector3::new(0.5 * dt * dt, dt, 1.0);
        let process_noise = g * g.transpose() * trust_ratio * trust_ratio;
        Self {
            transition,
            process_noise,
            measurement_noise: 1.0,
            smooth,
        }
    }
}

impl super::Smoother for Kalman {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let Some(&first) = values.first() else {
            return Vec::new();
        };
        let f = &self.transition;
        let h = RowVector3::new(1.0, 0.0, 0.0);
        let r = self.measurement_noise;

        let mut x = Vector3::new(first, 0.0, 0.0);
        let mut p = Matrix3::from_diagonal(&Vector3::new(r, 1e2, 1e4));

        let n = values.len();
        let mut filtered = Vec::with_capacity(n);
        let mut covariances = Vec::with_capacity(n);
        let mut predicted = Vec::with_capacity(n);
        let mut predicted_cov = Vec::with_capacity(n);

        for (k, &z) in values.iter().enumerate() {
            if k > 0 {
                x = f * x;
                p = f * p * f.transpose() + self.process_noise;
            }
            predicted.push(x);
            predicted_cov.push(p);

            let s = (h * p * h.transpose())[0] + r;
            let gain = p * h.transpose() / s;
            x += gain * (z - (h * x)[0]);
            p -= gain * h * p;

            filtered.push(x);
            covariances.push(p);
        }

        if self.smooth {
            // Rauch-Tung-Striebel
            for k in (0..n.saturating_sub(1)).rev() {
                let Some(pred_inv) = predicted_cov[k + 1].try_inverse() else {
                    continue;
                };
                let c = covariances[k] * f.transpose() * pred_inv;
                filtered[k] = filtered[k] + c * (filtered[k + 1] - predicted[k + 1]);
                covariances[k] = covariances[k] + c * (covariances[k + 1] - predicted_cov[k + 1]) * c.transpose();
            }
        }

        filtered.iter().map(|s| s[0]).collect()
    }
}
