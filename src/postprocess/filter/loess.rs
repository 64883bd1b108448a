/// LOESS（局所線形回帰、トライキューブ重み）
///
/// 各点で近傍 `window` 点に重み付き直線を当てはめる。端では窓を内側にずらす。
#[derive(Debug, Clone)]
pub struct Loess {
    window: usize,
}

impl Loess {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }
}

fn tricube(u: f64) -> f64 {
    let u = u.abs();
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u * u * u).powi(3)
    }
}

impl super::Smoother for Loess {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        let k = self.window.min(n);
        (0..n)
            .map(|i| {
                let lo = i.saturating_sub(k / 2).min(n - k);
                let idx = lo..lo + k;
                let h = idx.clone().map(|j| j.abs_diff(i)).max().unwrap_or(0);
                if h == 0 {
                    return values[i];
                }

                let w: Vec<f64> = idx.clone().map(|j| tricube(j.abs_diff(i) as f64 / h as f64)).collect();
                let sw: f64 = w.iter().sum();
                let mx = idx.clone().zip(&w).map(|(j, wj)| wj * j as f64).sum::<f64>() / sw;
                let my = idx.clone().zip(&w).map(|(j, wj)| wj * values[j]).sum::<f64>() / sw;
                let (sxx, sxy) = idx.zip(&w).fold((0.0, 0.0), |(sxx, sxy), (j, wj)| {
                    let dx = j as f64 - mx;
                    (sxx + wj * dx * dx, sxy + wj * dx * (values[j] - my))
                });
                if sxx < 1e-12 {
                    my
                } else {
                    my + sxy / sxx * (i as f64 - mx)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Smoother;
    use super::*;

    #[test]
    fn test_line_is_reproduced() {
        let x: Vec<f64> = (0..20).map(|i| 3.0 - 0.25 * i as f64).collect();
        let y = Loess::new(7).smooth_run(&x);
        for (a, b) in x.iter().zip(&y) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_spike_reduced() {
        let mut x = vec![0.0; 15];
        x[7] = 1.0;
        let y = Loess::new(9).smooth_run(&x);
        assert!(y[7] < 0.6);
    }
}
