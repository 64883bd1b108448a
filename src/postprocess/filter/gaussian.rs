/// ガウシアン平滑化（端は反射、4σ で打ち切り）
#[derive(Debug, Clone)]
pub struct Gaussian {
    weights: Vec<f64>,
}

impl Gaussian {
    pub fn new(sigma: f64) -> Self {
        let sigma = sigma.max(1e-6);
        let radius = (4.0 * sigma + 0.5) as i64;
        let raw: Vec<f64> = (-radius..=radius)
            .map(|k| (-0.5 * (k as f64 / sigma).powi(2)).exp())
            .collect();
        let sum: f64 = raw.iter().sum();
        Self {
            weights: raw.into_iter().map(|w| w / sum).collect(),
        }
    }

    fn radius(&self) -> i64 {
        (self.weights.len() / 2) as i64
    }
}

/// d c b a | a b c d | d c b a
fn reflect(i: i64, n: usize) -> usize {
    let period = 2 * n as i64;
    let i = i.rem_euclid(period);
    if i < n as i64 {
        i as usize
    } else {
        (period - 1 - i) as usize
    }
}

impl super::Smoother for Gaussian {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        let r = self.radius();
        (0..n as i64)
            .map(|i| {
                self.weights
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * values[reflect(i + k as i64 - r, n)])
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Smoother;
    use super::*;

    #[test]
    fn test_reflect() {
        let idx: Vec<usize> = (-3..7).map(|i| reflect(i, 4)).collect();
        assert_eq!(idx, vec![2, 1, 0, 0, 1, 2, 3, 3, 2, 1]);
    }

    #[test]
    fn test_weights_normalized() {
        let g = Gaussian::new(2.0);
        assert_eq!(g.weights.len(), 17);
        assert!((g.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_impulse_spreads_symmetrically() {
        let mut x = vec![0.0; 21];
        x[10] = 1.0;
        let y = Gaussian::new(1.0).smooth_run(&x);
        assert!(y[10] < 1.0);
        assert!((y[9] - y[11]).abs() < 1e-12);
        assert!((y.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
