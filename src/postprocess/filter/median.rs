/// メディアンフィルタ（端では対称に窓を縮める）
#[derive(Debug, Clone)]
pub struct Median {
    half: usize,
}

impl Median {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            half: kernel_size / 2,
        }
    }
}

impl super::Smoother for Median {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        let mut window = Vec::with_capacity(2 * self.half + 1);
        (0..n)
            .map(|i| {
                let h = self.half.min(i).min(n - 1 - i);
                window.clear();
                window.extend_from_slice(&values[i - h..=i + h]);
                window.sort_by(|a, b| a.total_cmp(b));
                window[h]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Smoother;
    use super::*;

    #[test]
    fn test_removes_single_outlier() {
        let x = [1.0, 1.0, 9.0, 1.0, 1.0];
        assert_eq!(Median::new(3).smooth_run(&x), vec![1.0; 5]);
    }

    #[test]
    fn test_edges_untouched() {
        let x = [5.0, 1.0, 2.0, 3.0, -4.0];
        let y = Median::new(5).smooth_run(&x);
        assert_eq!(y[0], 5.0);
        assert_eq!(y[4], -4.0);
        // i=1 は窓 3、i=2 は窓 5
        assert_eq!(y[1], 2.0);
        assert_eq!(y[2], 2.0);
    }
}
