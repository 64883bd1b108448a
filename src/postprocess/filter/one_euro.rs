/// Low-pass filter component
#[derive(Debug, Clone, Default)]
struct LowPassFilter {
    prev: Option<f64>,
}

impl LowPassFilter {
    fn filter(&mut self, value: f64, alpha: f64) -> f64 {
        let result = match self.prev {
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
            None => value,
        };
        self.prev = Some(result);
        result
    }
}

/// alpha = 1 / (1 + tau/Te), tau = 1/(2*pi*fc)
fn smoothing_factor(te: f64, cutoff: f64) -> f64 {
    let r = 2.0 * std::f64::consts::PI * cutoff * te;
    r / (r + 1.0)
}

/// One Euro Filter（因果、速度に応じて遮断周波数を上げる）
///
/// サンプル間隔はフレームレートから固定で決まる。
#[derive(Debug, Clone)]
pub struct OneEuro {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    dt: f64,
}

impl OneEuro {
    pub fn new(min_cutoff: f64, beta: f64, d_cutoff: f64, frame_rate: f64) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff,
            dt: 1.0 / frame_rate,
        }
    }
}

impl super::Smoother for OneEuro {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let mut x_filter = LowPassFilter::default();
        let mut dx_filter = LowPassFilter::default();
        let mut prev: Option<f64> = None;

        values
            .iter()
            .map(|&value| {
                let dx = prev.map_or(0.0, |p| (value - p) / self.dt);
                prev = Some(value);
                let edx = dx_filter.filter(dx, smoothing_factor(self.dt, self.d_cutoff));
                let cutoff = self.min_cutoff + self.beta * edx.abs();
                x_filter.filter(value, smoothing_factor(self.dt, cutoff))
            })
            .collect()
    }
}
