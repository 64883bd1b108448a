/// ゼロ位相 Butterworth ローパス
///
/// 前後2回かけるので各パスの次数は指定の半分。双一次変換（プリワープ込み）の
/// 2次セクションを縦続接続し、端は奇対称延長でパディングする。
#[derive(Debug, Clone)]
pub struct Butterworth {
    sections: Vec<Biquad>,
}

/// 直接形II転置の2次セクション（a0 = 1 に正規化）
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn lowpass(cutoff: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * cutoff / fs;
        let alpha = w0.sin() / (2.0 * q);
        let c = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 - c) / 2.0 / a0,
            b1: (1.0 - c) / a0,
            b2: (1.0 - c) / 2.0 / a0,
            a1: -2.0 * c / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn first_order(cutoff: f64, fs: f64) -> Self {
        let k = (std::f64::consts::PI * cutoff / fs).tan();
        let b0 = k / (1.0 + k);
        Self {
            b0,
            b1: b0,
            b2: 0.0,
            a1: (k - 1.0) / (k + 1.0),
            a2: 0.0,
        }
    }

    /// 先頭値が定常状態になるよう内部状態を初期化してかける（DCゲイン1）
    fn run(&self, x: &[f64]) -> Vec<f64> {
        let Some(&x0) = x.first() else {
            return Vec::new();
        };
        let mut z1 = x0 * (1.0 - self.b0);
        let mut z2 = x0 * (self.b2 - self.a2);
        x.iter()
            .map(|&v| {
                let y = self.b0 * v + z1;
                z1 = self.b1 * v - self.a1 * y + z2;
                z2 = self.b2 * v - self.a2 * y;
                y
            })
            .collect()
    }
}

impl Butterworth {
    pub fn new(order: usize, cutoff: f64, frame_rate: f64) -> Self {
        let pass_order = (order / 2).max(1);
        // Nyquist 以上は意味がないので手前で止める
        let cutoff = cutoff.min(frame_rate * 0.499);
        let mut sections: Vec<Biquad> = (1..=pass_order / 2)
            .map(|k| {
                let angle = std::f64::consts::PI * (2 * k - 1) as f64 / (2 * pass_order) as f64;
                Biquad::lowpass(cutoff, frame_rate, 1.0 / (2.0 * angle.cos()))
            })
            .collect();
        if pass_order % 2 == 1 {
            sections.push(Biquad::first_order(cutoff, frame_rate));
        }
        Self { sections }
    }

    fn cascade(&self, x: &[f64]) -> Vec<f64> {
        self.sections
            .iter()
            .fold(x.to_vec(), |acc, section| section.run(&acc))
    }
}

impl super::Smoother for Butterworth {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        if n < 2 {
            return values.to_vec();
        }
        let pad = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let (first, last) = (values[0], values[n - 1]);

        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - values[i]));
        ext.extend_from_slice(values);
        ext.extend((1..=pad).map(|i| 2.0 * last - values[n - 1 - i]));

        let mut y = self.cascade(&ext);
        y.reverse();
        let mut y = self.cascade(&y);
        y.reverse();
        y[pad..pad + n].to_vec()
    }
}
