//! 軌跡の平滑化フィルタ
//!
//! どのフィルタも「欠損を含む実数列の平滑化」という同じ能力を [`Smoother`] として持ち、
//! 設定に応じて [`Filter`] のいずれかを実行時に選ぶ。

mod butterworth;
mod gaussian;
mod kalman;
mod loess;
mod median;
mod one_euro;

pub use butterworth::Butterworth;
pub use gaussian::Gaussian;
pub use kalman::Kalman;
pub use loess::Loess;
pub use median::Median;
pub use one_euro::OneEuro;

use crate::config::{FilterType, FilteringConfig};

pub trait Smoother {
    /// 欠損のない連続区間を平滑化する（出力長 = 入力長）
    fn smooth_run(&self, values: &[f64]) -> Vec<f64>;

    /// 欠損（None）で区切られた区間ごとに平滑化。欠損位置はそのまま
    fn smooth(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        let mut out = values.to_vec();
        let mut i = 0;
        while i < values.len() {
            if values[i].is_none() {
                i += 1;
                continue;
            }
            let start = i;
            let mut run = Vec::new();
            while let Some(Some(v)) = values.get(i) {
                run.push(*v);
                i += 1;
            }
            for (k, v) in self.smooth_run(&run).into_iter().enumerate() {
                out[start + k] = Some(v);
            }
        }
        out
    }
}

/// 設定で選ばれたフィルタ
#[derive(Debug, Clone)]
pub enum Filter {
    Butterworth(Butterworth),
    Kalman(Kalman),
    Gaussian(Gaussian),
    Loess(Loess),
    Median(Median),
    OneEuro(OneEuro),
    None,
}

impl Filter {
    pub fn from_config(config: &FilteringConfig, frame_rate: f64) -> Self {
        match config.filter_type {
            FilterType::Butterworth => Self::Butterworth(Butterworth::new(
                config.butterworth.order,
                config.butterworth.cut_off_frequency,
                frame_rate,
            )),
            FilterType::Kalman => Self::Kalman(Kalman::new(
                config.kalman.trust_ratio,
                config.kalman.smooth,
                frame_rate,
            )),
            FilterType::Gaussian => Self::Gaussian(Gaussian::new(config.gaussian.sigma_kernel)),
            FilterType::Loess => Self::Loess(Loess::new(config.loess.nb_values_used)),
            FilterType::Median => Self::Median(Median::new(config.median.kernel_size)),
            FilterType::OneEuro => Self::OneEuro(OneEuro::new(
                config.one_euro.min_cutoff,
                config.one_euro.beta,
                config.one_euro.d_cutoff,
                frame_rate,
            )),
            FilterType::None => Self::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Butterworth(_) => "butterworth",
            Self::Kalman(_) => "kalman",
            Self::Gaussian(_) => "gaussian",
            Self::Loess(_) => "LOESS",
            Self::Median(_) => "median",
            Self::OneEuro(_) => "one_euro",
            Self::None => "none",
        }
    }
}

impl Smoother for Filter {
    fn smooth_run(&self, values: &[f64]) -> Vec<f64> {
        match self {
            Self::Butterworth(f) => f.smooth_run(values),
            Self::Kalman(f) => f.smooth_run(values),
            Self::Gaussian(f) => f.smooth_run(values),
            Self::Loess(f) => f.smooth_run(values),
            Self::Median(f) => f.smooth_run(values),
            Self::OneEuro(f) => f.smooth_run(values),
            Self::None => values.to_vec(),
        }
    }
}
