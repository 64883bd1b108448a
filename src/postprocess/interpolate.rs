//! 欠損区間の補間
//!
//! 両端に既知値がある `max_gap` 以下の区間は補間、それ以外（長い区間・先頭末尾）は
//! [`FillPolicy`] に従う。

use crate::config::{FillPolicy, InterpolationKind};
use crate::error::GapResolution;

/// 欠損区間 [start, start + len)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRun {
    pub start: usize,
    pub len: usize,
}

impl GapRun {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// None が連続する区間を列挙
pub fn gap_runs<T>(samples: &[Option<T>]) -> Vec<GapRun> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < samples.len() {
        if samples[i].is_some() {
            i += 1;
            continue;
        }
        let start = i;
        while i < samples.len() && samples[i].is_none() {
            i += 1;
        }
        runs.push(GapRun {
            start,
            len: i - start,
        });
    }
    runs
}

#[derive(Debug, Clone, Copy)]
pub struct GapFiller {
    pub kind: InterpolationKind,
    /// この長さ以下の内部欠損を補間
    pub max_gap: usize,
    pub policy: FillPolicy,
}

impl GapFiller {
    pub fn new(kind: InterpolationKind, max_gap: usize, policy: FillPolicy) -> Self {
        Self {
            kind,
            max_gap,
            policy,
        }
    }

    /// 欠損を埋め、埋めた（または埋めなかった）インデックスとその扱いを返す
    pub fn fill<const N: usize>(&self, samples: &mut [Option<[f64; N]>]) -> Vec<(usize, GapResolution)> {
        let runs = gap_runs(samples);
        let mut resolutions = Vec::new();
        if runs.is_empty() {
            return resolutions;
        }
        // 既知値が1つもなければ何もできない
        if runs.len() == 1 && runs[0].len == samples.len() {
            resolutions.extend((0..samples.len()).map(|i| (i, GapResolution::Unfilled)));
            return resolutions;
        }

        for run in runs {
            let interior = run.start > 0 && run.end() < samples.len();
            if interior && run.len <= self.max_gap {
                self.interpolate_run(samples, run);
                resolutions.extend((run.start..run.end()).map(|i| (i, GapResolution::Interpolated)));
                continue;
            }

            let resolution = match self.policy {
                FillPolicy::Nan => GapResolution::Unfilled,
                FillPolicy::Zeros => {
                    for s in &mut samples[run.start..run.end()] {
                        *s = Some([0.0; N]);
                    }
                    GapResolution::Zeroed
                }
                FillPolicy::LastValue => {
                    // 先頭の欠損は最初の既知値で埋める
                    let held = if run.start > 0 {
                        samples[run.start - 1]
                    } else {
                        samples[run.end()]
                    };
                    for s in &mut samples[run.start..run.end()] {
                        *s = held;
                    }
                    GapResolution::Held
                }
            };
            resolutions.extend((run.start..run.end()).map(|i| (i, resolution)));
        }
        resolutions
    }

    fn interpolate_run<const N: usize>(&self, samples: &mut [Option<[f64; N]>], run: GapRun) {
        let i0 = run.start - 1;
        let i1 = run.end();
        let (Some(a), Some(b)) = (samples[i0], samples[i1]) else {
            return;
        };
        let span = (i1 - i0) as f64;

        // 補間区間外側の隣接値（3次補間の接線用）
        let before = i0.checked_sub(1).and_then(|i| samples[i]);
        let after = samples.get(i1 + 1).copied().flatten();

        for k in run.start..run.end() {
            let t = (k - i0) as f64 / span;
            let mut value = [0.0; N];
            for axis in 0..N {
                value[axis] = match self.kind {
                    InterpolationKind::Linear => lerp(a[axis], b[axis], t),
                    InterpolationKind::Nearest => {
                        if t <= 0.5 {
                            a[axis]
                        } else {
                            b[axis]
                        }
                    }
                    InterpolationKind::Cubic => {
                        let secant = b[axis] - a[axis];
                        // 接線は1フレームあたりの傾き×区間長
                        let m0 = before.map_or(secant, |p| (a[axis] - p[axis]) * span);
                        let m1 = after.map_or(secant, |n| (n[axis] - b[axis]) * span);
                        hermite(a[axis], b[axis], m0, m1, t)
                    }
                };
            }
            samples[k] = Some(value);
        }
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    (1.0 - t) * a + t * b
}

fn hermite(p0: f64, p1: f64, m0: f64, m1: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    (2.0 * t3 - 3.0 * t2 + 1.0) * p0 + (t3 - 2.0 * t2 + t) * m0 + (-2.0 * t3 + 3.0 * t2) * p1 + (t3 - t2) * m1
}
