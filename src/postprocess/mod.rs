//! 3D軌跡の後処理（欠損補間 → 平滑化）

pub mod filter;
pub mod interpolate;

pub use filter::{Filter, Smoother};
pub use interpolate::{gap_runs, GapFiller, GapRun};

use serde::Serialize;

use crate::config::{FilteringConfig, TriangulationConfig};
use crate::error::GapResolution;
use crate::triangulation::Keypoint3D;

/// 1人物・1関節の時系列（フレーム連番、欠損は None）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub person: usize,
    pub joint: usize,
    pub start_frame: usize,
    pub samples: Vec<Option<[f64; 3]>>,
}

impl Trajectory {
    pub fn new(person: usize, joint: usize, start_frame: usize, len: usize) -> Self {
        Self {
            person,
            joint,
            start_frame,
            samples: vec![None; len],
        }
    }

    /// [start_frame, end_frame) の範囲に該当する推定値を並べる
    pub fn from_keypoints<'a, I>(person: usize, joint: usize, start_frame: usize, end_frame: usize, keypoints: I) -> Self
    where
        I: IntoIterator<Item = &'a Keypoint3D>,
    {
        let mut traj = Self::new(person, joint, start_frame, end_frame.saturating_sub(start_frame));
        for kp in keypoints {
            if kp.person == person && kp.joint == joint {
                traj.set(kp.frame, kp.position);
            }
        }
        traj
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn end_frame(&self) -> usize {
        self.start_frame + self.samples.len()
    }

    pub fn get(&self, frame: usize) -> Option<[f64; 3]> {
        let i = frame.checked_sub(self.start_frame)?;
        self.samples.get(i).copied().flatten()
    }

    pub fn set(&mut self, frame: usize, position: [f64; 3]) {
        if let Some(slot) = frame
            .checked_sub(self.start_frame)
            .and_then(|i| self.samples.get_mut(i))
        {
            *slot = Some(position);
        }
    }

    pub fn missing_frames(&self) -> Vec<usize> {
        self.samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| self.start_frame + i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.iter().all(Option::is_some)
    }

    fn axis(&self, axis: usize) -> Vec<Option<f64>> {
        self.samples.iter().map(|s| s.map(|p| p[axis])).collect()
    }
}

/// 欠損補間とフィルタをまとめたもの（軌跡ごとに独立に適用）
#[derive(Debug, Clone)]
pub struct PostProcessor {
    filler: GapFiller,
    filter: Filter,
}

impl PostProcessor {
    pub fn new(filler: GapFiller, filter: Filter) -> Self {
        Self { filler, filter }
    }

    pub fn from_config(triangulation: &TriangulationConfig, filtering: &FilteringConfig, frame_rate: f64) -> Self {
        Self::new(
            GapFiller::new(
                triangulation.interpolation,
                triangulation.interp_if_gap_smaller_than,
                triangulation.fill_large_gaps_with,
            ),
            Filter::from_config(filtering, frame_rate),
        )
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// 欠損を埋め、(フレーム, 扱い) を返す
    pub fn fill_gaps(&self, traj: &mut Trajectory) -> Vec<(usize, GapResolution)> {
        self.filler
            .fill(&mut traj.samples)
            .into_iter()
            .map(|(i, r)| (traj.start_frame + i, r))
            .collect()
    }

    /// 軸ごとに平滑化（残った欠損は区切りとして扱う）
    pub fn smooth(&self, traj: &mut Trajectory) {
        let axes: Vec<Vec<Option<f64>>> = (0..3).map(|a| self.filter.smooth(&traj.axis(a))).collect();
        for (i, sample) in traj.samples.iter_mut().enumerate() {
            if let (Some(x), Some(y), Some(z)) = (axes[0][i], axes[1][i], axes[2][i]) {
                *sample = Some([x, y, z]);
            }
        }
    }

    pub fn process(&self, traj: &mut Trajectory) -> Vec<(usize, GapResolution)> {
        let resolutions = self.fill_gaps(traj);
        self.smooth(traj);
        resolutions
    }
}
