use std::collections::BTreeMap;

use nalgebra::{Matrix4, Point2, Point3, Vector4};
use serde::Serialize;

use crate::calibration::Camera;
use crate::config::TriangulationConfig;
use crate::error::GapReason;
use crate::pose::{Detection2D, Skeleton};

// --- データ構造 ---

/// 1台のカメラによる1関節の2D観測
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// `CalibrationStore` 内のカメラ番号
    pub camera: usize,
    pub point: Point2<f64>,
    pub confidence: f64,
}

impl Observation {
    pub fn new(camera: usize, x: f64, y: f64, confidence: f64) -> Self {
        Self {
            camera,
            point: Point2::new(x, y),
            confidence,
        }
    }
}

/// 三角測量結果
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub position: Point3<f64>,
    /// 採用カメラでの平均再投影誤差（ピクセル）
    pub residual: f64,
    /// 採用カメラ（昇順）
    pub cameras: Vec<usize>,
}

/// 1フレーム・1人物・1関節の3D推定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keypoint3D {
    pub joint: usize,
    pub frame: usize,
    pub person: usize,
    pub position: [f64; 3],
    pub residual: f64,
    pub cameras: Vec<usize>,
}

/// 1フレーム・1人物の再構成結果
#[derive(Debug, Clone, Default)]
pub struct PersonReconstruction {
    pub keypoints: Vec<Keypoint3D>,
    /// 再構成できなかった関節と理由
    pub gaps: Vec<(usize, GapReason)>,
    /// 左右入れ替えを適用した (関節ペア, カメラ)
    pub swaps: Vec<((usize, usize), usize)>,
}

// --- 線形三角測量 ---

/// 信頼度重み付きDLT
///
/// 各観測について x × (P · X) = 0 の2行を信頼度倍して積み、
/// A^T A の最小固有値に対応する固有ベクトルを解とする。
pub fn triangulate_weighted(cameras: &[Camera], observations: &[Observation]) -> Option<Point3<f64>> {
    if observations.len() < 2 {
        return None;
    }

    let mut ata = Matrix4::zeros();
    for obs in observations {
        let p = cameras.get(obs.camera)?.projection();
        let (u, v) = (obs.point.x, obs.point.y);
        let w = obs.confidence;

        // row1: u * P[2] - P[0], row2: v * P[2] - P[1]
        let row1 = Vector4::new(
            u * p[(2, 0)] - p[(0, 0)],
            u * p[(2, 1)] - p[(0, 1)],
            u * p[(2, 2)] - p[(0, 2)],
            u * p[(2, 3)] - p[(0, 3)],
        ) * w;
        let row2 = Vector4::new(
            v * p[(2, 0)] - p[(1, 0)],
            v * p[(2, 1)] - p[(1, 1)],
            v * p[(2, 2)] - p[(1, 2)],
            v * p[(2, 3)] - p[(1, 3)],
        ) * w;

        ata += row1 * row1.transpose();
        ata += row2 * row2.transpose();
    }

    let eigen = ata.symmetric_eigen();
    let min_idx = eigen.eigenvalues.iamin();
    let x = eigen.eigenvectors.column(min_idx);
    let w = x[3];
    if w.abs() < 1e-12 {
        return None;
    }
    let point = Point3::new(x[0] / w, x[1] / w, x[2] / w);
    point.coords.iter().all(|c| c.is_finite()).then_some(point)
}

/// 観測ごとの再投影誤差（カメラ後方なら無限大）
pub fn reprojection_errors(cameras: &[Camera], point: &Point3<f64>, observations: &[Observation]) -> Vec<f64> {
    observations
        .iter()
        .map(|obs| {
            cameras
                .get(obs.camera)
                .and_then(|cam| cam.project(point))
                .map(|p| (p - obs.point).norm())
                .unwrap_or(f64::INFINITY)
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 全観測を使ったDLTの (平均, 最大) 再投影誤差（解けなければ無限大）
fn baseline_errors(cameras: &[Camera], observations: &[Observation], min_cameras: usize) -> (f64, f64) {
    if observations.len() < min_cameras {
        return (f64::INFINITY, f64::INFINITY);
    }
    match triangulate_weighted(cameras, observations) {
        Some(p) => {
            let errors = reprojection_errors(cameras, &p, observations);
            (mean(&errors), errors.iter().copied().fold(0.0, f64::max))
        }
        None => (f64::INFINITY, f64::INFINITY),
    }
}

/// 外れカメラ除去つき三角測量
///
/// 最大誤差のカメラが閾値を超え、かつ除去後も `min_cameras` 台残る間、
/// そのカメラを外して解き直す。最終的な平均誤差が閾値を超えていれば欠損。
pub fn triangulate_robust(
    cameras: &[Camera],
    observations: &[Observation],
    threshold: f64,
    min_cameras: usize,
) -> Result<Estimate, GapReason> {
    let min_cameras = min_cameras.max(2);
    if observations.len() < min_cameras {
        return Err(GapReason::InsufficientViews);
    }

    let mut active: Vec<Observation> = observations.to_vec();
    // 1反復で必ず1台減るので高々 n - min 回で終わる
    for _ in 0..=observations.len() {
        let point = triangulate_weighted(cameras, &active).ok_or(GapReason::ExcessiveReprojectionError)?;
        let errors = reprojection_errors(cameras, &point, &active);

        let (worst, worst_err) = errors
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, e)| if e > best.1 { (i, e) } else { best });

        if worst_err > threshold && active.len() > min_cameras {
            active.remove(worst);
            continue;
        }

        let residual = mean(&errors);
        if residual > threshold {
            return Err(GapReason::ExcessiveReprojectionError);
        }
        let mut used: Vec<usize> = active.iter().map(|o| o.camera).collect();
        used.sort_unstable();
        return Ok(Estimate {
            position: point,
            residual,
            cameras: used,
        });
    }
    Err(GapReason::ExcessiveReprojectionError)
}

// --- Triangulator ---

/// キャリブレーションと設定を束ねた三角測量器
pub struct Triangulator<'a> {
    cameras: &'a [Camera],
    threshold: f64,
    likelihood_threshold: f64,
    min_cameras: usize,
    undistort: bool,
    handle_lr_swap: bool,
    excluded: Vec<bool>,
}

impl<'a> Triangulator<'a> {
    pub fn new(cameras: &'a [Camera], config: &TriangulationConfig) -> Self {
        Self {
            cameras,
            threshold: config.reproj_error_threshold_triangulation,
            likelihood_threshold: config.likelihood_threshold_triangulation,
            min_cameras: config.min_cameras_for_triangulation,
            undistort: config.undistort_points,
            handle_lr_swap: config.handle_lr_swap,
            excluded: vec![false; cameras.len()],
        }
    }

    /// 同期失敗などで除外するカメラ
    pub fn with_excluded(mut self, excluded: &[usize]) -> Self {
        for &i in excluded {
            if let Some(flag) = self.excluded.get_mut(i) {
                *flag = true;
            }
        }
        self
    }

    pub fn cameras(&self) -> &[Camera] {
        self.cameras
    }

    pub fn min_cameras(&self) -> usize {
        self.min_cameras
    }

    /// 信頼度・除外カメラで絞り込み、必要なら歪み補正した観測列
    pub fn prepare(&self, observations: &[Observation]) -> Vec<Observation> {
        observations
            .iter()
            .filter(|o| o.camera < self.cameras.len() && !self.excluded[o.camera])
            .filter(|o| o.confidence > 0.0 && o.confidence >= self.likelihood_threshold)
            .filter(|o| o.point.x.is_finite() && o.point.y.is_finite())
            .map(|o| {
                if self.undistort {
                    let (u, v) = self.cameras[o.camera].undistort_point(o.point.x, o.point.y);
                    Observation { point: Point2::new(u, v), ..*o }
                } else {
                    *o
                }
            })
            .collect()
    }

    /// 1関節の三角測量（前処理込み）
    pub fn triangulate(&self, observations: &[Observation]) -> Result<Estimate, GapReason> {
        let prepared = self.prepare(observations);
        triangulate_robust(self.cameras, &prepared, self.threshold, self.min_cameras)
    }

    /// 1人物の全関節を再構成
    ///
    /// `views` は人物に対応付けられた各カメラの検出（`Detection2D::camera` がカメラ番号）
    pub fn reconstruct_person(
        &self,
        skeleton: &Skeleton,
        frame: usize,
        person: usize,
        views: &[&Detection2D],
    ) -> PersonReconstruction {
        let mut obs: BTreeMap<usize, Vec<Observation>> = skeleton
            .ids()
            .into_iter()
            .map(|id| {
                let list = views
                    .iter()
                    .filter_map(|d| {
                        d.get(id)
                            .map(|kp| Observation::new(d.camera, kp.x, kp.y, kp.confidence))
                    })
                    .collect::<Vec<_>>();
                (id, self.prepare(&list))
            })
            .collect();

        let mut swaps = Vec::new();
        if self.handle_lr_swap {
            for (left, right) in skeleton.symmetric_pairs() {
                let (Some(l), Some(r)) = (obs.get(&left), obs.get(&right)) else {
                    continue;
                };
                if let Some((l_new, r_new, swapped)) = self.resolve_lr_swap(l, r) {
                    for cam in swapped {
                        swaps.push(((left, right), cam));
                    }
                    obs.insert(left, l_new);
                    obs.insert(right, r_new);
                }
            }
        }

        let mut result = PersonReconstruction {
            swaps,
            ..Default::default()
        };
        for (joint, list) in obs {
            match triangulate_robust(self.cameras, &list, self.threshold, self.min_cameras) {
                Ok(est) => result.keypoints.push(Keypoint3D {
                    joint,
                    frame,
                    person,
                    position: [est.position.x, est.position.y, est.position.z],
                    residual: est.residual,
                    cameras: est.cameras,
                }),
                Err(reason) => result.gaps.push((joint, reason)),
            }
        }
        result
    }

    /// 左右ペアの取り違え補正
    ///
    /// どちらかの全カメラDLTで最大誤差が閾値を超えるとき、カメラ単位で左右を入れ替えた候補を試し、
    /// 合計誤差が最も下がる入れ替えを1つずつ採用する。変更がなければ None。
    fn resolve_lr_swap(
        &self,
        left: &[Observation],
        right: &[Observation],
    ) -> Option<(Vec<Observation>, Vec<Observation>, Vec<usize>)> {
        let combined = |l: &[Observation], r: &[Observation]| {
            baseline_errors(self.cameras, l, self.min_cameras).0
                + baseline_errors(self.cameras, r, self.min_cameras).0
        };

        let (_, l_max) = baseline_errors(self.cameras, left, self.min_cameras);
        let (_, r_max) = baseline_errors(self.cameras, right, self.min_cameras);
        if l_max <= self.threshold && r_max <= self.threshold {
            return None;
        }

        // 両方の観測があるカメラのみ入れ替え候補
        let candidates: Vec<usize> = left
            .iter()
            .map(|o| o.camera)
            .filter(|c| right.iter().any(|o| o.camera == *c))
            .collect();

        let mut l = left.to_vec();
        let mut r = right.to_vec();
        let mut current = combined(&l, &r);
        let mut swapped = Vec::new();

        for _ in 0..candidates.len() {
            let mut best: Option<(usize, f64)> = None;
            for &cam in candidates.iter().filter(|c| !swapped.contains(*c)) {
                let (tl, tr) = swap_camera(&l, &r, cam);
                let err = combined(&tl, &tr);
                if err < current && best.map_or(true, |(_, b)| err < b) {
                    best = Some((cam, err));
                }
            }
            let Some((cam, err)) = best else { break };
            let (tl, tr) = swap_camera(&l, &r, cam);
            l = tl;
            r = tr;
            current = err;
            swapped.push(cam);
        }

        if swapped.is_empty() {
            return None;
        }
        swapped.sort_unstable();
        Some((l, r, swapped))
    }
}

fn swap_camera(left: &[Observation], right: &[Observation], camera: usize) -> (Vec<Observation>, Vec<Observation>) {
    let pick = |list: &[Observation]| list.iter().find(|o| o.camera == camera).copied();
    let (Some(lo), Some(ro)) = (pick(left), pick(right)) else {
        return (left.to_vec(), right.to_vec());
    };
    let replace = |list: &[Observation], with: Observation| {
        list.iter()
            .map(|o| if o.camera == camera { with } else { *o })
            .collect::<Vec<_>>()
    };
    (replace(left, ro), replace(right, lo))
}
