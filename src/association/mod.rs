//! カメラ間の人物対応付け
//!
//! フレームごとに各カメラの検出を人物単位にまとめ、トラックIDを付ける。
//! 単一人物モード（[`SinglePersonAssociator`]）と複数人物モード（[`MultiPersonAssociator`]）がある。

pub mod multi;
pub mod single;
pub mod track;

pub use multi::MultiPersonAssociator;
pub use single::SinglePersonAssociator;
pub use track::{PersonTrack, TrackState};

use crate::calibration::Camera;
use crate::config::{AssociationConfig, TriangulationConfig};
use crate::error::PipelineError;
use crate::pose::{Detection2D, Skeleton};
use crate::triangulation::Observation;

/// 1人物に対応付けられた検出（カメラごとに高々1つ、`camera` 昇順）
#[derive(Debug, Clone, PartialEq)]
pub struct PersonObservation {
    pub person: usize,
    pub views: Vec<Detection2D>,
}

impl PersonObservation {
    pub fn cameras(&self) -> Vec<usize> {
        self.views.iter().map(|d| d.camera).collect()
    }
}

/// 対応付けできず破棄されたグループ
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedGroup {
    /// 既存トラックに属すると分かっている場合のみ
    pub person: Option<usize>,
    pub cameras: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAssociation {
    pub frame: usize,
    /// トラックID 昇順
    pub persons: Vec<PersonObservation>,
    pub dropped: Vec<DroppedGroup>,
}

pub trait Associator {
    /// `detections[c]` はカメラ c のこのフレームの検出。フレームは昇順に与えること
    fn associate(&mut self, frame: usize, detections: &[&[Detection2D]]) -> FrameAssociation;

    /// これまでに作られた全トラック（終了済みを含む）
    fn tracks(&self) -> &[PersonTrack];
}

/// 設定に応じた対応付け器
pub fn from_config<'a>(
    multi_person: bool,
    cameras: &'a [Camera],
    skeleton: &Skeleton,
    association: &AssociationConfig,
    triangulation: &TriangulationConfig,
) -> Result<Box<dyn Associator + 'a>, PipelineError> {
    if multi_person {
        Ok(Box::new(MultiPersonAssociator::new(
            cameras,
            association,
            triangulation,
        )))
    } else {
        Ok(Box::new(SinglePersonAssociator::new(
            cameras,
            skeleton,
            association,
            triangulation,
        )?))
    }
}

/// 検出 `det` の関節 `joint` を観測に変換（閾値未満は None）
pub(crate) fn observation(det: &Detection2D, joint: usize, threshold: f64) -> Option<Observation> {
    det.valid(joint, threshold)
        .map(|kp| Observation::new(det.camera, kp.x, kp.y, kp.confidence))
}

/// カメラ番号を付け直した検出のコピー
pub(crate) fn with_camera(det: &Detection2D, camera: usize) -> Detection2D {
    Detection2D {
        camera,
        ..det.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use nalgebra::Point3;

    use crate::calibration::Camera;
    use crate::pose::{Detection2D, Keypoint2D, Skeleton};

    /// 重心 (x, y) に立つ人物の主要関節（HALPE_26 の関節ID → 位置）
    pub(crate) fn body(skeleton: &Skeleton, x: f64, y: f64) -> Vec<(usize, Point3<f64>)> {
        [
            ("Hip", 0.0, 0.0, 0.95),
            ("Neck", 0.0, 0.0, 1.45),
            ("Head", 0.0, 0.02, 1.7),
            ("RShoulder", -0.18, 0.0, 1.42),
            ("LShoulder", 0.18, 0.0, 1.42),
            ("RWrist", -0.3, 0.1, 0.9),
            ("LWrist", 0.3, 0.1, 0.9),
            ("RKnee", -0.1, 0.02, 0.5),
            ("LKnee", 0.1, 0.02, 0.5),
            ("RAnkle", -0.1, 0.0, 0.08),
            ("LAnkle", 0.1, 0.0, 0.08),
        ]
        .iter()
        .filter_map(|(name, dx, dy, z)| {
            skeleton
                .joint_by_name(name)
                .map(|j| (j.id, Point3::new(x + dx, y + dy, *z)))
        })
        .collect()
    }

    /// 各カメラへの投影（信頼度 0.9）
    pub(crate) fn project_body(
        cameras: &[Camera],
        frame: usize,
        joints: &[(usize, Point3<f64>)],
    ) -> Vec<Detection2D> {
        cameras
            .iter()
            .enumerate()
            .map(|(c, cam)| {
                joints.iter().fold(Detection2D::new(c, frame), |det, (id, p)| match cam.project(p) {
                    Some(px) => det.with_keypoint(*id, Keypoint2D::new(px.x, px.y, 0.9)),
                    None => det,
                })
            })
            .collect()
    }
}
