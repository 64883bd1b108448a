use std::collections::BTreeMap;

use tracing::debug;

use super::{with_camera, Associator, DroppedGroup, FrameAssociation, PersonObservation, PersonTrack};
use crate::calibration::Camera;
use crate::config::{AssociationConfig, TriangulationConfig};
use crate::error::{GapReason, PipelineError};
use crate::pose::{Detection2D, Skeleton};
use crate::triangulation::{reprojection_errors, Observation, Triangulator};

/// 単一人物モード
///
/// 1回目: 各カメラで追跡キーポイントの信頼度が最大の検出を選び、仮の3D点を求める（外れカメラ除去つき）。
/// 2回目: 各カメラで仮の3D点への再投影誤差が最小の検出を選び、閾値以下のものだけを残す。
pub struct SinglePersonAssociator<'a> {
    cameras: &'a [Camera],
    triangulator: Triangulator<'a>,
    tracked: usize,
    likelihood_threshold: f64,
    threshold: f64,
    track: [PersonTrack; 1],
}

impl<'a> SinglePersonAssociator<'a> {
    pub fn new(
        cameras: &'a [Camera],
        skeleton: &Skeleton,
        association: &AssociationConfig,
        triangulation: &TriangulationConfig,
    ) -> Result<Self, PipelineError> {
        let name = &association.single_person.tracked_keypoint;
        let tracked = skeleton
            .joint_by_name(name)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "tracked_keypoint {:?} is not part of skeleton {}",
                    name,
                    skeleton.name()
                ))
            })?
            .id;

        let threshold = association.single_person.reproj_error_threshold_association;
        let provisional = TriangulationConfig {
            reproj_error_threshold_triangulation: threshold,
            likelihood_threshold_triangulation: association.likelihood_threshold_association,
            handle_lr_swap: false,
            ..triangulation.clone()
        };

        Ok(Self {
            cameras,
            triangulator: Triangulator::new(cameras, &provisional),
            tracked,
            likelihood_threshold: association.likelihood_threshold_association,
            threshold,
            track: [PersonTrack::new(0, 0)],
        })
    }

    /// (カメラ, 検出インデックス, 追跡キーポイントの観測)
    fn candidates(&self, detections: &[&[Detection2D]]) -> Vec<(usize, usize, Observation)> {
        detections
            .iter()
            .enumerate()
            .take(self.cameras.len())
            .flat_map(|(c, dets)| {
                dets.iter().enumerate().filter_map(move |(i, d)| {
                    d.valid(self.tracked, self.likelihood_threshold)
                        .map(|kp| (c, i, Observation::new(c, kp.x, kp.y, kp.confidence)))
                })
            })
            .collect()
    }
}

impl Associator for SinglePersonAssociator<'_> {
    fn associate(&mut self, frame: usize, detections: &[&[Detection2D]]) -> FrameAssociation {
        let mut result = FrameAssociation {
            frame,
            ..Default::default()
        };
        let candidates = self.candidates(detections);

        // 1回目: カメラごとに最も確からしい検出
        let mut best: BTreeMap<usize, Observation> = BTreeMap::new();
        for (c, _, obs) in &candidates {
            let replace = best.get(c).map_or(true, |b| obs.confidence > b.confidence);
            if replace {
                best.insert(*c, *obs);
            }
        }
        let first: Vec<Observation> = best.into_values().collect();

        let estimate = match self.triangulator.triangulate(&first) {
            Ok(est) => est,
            Err(reason) => {
                if reason != GapReason::InsufficientViews {
                    debug!(frame, "single person: provisional triangulation rejected");
                    result.dropped.push(DroppedGroup {
                        person: Some(0),
                        cameras: first.iter().map(|o| o.camera).collect(),
                    });
                }
                self.track[0].miss(usize::MAX);
                return result;
            }
        };

        // 2回目: 仮の3D点に最も合う検出
        let mut chosen: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
        for (c, i, obs) in &candidates {
            let prepared = self.triangulator.prepare(std::slice::from_ref(obs));
            let Some(err) = reprojection_errors(self.cameras, &estimate.position, &prepared).first().copied() else {
                continue;
            };
            if err > self.threshold {
                continue;
            }
            if chosen.get(c).map_or(true, |(_, e)| err < *e) {
                chosen.insert(*c, (*i, err));
            }
        }

        let views: Vec<Detection2D> = chosen
            .iter()
            .map(|(&c, &(i, _))| with_camera(&detections[c][i], c))
            .collect();
        let indices = chosen.iter().map(|(&c, &(i, _))| (c, i)).collect();
        self.track[0].hit(frame, Some(estimate.position), indices);

        result.persons.push(PersonObservation { person: 0, views });
        result
    }

    fn tracks(&self) -> &[PersonTrack] {
        &self.track
    }
}
